//! Linear chain matching against a pattern.

use smallvec::SmallVec;
use tgc_graph::{Graph, NodeId, Shape};
use tracing::trace;

use super::pattern::Pattern;

/// A successfully matched chain of graph nodes.
#[derive(Clone, Debug)]
pub(crate) struct MatchedChain {
    /// Matched nodes in data-flow order; same length as the pattern.
    pub nodes: SmallVec<[NodeId; 8]>,
    /// The terminal node's known output shape.
    pub output_shape: Shape,
}

/// Tries to match `pattern` against the chain starting at `anchor`.
///
/// The walk follows data flow: `anchor` must match the first signature, its
/// sole consumer the second, and so on. Every node of the chain must have
/// exactly one input operand, and every node but the terminal one exactly
/// one consumer edge — a branching intermediate cannot be excised without
/// orphaning its other consumers.
///
/// Any structural deviation yields `None`; non-matches are not errors.
pub(crate) fn match_chain(
    graph: &Graph,
    anchor: NodeId,
    pattern: &Pattern,
) -> Option<MatchedChain> {
    let sigs = pattern.sigs();
    let mut nodes: SmallVec<[NodeId; 8]> = SmallVec::with_capacity(sigs.len());
    let mut current = anchor;

    for (i, sig) in sigs.iter().enumerate() {
        let op = graph.op(current)?;
        if !sig.matches(op) {
            return None;
        }
        if graph.operand_count(current) != 1 {
            return None;
        }
        nodes.push(current);

        if i + 1 < sigs.len() {
            if graph.consumer_count(current) != 1 {
                return None;
            }
            let (_, edge) = graph.consumer_edges(current).next()?;
            current = edge.consumer;
        }
    }

    let output_shape = graph.output_shape(current)?.clone();
    trace!(%anchor, len = nodes.len(), shape = %output_shape, "matched TM chain");
    Some(MatchedChain {
        nodes,
        output_shape,
    })
}
