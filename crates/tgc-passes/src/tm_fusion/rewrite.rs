//! Chain excision and replacement splicing.

use tgc_graph::{Edge, EdgeId, Graph, Op, Shape};
use tracing::debug;

use super::matcher::MatchedChain;
use super::pattern::{Replacement, TmOp};
use super::FusionError;

/// Replaces a matched chain with a freshly constructed replacement chain.
///
/// The whole rewrite is validated before any mutation: the chain endpoints
/// are re-checked against the matcher's guarantees and every replacement
/// node's output shape is computed up front. Only then is the graph
/// touched, so a returned error leaves the graph exactly as it was.
///
/// Wiring: the first new node takes over the old chain's external producer,
/// each subsequent new node consumes its predecessor, and every edge that
/// consumed the old terminal node is redirected to the new terminal at its
/// original operand position.
pub(crate) fn splice(
    graph: &mut Graph,
    chain: &MatchedChain,
    replacement: &Replacement,
) -> Result<(), FusionError> {
    let (&first, rest) = chain
        .nodes
        .split_first()
        .ok_or(FusionError::EmptyChain)?;
    let last = rest.last().copied().unwrap_or(first);

    // Re-validate the matcher's structural guarantees against the live
    // graph before mutating anything.
    for (i, &node) in chain.nodes.iter().enumerate() {
        if !graph.contains(node) || graph.operand_count(node) != 1 {
            return Err(FusionError::ChainInvalidated { node });
        }
        if i + 1 < chain.nodes.len() {
            let mut consumers = graph.consumer_edges(node);
            let next = consumers.next();
            if consumers.next().is_some()
                || !next.is_some_and(|(_, e)| e.consumer == chain.nodes[i + 1])
            {
                return Err(FusionError::ChainInvalidated { node });
            }
        }
    }

    let (_, producer_edge) = graph
        .operand_edges(first)
        .next()
        .ok_or(FusionError::ChainInvalidated { node: first })?;
    let external_producer = producer_edge.producer;
    let external_consumers: Vec<(EdgeId, Edge)> = graph.consumer_edges(last).collect();

    // Compute every new node's output shape before mutating.
    let input_shape = graph
        .output_shape(external_producer)
        .ok_or(FusionError::ChainInvalidated {
            node: external_producer,
        })?
        .clone();
    let mut shapes: Vec<Shape> = Vec::with_capacity(replacement.len());
    let mut current = input_shape.clone();
    for sig in replacement.sigs() {
        current = match sig.op {
            TmOp::Reshape => sig
                .target_shape()
                .ok_or_else(|| FusionError::ReplacementShape {
                    input: input_shape.clone(),
                })?,
            TmOp::Transpose => {
                let (d0, d1) =
                    sig.transpose_axes()
                        .ok_or_else(|| FusionError::ReplacementShape {
                            input: input_shape.clone(),
                        })?;
                current
                    .swap_axes(d0, d1)
                    .ok_or_else(|| FusionError::ReplacementShape {
                        input: input_shape.clone(),
                    })?
            }
        };
        shapes.push(current.clone());
    }

    // Validation done; from here on every mutation operates on endpoints
    // that were just confirmed live.
    let base_name = graph.node(last).map_or_else(String::new, |n| n.name.clone());
    let mut prev = external_producer;
    for (i, (sig, shape)) in replacement.sigs().iter().zip(shapes).enumerate() {
        let op = match sig.op {
            TmOp::Reshape => Op::Reshape {
                shape: shape.clone(),
            },
            TmOp::Transpose => {
                // Checked above.
                let (dim0, dim1) = sig.transpose_axes().ok_or_else(|| {
                    FusionError::ReplacementShape {
                        input: input_shape.clone(),
                    }
                })?;
                Op::Transpose { dim0, dim1 }
            }
        };
        let node = graph.add_node(format!("{base_name}_fused_{i}"), op, shape);
        graph.connect(prev, node, 0)?;
        prev = node;
    }

    for (edge_id, edge) in external_consumers {
        graph.disconnect(edge_id)?;
        graph.connect(prev, edge.consumer, edge.operand)?;
    }

    for &node in &chain.nodes {
        graph.remove_node(node)?;
    }

    debug!(
        removed = chain.nodes.len(),
        inserted = replacement.len(),
        terminal = %prev,
        "spliced TM chain"
    );
    Ok(())
}
