//! Redundant tensor-manipulation chain fusion.
//!
//! Graphs exported from frameworks routinely carry chains of reshape and
//! transpose operators that cancel or collapse: a layout round-trip around
//! a pair of transposes, or a detection head's flatten expressed as five
//! ops where one reshape suffices. This pass finds such chains and rewrites
//! them into the cheaper equivalent recorded in a rule table.
//!
//! ## Operation
//!
//! 1. Scan anchors in ascending node-id order (deterministic for a fixed
//!    graph).
//! 2. For each registered pattern, try to match a linear chain starting at
//!    the anchor ([`matcher`]): operator kinds and strict attributes must
//!    agree, and no intermediate node may have fan-out.
//! 3. Resolve the replacement among the pattern's registered candidates by
//!    the chain's terminal output shape; a chain whose terminal shape is in
//!    no candidate, or whose replacement shapes cannot be derived from its
//!    external input shape, is conservatively left alone.
//! 4. Splice the replacement in ([`rewrite`]), preserving the external
//!    producer and every external consumer's operand position, then restart
//!    the scan: the graph shrank and earlier anchors may match again.
//!
//! The driver runs to a fixed point. Termination is a property of the rule
//! table, enforced at registry construction: no replacement chain may
//! itself re-match a registered pattern.
//!
//! ## Example
//!
//! ```
//! use tgc_graph::{Graph, Op, Shape};
//! use tgc_passes::tm_fusion::fuse_tm_chains;
//!
//! let mut graph = Graph::new();
//! let x = graph.add_node("x", Op::other("input"), Shape::new([1, 2, 3, 4]));
//! let r0 = graph.add_node(
//!     "r0",
//!     Op::Reshape { shape: Shape::new([2, 3, 4]) },
//!     Shape::new([2, 3, 4]),
//! );
//! let t0 = graph.add_node(
//!     "t0",
//!     Op::Transpose { dim0: -3, dim1: -1 },
//!     Shape::new([4, 3, 2]),
//! );
//! let t1 = graph.add_node(
//!     "t1",
//!     Op::Transpose { dim0: -2, dim1: -1 },
//!     Shape::new([4, 2, 3]),
//! );
//! let r1 = graph.add_node(
//!     "r1",
//!     Op::Reshape { shape: Shape::new([1, 2, 4, 3]) },
//!     Shape::new([1, 2, 4, 3]),
//! );
//! graph.connect(x, r0, 0).unwrap();
//! graph.connect(r0, t0, 0).unwrap();
//! graph.connect(t0, t1, 0).unwrap();
//! graph.connect(t1, r1, 0).unwrap();
//!
//! assert!(fuse_tm_chains(&mut graph).unwrap());
//! assert_eq!(graph.len(), 2); // input + one fused transpose
//! ```

mod matcher;
pub mod pattern;
mod rewrite;

pub use pattern::{
    builtin_registry, OpSignature, Pattern, PatternRegistry, RegistryError, Replacement, TmOp,
};

use tgc_graph::{Graph, GraphError, NodeId, Shape};
use tracing::{debug, trace};

/// Errors aborting a fusion pass invocation.
///
/// Ordinary non-matches are not errors; these indicate a broken graph or a
/// broken rewrite and leave the offending chain untouched.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FusionError {
    /// Graph surgery failed mid-splice.
    #[error("graph surgery failed: {0}")]
    Graph(#[from] GraphError),

    /// A chain accepted by the matcher no longer upholds the single-
    /// producer/single-consumer structure at rewrite time.
    #[error("matched chain invalidated before rewrite at node {node}")]
    ChainInvalidated {
        /// The offending chain node.
        node: NodeId,
    },

    /// A replacement chain's shapes cannot be derived from the chain's
    /// external input shape. The driver treats this as a non-match for the
    /// chain, so it never escapes [`fuse_tm_chains`].
    #[error("replacement chain cannot be constructed for input shape {input}")]
    ReplacementShape {
        /// The external producer's output shape.
        input: Shape,
    },

    /// The matcher produced an empty chain.
    #[error("matched chain is empty")]
    EmptyChain,
}

/// Counters for one driver invocation, logged at `debug` level.
#[derive(Clone, Copy, Debug, Default)]
struct FusionStats {
    scans: usize,
    rewrites: usize,
    nodes_removed: usize,
    nodes_inserted: usize,
}

/// Runs TM chain fusion with the built-in rule table.
///
/// Returns `true` if the graph was modified by at least one rewrite.
///
/// # Errors
///
/// Fails only on internal invariant violations; see [`FusionError`]. The
/// graph is never left partially rewritten.
pub fn fuse_tm_chains(graph: &mut Graph) -> Result<bool, FusionError> {
    fuse_tm_chains_with(graph, builtin_registry())
}

/// Runs TM chain fusion with a caller-supplied rule table.
///
/// The engine is identical to [`fuse_tm_chains`]; only the rule set
/// differs. The registry is read-only and may be shared across calls.
///
/// # Errors
///
/// Fails only on internal invariant violations; see [`FusionError`].
pub fn fuse_tm_chains_with(
    graph: &mut Graph,
    registry: &PatternRegistry,
) -> Result<bool, FusionError> {
    let mut stats = FusionStats::default();

    'scan: loop {
        stats.scans += 1;
        // Snapshot the anchor order; the loop below mutates the graph at
        // most once before restarting with a fresh snapshot.
        let anchors: Vec<NodeId> = graph.node_ids().collect();
        for anchor in anchors {
            for (pattern, candidates) in registry.groups() {
                let Some(chain) = matcher::match_chain(graph, anchor, pattern) else {
                    continue;
                };
                let Some(replacement) = select_replacement(candidates, &chain.output_shape)
                else {
                    trace!(
                        %anchor,
                        shape = %chain.output_shape,
                        "no replacement variant for terminal shape"
                    );
                    continue;
                };
                match rewrite::splice(graph, &chain, replacement) {
                    Ok(()) => {}
                    // The replacement cannot be built over this chain's
                    // external input shape; the graph is untouched, so
                    // leave the chain alone and keep scanning.
                    Err(FusionError::ReplacementShape { input }) => {
                        trace!(
                            %anchor,
                            %input,
                            "replacement shapes underivable; chain left alone"
                        );
                        continue;
                    }
                    Err(err) => return Err(err),
                }
                stats.rewrites += 1;
                stats.nodes_removed += chain.nodes.len();
                stats.nodes_inserted += replacement.len();
                continue 'scan;
            }
        }
        break;
    }

    debug!(
        scans = stats.scans,
        rewrites = stats.rewrites,
        removed = stats.nodes_removed,
        inserted = stats.nodes_inserted,
        "TM chain fusion reached fixed point"
    );
    Ok(stats.rewrites > 0)
}

/// Picks the replacement for a matched pattern.
///
/// A single registered candidate is used unconditionally. Among several
/// shape-specialized candidates, the first (in registration order) whose
/// terminal reshape shape equals the chain's required output shape wins;
/// if none does, the chain is left unfused.
fn select_replacement<'a>(
    candidates: &'a [Replacement],
    required: &Shape,
) -> Option<&'a Replacement> {
    if let [only] = candidates {
        return Some(only);
    }
    candidates
        .iter()
        .find(|candidate| candidate.terminal_shape().as_ref() == Some(required))
}
