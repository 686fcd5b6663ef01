//! # TGC Graph IR
//!
//! This crate defines the dataflow graph representation that TGC's
//! graph-level passes operate on. A graph is a DAG of operator nodes
//! connected by edges that record which output feeds which input operand.
//!
//! ## Design
//!
//! - Nodes and edges live in arena vectors and are addressed by [`NodeId`]
//!   and [`EdgeId`] handles. Removal leaves a tombstone, so handles captured
//!   before a rewrite stay valid (they merely start resolving to `None`)
//!   while other parts of the graph are being spliced.
//! - Operator payloads are a closed enum ([`Op`]). The tensor-manipulation
//!   operators the optimizer reasons about (reshape, transpose) carry typed
//!   attributes; everything else is [`Op::Other`] with an opaque attribute
//!   list.
//! - Every node records its output tensor shape. Shape inference is assumed
//!   to have run before any pass in this workspace inspects the graph.
//!
//! ## Main Types
//!
//! - [`Graph`]: the mutable node/edge arena
//! - [`Op`]: operator payloads
//! - [`Attr`]: operator attribute values
//! - [`Shape`]: concrete tensor shapes

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tgc_index::{Idx, IndexVec};

/// A unique identifier for graph nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u32);

impl Idx for NodeId {
    fn new(idx: usize) -> Self {
        Self(u32::try_from(idx).expect("node arena exceeds u32 range"))
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// A unique identifier for graph edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeId(u32);

impl Idx for EdgeId {
    fn new(idx: usize) -> Self {
        Self(u32::try_from(idx).expect("edge arena exceeds u32 range"))
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// An operator attribute value.
///
/// Attributes are immutable value types: either a single integer (an axis
/// index, a count) or an ordered list of integers (a shape, a permutation).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Attr {
    /// A single integer.
    Int(i64),
    /// An ordered list of integers.
    IntList(SmallVec<[i64; 4]>),
}

impl Attr {
    /// Returns the integer value if this is an [`Attr::Int`].
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::IntList(_) => None,
        }
    }
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::IntList(vs) => write!(f, "{vs:?}"),
        }
    }
}

/// A concrete tensor shape (list of dimension sizes).
///
/// Graph passes in this workspace run after shape inference, so every
/// dimension is a known positive size.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(SmallVec<[i64; 4]>);

impl Shape {
    /// Creates a shape from dimension sizes.
    #[must_use]
    pub fn new(dims: impl IntoIterator<Item = i64>) -> Self {
        Self(dims.into_iter().collect())
    }

    /// Returns the rank (number of dimensions).
    #[must_use]
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Returns the dimension sizes.
    #[must_use]
    pub fn dims(&self) -> &[i64] {
        &self.0
    }

    /// Returns the total number of elements.
    #[must_use]
    pub fn num_elements(&self) -> i64 {
        self.0.iter().product()
    }

    /// Normalizes a possibly negative axis index to a positive one.
    ///
    /// Negative axes count from the end of the rank, so `-1` is the last
    /// dimension. Returns `None` if the axis is out of range.
    #[must_use]
    pub fn normalize_axis(&self, axis: i64) -> Option<usize> {
        let rank = i64::try_from(self.rank()).ok()?;
        let idx = if axis < 0 { rank + axis } else { axis };
        if (0..rank).contains(&idx) {
            Some(usize::try_from(idx).ok()?)
        } else {
            None
        }
    }

    /// Returns a copy of this shape with two axes swapped.
    ///
    /// Returns `None` if either axis is out of range for this rank.
    #[must_use]
    pub fn swap_axes(&self, dim0: i64, dim1: i64) -> Option<Self> {
        let a = self.normalize_axis(dim0)?;
        let b = self.normalize_axis(dim1)?;
        let mut dims = self.0.clone();
        dims.swap(a, b);
        Some(Self(dims))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

/// An operator payload.
///
/// The tensor-manipulation operators that graph rewrites reason about are
/// first-class variants with typed attributes; all other operators are
/// carried opaquely as [`Op::Other`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Reshape to a target shape. The target shape is the op's attribute
    /// and, after shape inference, also the node's output shape.
    Reshape {
        /// The target shape.
        shape: Shape,
    },
    /// Swap two axes. Axis indices are commonly negative (counted from the
    /// end of the rank).
    Transpose {
        /// First axis to swap.
        dim0: i64,
        /// Second axis to swap.
        dim1: i64,
    },
    /// Any operator outside the tensor-manipulation set.
    Other {
        /// The operator name.
        name: String,
        /// Raw ordered attribute list.
        attrs: Vec<Attr>,
    },
}

impl Op {
    /// Creates an [`Op::Other`] with no attributes.
    #[must_use]
    pub fn other(name: impl Into<String>) -> Self {
        Self::Other {
            name: name.into(),
            attrs: Vec::new(),
        }
    }

    /// Returns the operator name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Reshape { .. } => "reshape",
            Self::Transpose { .. } => "transpose",
            Self::Other { name, .. } => name,
        }
    }

    /// Returns the normalized attribute view of this operator.
    ///
    /// Transpose is always presented as exactly its two axis indices and
    /// reshape as one integer per target dimension, regardless of how the
    /// payload stores them. Other operators expose their raw list.
    #[must_use]
    pub fn attrs(&self) -> Vec<Attr> {
        match self {
            Self::Reshape { shape } => shape.dims().iter().map(|&d| Attr::Int(d)).collect(),
            Self::Transpose { dim0, dim1 } => vec![Attr::Int(*dim0), Attr::Int(*dim1)],
            Self::Other { attrs, .. } => attrs.clone(),
        }
    }
}

/// A node in the graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    /// Human-readable node name, used in logs and diagnostics.
    pub name: String,
    /// The operator payload.
    pub op: Op,
    /// The node's known output tensor shape.
    pub shape: Shape,
    /// Incoming edges, sorted by operand position.
    inputs: SmallVec<[EdgeId; 2]>,
    /// Outgoing edges, in insertion order.
    outputs: SmallVec<[EdgeId; 2]>,
}

/// A directed edge from a producer's output to one input operand of a
/// consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// The node producing the value.
    pub producer: NodeId,
    /// The node consuming the value.
    pub consumer: NodeId,
    /// The consumer-side input operand position.
    pub operand: usize,
}

/// Errors produced by graph construction, surgery, and validation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// A node handle resolved to a removed or never-created node.
    #[error("node {0} does not exist")]
    NodeNotFound(NodeId),

    /// An edge handle resolved to a removed or never-created edge.
    #[error("edge {0} does not exist")]
    EdgeNotFound(EdgeId),

    /// Two edges target the same input operand of one node.
    #[error("operand {operand} of node {node} is already connected")]
    DuplicateOperand {
        /// The consumer node.
        node: NodeId,
        /// The contested operand position.
        operand: usize,
    },

    /// An edge would connect a node to itself.
    #[error("node {0} cannot consume its own output")]
    SelfLoop(NodeId),

    /// A live edge references a removed node.
    #[error("edge {edge} references a removed node")]
    DanglingEdge {
        /// The offending edge.
        edge: EdgeId,
    },

    /// The graph is not a DAG.
    #[error("graph contains a cycle")]
    Cycle,
}

/// A mutable dataflow graph of operator nodes.
///
/// Nodes and edges are arena-allocated; removal tombstones the slot so that
/// previously handed-out ids never get reused within one graph's lifetime.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: IndexVec<NodeId, Option<Node>>,
    edges: IndexVec<EdgeId, Option<Edge>>,
    live_nodes: usize,
}

impl Graph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node and returns its handle.
    pub fn add_node(&mut self, name: impl Into<String>, op: Op, shape: Shape) -> NodeId {
        self.live_nodes += 1;
        self.nodes.push(Some(Node {
            name: name.into(),
            op,
            shape,
            inputs: SmallVec::new(),
            outputs: SmallVec::new(),
        }))
    }

    /// Returns the node behind `id`, or `None` if it was removed.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id).and_then(Option::as_ref)
    }

    /// Returns the operator payload of `id`, or `None` if it was removed.
    #[must_use]
    pub fn op(&self, id: NodeId) -> Option<&Op> {
        self.node(id).map(|n| &n.op)
    }

    /// Returns the output shape of `id`, or `None` if it was removed.
    #[must_use]
    pub fn output_shape(&self, id: NodeId) -> Option<&Shape> {
        self.node(id).map(|n| &n.shape)
    }

    /// Returns true if `id` refers to a live node.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Returns the number of live nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live_nodes
    }

    /// Returns true if the graph holds no live nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live_nodes == 0
    }

    /// Iterates over live node ids in ascending (creation) order.
    ///
    /// Creation order doubles as the deterministic scan order for passes.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter_enumerated()
            .filter_map(|(id, slot)| slot.as_ref().map(|_| id))
    }

    /// Connects `producer`'s output to input operand `operand` of `consumer`.
    ///
    /// # Errors
    ///
    /// Fails if either endpoint is dead, the endpoints are the same node,
    /// or the operand position is already connected.
    pub fn connect(
        &mut self,
        producer: NodeId,
        consumer: NodeId,
        operand: usize,
    ) -> Result<EdgeId, GraphError> {
        if producer == consumer {
            return Err(GraphError::SelfLoop(producer));
        }
        if !self.contains(producer) {
            return Err(GraphError::NodeNotFound(producer));
        }
        if !self.contains(consumer) {
            return Err(GraphError::NodeNotFound(consumer));
        }
        if self
            .operand_edges(consumer)
            .any(|(_, e)| e.operand == operand)
        {
            return Err(GraphError::DuplicateOperand {
                node: consumer,
                operand,
            });
        }

        // Input lists are kept sorted by operand position.
        let pos = self
            .operand_edges(consumer)
            .take_while(|(_, e)| e.operand < operand)
            .count();

        let edge = self.edges.push(Some(Edge {
            producer,
            consumer,
            operand,
        }));
        self.node_mut(producer)?.outputs.push(edge);
        self.node_mut(consumer)?.inputs.insert(pos, edge);

        Ok(edge)
    }

    /// Returns the edge behind `id`, or `None` if it was removed.
    #[must_use]
    pub fn edge(&self, id: EdgeId) -> Option<Edge> {
        self.edges.get(id).and_then(|slot| *slot)
    }

    /// Removes an edge, detaching it from both endpoints.
    ///
    /// # Errors
    ///
    /// Fails if the edge was already removed.
    pub fn disconnect(&mut self, id: EdgeId) -> Result<Edge, GraphError> {
        let edge = self
            .edges
            .get_mut(id)
            .and_then(Option::take)
            .ok_or(GraphError::EdgeNotFound(id))?;
        if let Some(node) = self.nodes.get_mut(edge.producer).and_then(Option::as_mut) {
            node.outputs.retain(|e| *e != id);
        }
        if let Some(node) = self.nodes.get_mut(edge.consumer).and_then(Option::as_mut) {
            node.inputs.retain(|e| *e != id);
        }
        Ok(edge)
    }

    /// Removes a node along with every incident edge.
    ///
    /// # Errors
    ///
    /// Fails if the node was already removed.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), GraphError> {
        let node = self.node(id).ok_or(GraphError::NodeNotFound(id))?;
        let incident: Vec<EdgeId> = node
            .inputs
            .iter()
            .chain(node.outputs.iter())
            .copied()
            .collect();
        for edge in incident {
            self.disconnect(edge)?;
        }
        self.nodes[id] = None;
        self.live_nodes -= 1;
        Ok(())
    }

    /// Iterates over the incoming edges of `id`, sorted by operand position.
    pub fn operand_edges(&self, id: NodeId) -> impl Iterator<Item = (EdgeId, Edge)> + '_ {
        self.node(id)
            .map(|n| n.inputs.clone())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|e| self.edge(e).map(|edge| (e, edge)))
    }

    /// Iterates over the outgoing edges of `id`.
    pub fn consumer_edges(&self, id: NodeId) -> impl Iterator<Item = (EdgeId, Edge)> + '_ {
        self.node(id)
            .map(|n| n.outputs.clone())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|e| self.edge(e).map(|edge| (e, edge)))
    }

    /// Returns the number of connected input operands of `id`.
    #[must_use]
    pub fn operand_count(&self, id: NodeId) -> usize {
        self.node(id).map_or(0, |n| n.inputs.len())
    }

    /// Returns the number of edges consuming `id`'s output.
    #[must_use]
    pub fn consumer_count(&self, id: NodeId) -> usize {
        self.node(id).map_or(0, |n| n.outputs.len())
    }

    /// Returns the node feeding input operand `operand` of `id`.
    #[must_use]
    pub fn producer(&self, id: NodeId, operand: usize) -> Option<NodeId> {
        self.operand_edges(id)
            .find(|(_, e)| e.operand == operand)
            .map(|(_, e)| e.producer)
    }

    /// Computes a topological order over the live nodes.
    ///
    /// The order is deterministic: among ready nodes, the lowest id comes
    /// first.
    ///
    /// # Errors
    ///
    /// Fails with [`GraphError::Cycle`] if the graph is not a DAG.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut indegree: IndexVec<NodeId, usize> =
            self.nodes.indices().map(|_| 0usize).collect();
        for slot in self.edges.iter() {
            if let Some(edge) = slot {
                indegree[edge.consumer] += 1;
            }
        }

        let mut ready: BinaryHeap<Reverse<NodeId>> = self
            .node_ids()
            .filter(|&id| indegree[id] == 0)
            .map(Reverse)
            .collect();

        let mut order = Vec::with_capacity(self.live_nodes);
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            for (_, edge) in self.consumer_edges(id) {
                indegree[edge.consumer] -= 1;
                if indegree[edge.consumer] == 0 {
                    ready.push(Reverse(edge.consumer));
                }
            }
        }

        if order.len() == self.live_nodes {
            Ok(order)
        } else {
            Err(GraphError::Cycle)
        }
    }

    /// Checks structural soundness of the whole graph.
    ///
    /// Verifies that no live edge touches a removed node, that no node has
    /// two edges on the same input operand, and that the graph is acyclic.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), GraphError> {
        for (id, slot) in self.edges.iter_enumerated() {
            if let Some(edge) = slot {
                if !self.contains(edge.producer) || !self.contains(edge.consumer) {
                    return Err(GraphError::DanglingEdge { edge: id });
                }
            }
        }
        for id in self.node_ids() {
            let mut seen: SmallVec<[usize; 4]> = SmallVec::new();
            for (_, edge) in self.operand_edges(id) {
                if seen.contains(&edge.operand) {
                    return Err(GraphError::DuplicateOperand {
                        node: id,
                        operand: edge.operand,
                    });
                }
                seen.push(edge.operand);
            }
        }
        self.topological_order()?;
        Ok(())
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        self.nodes
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or(GraphError::NodeNotFound(id))
    }
}
