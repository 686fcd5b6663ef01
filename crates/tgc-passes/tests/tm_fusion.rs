//! End-to-end tests for TM chain fusion.
//!
//! Each test builds a small graph by hand, runs the pass, and checks the
//! rewritten graph for structural soundness and shape preservation.

use tgc_graph::{Graph, NodeId, Op, Shape};
use tgc_passes::tm_fusion::{
    fuse_tm_chains, fuse_tm_chains_with, OpSignature, Pattern, PatternRegistry, Replacement,
};

fn shape(dims: &[i64]) -> Shape {
    Shape::new(dims.iter().copied())
}

fn source(g: &mut Graph, name: &str, dims: &[i64]) -> NodeId {
    g.add_node(name, Op::other("input"), shape(dims))
}

fn reshape(g: &mut Graph, name: &str, from: NodeId, dims: &[i64]) -> NodeId {
    let node = g.add_node(
        name,
        Op::Reshape {
            shape: shape(dims),
        },
        shape(dims),
    );
    g.connect(from, node, 0).unwrap();
    node
}

fn transpose(g: &mut Graph, name: &str, from: NodeId, dim0: i64, dim1: i64) -> NodeId {
    let out = g
        .output_shape(from)
        .unwrap()
        .swap_axes(dim0, dim1)
        .unwrap();
    let node = g.add_node(name, Op::Transpose { dim0, dim1 }, out);
    g.connect(from, node, 0).unwrap();
    node
}

fn sink(g: &mut Graph, name: &str, from: NodeId, operand: usize) -> NodeId {
    let out = g.output_shape(from).unwrap().clone();
    let node = g.add_node(name, Op::other("softmax"), out);
    g.connect(from, node, operand).unwrap();
    node
}

/// reshape . transpose(-3,-1) . transpose(-2,-1) . reshape over `input`.
/// Returns the terminal reshape.
fn build_double_transpose_chain(g: &mut Graph, input: NodeId) -> NodeId {
    let r0 = reshape(g, "r0", input, &[2, 3, 4]);
    let t0 = transpose(g, "t0", r0, -3, -1);
    let t1 = transpose(g, "t1", t0, -2, -1);
    reshape(g, "r1", t1, &[1, 2, 4, 3])
}

/// transpose(-2,-1) . reshape . transpose(-3,-2) . transpose(-2,-1)
/// . reshape over `input`, splitting through `inner_dims` and ending in
/// `final_dims`. Returns the terminal reshape.
fn build_head_flatten_chain(
    g: &mut Graph,
    input: NodeId,
    inner_dims: &[i64],
    final_dims: &[i64],
) -> NodeId {
    let t0 = transpose(g, "t0", input, -2, -1);
    let r0 = reshape(g, "r0", t0, inner_dims);
    let t1 = transpose(g, "t1", r0, -3, -2);
    let t2 = transpose(g, "t2", t1, -2, -1);
    reshape(g, "r1", t2, final_dims)
}

fn only_tm_node(g: &Graph) -> NodeId {
    let tm: Vec<NodeId> = g
        .node_ids()
        .filter(|&id| {
            matches!(
                g.op(id),
                Some(Op::Reshape { .. } | Op::Transpose { .. })
            )
        })
        .collect();
    assert_eq!(tm.len(), 1, "expected exactly one TM node, found {tm:?}");
    tm[0]
}

#[test]
fn double_transpose_chain_collapses_to_single_transpose() {
    let mut g = Graph::new();
    let x = source(&mut g, "x", &[1, 2, 3, 4]);
    let tail = build_double_transpose_chain(&mut g, x);
    let out = sink(&mut g, "out", tail, 0);

    let original_shape = g.output_shape(tail).unwrap().clone();
    assert!(fuse_tm_chains(&mut g).unwrap());
    g.validate().unwrap();

    // input + fused node + sink
    assert_eq!(g.len(), 3);
    let fused = only_tm_node(&g);
    assert_eq!(g.op(fused), Some(&Op::Transpose { dim0: -2, dim1: -1 }));
    assert_eq!(g.output_shape(fused), Some(&original_shape));
    assert_eq!(g.producer(fused, 0), Some(x));
    assert_eq!(g.producer(out, 0), Some(fused));
}

#[test]
fn head_flatten_chain_collapses_to_registered_reshape() {
    let mut g = Graph::new();
    let x = source(&mut g, "x", &[1, 21, 2166]);
    let tail = build_head_flatten_chain(&mut g, x, &[1, 2, 1083, 21], &[1, 2166, 21]);
    let out = sink(&mut g, "out", tail, 0);

    assert!(fuse_tm_chains(&mut g).unwrap());
    g.validate().unwrap();

    assert_eq!(g.len(), 3);
    let fused = only_tm_node(&g);
    assert_eq!(
        g.op(fused),
        Some(&Op::Reshape {
            shape: shape(&[1, 2166, 21]),
        })
    );
    assert_eq!(g.output_shape(fused), Some(&shape(&[1, 2166, 21])));
    assert_eq!(g.producer(out, 0), Some(fused));
}

#[test]
fn unregistered_terminal_shape_is_left_alone() {
    let mut g = Graph::new();
    let x = source(&mut g, "x", &[1, 21, 2166]);
    let tail = build_head_flatten_chain(&mut g, x, &[1, 2, 1083, 21], &[1, 2166, 99]);
    sink(&mut g, "out", tail, 0);

    let before: Vec<NodeId> = g.node_ids().collect();
    assert!(!fuse_tm_chains(&mut g).unwrap());
    let after: Vec<NodeId> = g.node_ids().collect();

    assert_eq!(before, after);
    assert!(g.contains(tail));
    g.validate().unwrap();
}

#[test]
fn low_rank_input_leaves_chain_alone() {
    // The chain matches, but the single-candidate replacement transpose
    // cannot be applied to a rank-1 external input. The chain must be
    // skipped, not turned into a pass-level error.
    let mut g = Graph::new();
    let x = source(&mut g, "x", &[12]);
    let r0 = reshape(&mut g, "r0", x, &[2, 3, 2]);
    let t0 = transpose(&mut g, "t0", r0, -3, -1);
    let t1 = transpose(&mut g, "t1", t0, -2, -1);
    let r1 = reshape(&mut g, "r1", t1, &[3, 4]);
    sink(&mut g, "out", r1, 0);

    let before: Vec<NodeId> = g.node_ids().collect();
    assert!(!fuse_tm_chains(&mut g).unwrap());
    let after: Vec<NodeId> = g.node_ids().collect();
    assert_eq!(before, after);
    g.validate().unwrap();
}

#[test]
fn branching_intermediate_is_never_rewritten() {
    let mut g = Graph::new();
    let x = source(&mut g, "x", &[1, 2, 3, 4]);
    let r0 = reshape(&mut g, "r0", x, &[2, 3, 4]);
    let t0 = transpose(&mut g, "t0", r0, -3, -1);
    let t1 = transpose(&mut g, "t1", t0, -2, -1);
    let r1 = reshape(&mut g, "r1", t1, &[1, 2, 4, 3]);
    sink(&mut g, "out", r1, 0);
    // Second consumer of an intermediate node.
    sink(&mut g, "tap", t0, 0);

    assert!(!fuse_tm_chains(&mut g).unwrap());
    assert!(g.contains(r0));
    assert!(g.contains(t0));
    assert!(g.contains(t1));
    assert!(g.contains(r1));
    g.validate().unwrap();
}

#[test]
fn custom_registry_only_fuses_its_own_pattern() {
    let double_transpose = Pattern::new([
        OpSignature::reshape(),
        OpSignature::transpose(-3, -1),
        OpSignature::transpose(-2, -1),
        OpSignature::reshape(),
    ]);
    let registry = PatternRegistry::new([(
        double_transpose,
        Replacement::new([OpSignature::transpose(-2, -1)]),
    )])
    .unwrap();

    let mut g = Graph::new();
    let x1 = source(&mut g, "x1", &[1, 2, 3, 4]);
    let tail1 = build_double_transpose_chain(&mut g, x1);
    sink(&mut g, "out1", tail1, 0);

    let x2 = source(&mut g, "x2", &[1, 21, 2166]);
    let tail2 = build_head_flatten_chain(&mut g, x2, &[1, 2, 1083, 21], &[1, 2166, 21]);
    sink(&mut g, "out2", tail2, 0);

    let before = g.len();
    assert!(fuse_tm_chains_with(&mut g, &registry).unwrap());
    g.validate().unwrap();

    // Only the four-node chain collapsed (4 nodes -> 1).
    assert_eq!(g.len(), before - 3);
    assert!(g.contains(tail2));
    assert!(!g.contains(tail1));
}

#[test]
fn consumer_operand_positions_are_preserved() {
    let mut g = Graph::new();
    let x = source(&mut g, "x", &[1, 2, 3, 4]);
    let tail = build_double_transpose_chain(&mut g, x);

    // A two-operand consumer taking the chain output at operand 1.
    let bias = source(&mut g, "bias", &[1, 2, 4, 3]);
    let add = g.add_node("add", Op::other("add"), shape(&[1, 2, 4, 3]));
    g.connect(bias, add, 0).unwrap();
    g.connect(tail, add, 1).unwrap();

    assert!(fuse_tm_chains(&mut g).unwrap());
    g.validate().unwrap();

    let fused = only_tm_node(&g);
    assert_eq!(g.producer(add, 0), Some(bias));
    assert_eq!(g.producer(add, 1), Some(fused));
    assert_eq!(g.operand_count(add), 2);
}

#[test]
fn fixed_point_fuses_every_chain_in_one_invocation() {
    let mut g = Graph::new();
    let x1 = source(&mut g, "x1", &[1, 2, 3, 4]);
    let tail1 = build_double_transpose_chain(&mut g, x1);
    sink(&mut g, "out1", tail1, 0);

    let x2 = source(&mut g, "x2", &[1, 21, 600]);
    let tail2 = build_head_flatten_chain(&mut g, x2, &[1, 2, 300, 21], &[1, 600, 21]);
    sink(&mut g, "out2", tail2, 0);

    // The second chain terminal shape [1, 600, 21] is registered, so both
    // chains fuse in one call.
    assert!(fuse_tm_chains(&mut g).unwrap());
    g.validate().unwrap();
    assert_eq!(g.len(), 6); // 2 inputs + 2 fused nodes + 2 sinks
}

#[test]
fn pass_is_idempotent() {
    let mut g = Graph::new();
    let x = source(&mut g, "x", &[1, 2, 3, 4]);
    let tail = build_double_transpose_chain(&mut g, x);
    sink(&mut g, "out", tail, 0);

    assert!(fuse_tm_chains(&mut g).unwrap());
    let nodes_after_first: Vec<NodeId> = g.node_ids().collect();

    assert!(!fuse_tm_chains(&mut g).unwrap());
    let nodes_after_second: Vec<NodeId> = g.node_ids().collect();
    assert_eq!(nodes_after_first, nodes_after_second);
}

#[test]
fn graph_without_tm_chains_is_untouched() {
    let mut g = Graph::new();
    let x = source(&mut g, "x", &[8, 8]);
    let w = source(&mut g, "w", &[8, 8]);
    let mm = g.add_node("mm", Op::other("matmul"), shape(&[8, 8]));
    g.connect(x, mm, 0).unwrap();
    g.connect(w, mm, 1).unwrap();
    sink(&mut g, "out", mm, 0);

    assert!(!fuse_tm_chains(&mut g).unwrap());
    assert_eq!(g.len(), 4);
}
