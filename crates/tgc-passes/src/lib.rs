//! # TGC Graph Passes
//!
//! Graph-level optimization passes over the [`tgc_graph`] dataflow IR.
//!
//! Each pass takes exclusive mutable access to a graph, runs to completion
//! synchronously, and reports whether it changed anything. Passes never
//! leave a graph partially rewritten: per-rewrite validation happens before
//! any mutation, so a failing invariant aborts the pass with the graph in
//! its pre-rewrite state for that chain.
//!
//! ## Passes
//!
//! - [`tm_fusion`]: collapses redundant chains of tensor-manipulation
//!   operators (reshape, transpose) into cheaper equivalents.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod tm_fusion;
