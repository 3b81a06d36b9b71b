//! Workflow graphs: a start node, one step function per node, a default
//! next-node edge per node, and optional branch rules that may override the
//! default edge after a step completes.
//!
//! Default edges must be acyclic from the start node; loops are expressed only
//! through branch rules, which the executor caps per run.

pub mod branch;
pub mod definition;

pub use branch::evaluate_branch;
pub use definition::GraphDefinition;
