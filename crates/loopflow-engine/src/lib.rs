pub mod engine;
pub mod executor;
pub mod graph;
pub mod persist;
pub mod registry;

pub use engine::WorkflowEngine;
pub use executor::{ExecutionResult, GraphExecutor};
pub use graph::{evaluate_branch, GraphDefinition};
pub use persist::PersistLane;
pub use registry::RunRegistry;
