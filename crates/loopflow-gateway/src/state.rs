use std::sync::Arc;

use loopflow_core::config::WorkflowConfig;
use loopflow_engine::WorkflowEngine;

/// Shared application state for axum handlers.
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    pub workflow: WorkflowConfig,
}
