use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoopflowError {
    // Lookup errors
    #[error("Graph not found: {0}")]
    GraphNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    // Step errors
    /// Raised by a step function; the engine records it as `error-in-<node>:<message>`.
    #[error("{0}")]
    Step(String),

    #[error("Step {node} failed: {message}")]
    StepExecution { node: String, message: String },

    // Graph definition errors
    #[error("Invalid graph definition: {0}")]
    Configuration(String),

    // Side-effect errors (best-effort, never fatal to a run)
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    // App config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LoopflowError {
    /// True for unknown graph or run identifiers.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::GraphNotFound(_) | Self::RunNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, LoopflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(LoopflowError::GraphNotFound("g".into()).is_not_found());
        assert!(LoopflowError::RunNotFound("r".into()).is_not_found());
        assert!(!LoopflowError::Step("boom".into()).is_not_found());
        assert!(!LoopflowError::Configuration("bad".into()).is_not_found());
    }

    #[test]
    fn test_step_error_displays_bare_message() {
        assert_eq!(LoopflowError::Step("boom".into()).to_string(), "boom");
    }
}
