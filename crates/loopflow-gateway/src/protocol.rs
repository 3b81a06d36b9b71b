use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};

/// A frame pushed to a run's WebSocket observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamFrame {
    /// One log line, in emission order.
    Log { run_id: String, line: String },
    /// The run reached termination. Always the last frame on success.
    Finished { run_id: String },
    /// The stream cannot be served; the socket closes right after.
    Error { run_id: String, message: String },
}

impl StreamFrame {
    pub fn log(run_id: &str, line: String) -> Self {
        Self::Log {
            run_id: run_id.to_string(),
            line,
        }
    }

    pub fn finished(run_id: &str) -> Self {
        Self::Finished {
            run_id: run_id.to_string(),
        }
    }

    pub fn error(run_id: &str, message: impl Into<String>) -> Self {
        Self::Error {
            run_id: run_id.to_string(),
            message: message.into(),
        }
    }

    pub fn to_message(&self) -> Option<Message> {
        serde_json::to_string(self)
            .ok()
            .map(|json| Message::Text(json.into()))
    }
}
