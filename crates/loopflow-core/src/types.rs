use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Field of the Run State holding the ordered log sequence.
pub const LOGS_FIELD: &str = "logs";

/// Log entry seeded into a run's snapshot before the first step completes.
pub const RUN_STARTED_LOG: &str = "run-started";

/// Unique graph identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphId(pub String);

impl GraphId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for GraphId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GraphId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The payload threaded through every step of a run.
///
/// A JSON object of named fields. The engine only relies on the `logs`
/// array; everything else belongs to the step functions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunState {
    fields: Map<String, Value>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a state from initial fields.
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }

    /// Get a numeric value as `f64` (integers included).
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(|v| v.as_f64())
    }

    /// Get a numeric value as `i64`, truncating floats.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        let value = self.fields.get(key)?;
        value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
    }

    /// Get an array of strings, skipping non-string elements.
    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        self.fields
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Set a value.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    /// Set a string value.
    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), Value::String(value.into()));
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Append a log entry, creating the `logs` array if missing.
    ///
    /// A `logs` field that is not an array is replaced.
    pub fn push_log(&mut self, entry: impl Into<String>) {
        let slot = self
            .fields
            .entry(LOGS_FIELD.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !slot.is_array() {
            *slot = Value::Array(Vec::new());
        }
        if let Value::Array(items) = slot {
            items.push(Value::String(entry.into()));
        }
    }

    /// Ensure the `logs` array exists without adding entries.
    pub fn ensure_logs(&mut self) {
        if !matches!(self.fields.get(LOGS_FIELD), Some(Value::Array(_))) {
            self.fields
                .insert(LOGS_FIELD.to_string(), Value::Array(Vec::new()));
        }
    }

    /// The ordered log entries.
    pub fn logs(&self) -> Vec<String> {
        self.get_str_list(LOGS_FIELD)
    }

    /// Number of string entries in the `logs` array. Matches the indexing
    /// of [`logs_since`](Self::logs_since).
    pub fn log_len(&self) -> usize {
        self.fields
            .get(LOGS_FIELD)
            .and_then(|v| v.as_array())
            .map_or(0, |items| items.iter().filter(|v| v.is_string()).count())
    }

    /// Log entries at positions `from..`.
    pub fn logs_since(&self, from: usize) -> Vec<String> {
        self.logs().into_iter().skip(from).collect()
    }

    /// Keep only the newest `max` log entries. Returns how many were dropped.
    pub fn retain_recent_logs(&mut self, max: usize) -> usize {
        match self.fields.get_mut(LOGS_FIELD) {
            Some(Value::Array(items)) if items.len() > max => {
                let dropped = items.len() - max;
                items.drain(..dropped);
                dropped
            }
            _ => 0,
        }
    }

    /// Get the underlying field map.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

/// Run lifecycle: `Pending -> Running -> Finished`, never re-entering `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Pending,
    Running,
    Finished,
}

/// Point-in-time view of a run, read from the in-memory registry.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub graph_id: GraphId,
    pub phase: RunPhase,
    pub finished: bool,
    pub state: RunState,
    pub logs: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Declarative override evaluated after the default edge of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BranchRule {
    /// Go to `target` when the numeric `field` is strictly below the graph's
    /// `branch_threshold`. A missing or non-numeric field counts as 0.
    ScoreBelow { field: String, target: String },
}

impl BranchRule {
    pub fn score_below(field: impl Into<String>, target: impl Into<String>) -> Self {
        Self::ScoreBelow {
            field: field.into(),
            target: target.into(),
        }
    }

    /// The node this rule may redirect to.
    pub fn target(&self) -> &str {
        match self {
            Self::ScoreBelow { target, .. } => target,
        }
    }
}

/// Durable shape of a graph definition (`graphs(graph_id, payload)`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRecord {
    pub graph_id: GraphId,
    pub start: String,
    pub nodes: Vec<String>,
    pub edges: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub branches: BTreeMap<String, BranchRule>,
    pub branch_threshold: i64,
}

/// Durable shape of a run (`runs(run_id, graph_id, state, finished)`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub graph_id: GraphId,
    pub state: RunState,
    pub finished: bool,
    pub updated_at: DateTime<Utc>,
}

/// Events published on the [`EventBus`](crate::event::EventBus).
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// The run's execution task began.
    RunStarted { run_id: RunId, graph_id: GraphId },
    /// A log entry was appended to the run's state.
    Log { run_id: RunId, line: String },
    /// A step completed successfully.
    StepCompleted { run_id: RunId, node: String, step: usize },
    /// The run left the step loop, successfully or not.
    RunFinished { run_id: RunId, failed: bool },
}

impl WorkflowEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::Log { run_id, .. }
            | Self::StepCompleted { run_id, .. }
            | Self::RunFinished { run_id, .. } => run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_push_log_creates_array() {
        let mut state = RunState::new();
        state.push_log("A");
        state.push_log("B");
        assert_eq!(state.logs(), vec!["A", "B"]);
        assert_eq!(state.log_len(), 2);
    }

    #[test]
    fn test_push_log_replaces_non_array() {
        let mut state = RunState::new();
        state.set_str(LOGS_FIELD, "not a list");
        state.push_log("A");
        assert_eq!(state.logs(), vec!["A"]);
    }

    #[test]
    fn test_logs_since() {
        let mut state = RunState::new();
        for entry in ["a", "b", "c"] {
            state.push_log(entry);
        }
        assert_eq!(state.logs_since(1), vec!["b", "c"]);
        assert!(state.logs_since(5).is_empty());
    }

    #[test]
    fn test_log_cursor_ignores_non_string_entries() {
        let mut state = RunState::new();
        state.set(LOGS_FIELD, json!([1, "a", null]));
        assert_eq!(state.log_len(), 1);

        let cursor = state.log_len();
        state.push_log("b");
        assert_eq!(state.logs_since(cursor), vec!["b"]);
    }

    #[test]
    fn test_retain_recent_logs() {
        let mut state = RunState::new();
        for i in 0..5 {
            state.push_log(format!("entry-{}", i));
        }
        assert_eq!(state.retain_recent_logs(2), 3);
        assert_eq!(state.logs(), vec!["entry-3", "entry-4"]);
        assert_eq!(state.retain_recent_logs(10), 0);
    }

    #[test]
    fn test_numeric_accessors() {
        let mut state = RunState::new();
        state.set("score", json!(3));
        state.set("ratio", json!(6.9));
        assert_eq!(state.get_i64("score"), Some(3));
        assert_eq!(state.get_f64("score"), Some(3.0));
        assert_eq!(state.get_i64("ratio"), Some(6));
        assert_eq!(state.get_i64("missing"), None);
    }

    #[test]
    fn test_state_serializes_as_plain_object() {
        let mut state = RunState::new();
        state.set_str("code", "def f(): pass");
        state.push_log("A");
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value, json!({"code": "def f(): pass", "logs": ["A"]}));
    }

    #[test]
    fn test_branch_rule_serialization() {
        let rule = BranchRule::score_below("quality_score", "suggest");
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["type"], "score_below");
        let parsed: BranchRule = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, rule);
        assert_eq!(parsed.target(), "suggest");
    }
}
