use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LoopflowError, Result};

/// Top-level Loopflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

/// Execution engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Pause between consecutive steps of one run, in milliseconds.
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,
    /// How many times a run may take the branch override of a single node.
    #[serde(default = "default_max_branch_iterations")]
    pub max_branch_iterations: usize,
    /// Keep at most this many log entries in a run's state (None = unbounded).
    #[serde(default)]
    pub max_log_entries: Option<usize>,
    /// Buffer size of the live event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl EngineConfig {
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_delay_ms: default_step_delay_ms(),
            max_branch_iterations: default_max_branch_iterations(),
            max_log_entries: None,
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_step_delay_ms() -> u64 { 50 }
fn default_max_branch_iterations() -> usize { 10 }
fn default_event_capacity() -> usize { 256 }

/// Durable store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Persist graphs and runs (default: true). Disabled uses a no-op store.
    #[serde(default = "default_store_enabled")]
    pub enabled: bool,
    /// SQLite database file.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: default_store_enabled(),
            path: default_store_path(),
        }
    }
}

fn default_store_enabled() -> bool { true }
fn default_store_path() -> String { "data/workflows.db".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String { "127.0.0.1:8000".to_string() }

/// Defaults for the bundled code-review workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_threshold")]
    pub default_threshold: i64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_threshold: default_threshold(),
        }
    }
}

fn default_threshold() -> i64 { 7 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| LoopflowError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);

        toml::from_str(&expanded).map_err(|e| LoopflowError::Config(e.to_string()))
    }

    /// Resolve the store path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        let path = &self.store.path;
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(path)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' || chars.peek() != Some(&'{') {
            result.push(c);
            continue;
        }
        chars.next();
        let var_name: String = chars.by_ref().take_while(|c| *c != '}').collect();
        match std::env::var(&var_name) {
            Ok(val) => result.push_str(&val),
            // Unset variables stay verbatim
            Err(_) => result.push_str(&format!("${{{}}}", var_name)),
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
