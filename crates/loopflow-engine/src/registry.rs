use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use loopflow_core::error::{LoopflowError, Result};
use loopflow_core::types::{GraphId, RunId, RunPhase, RunRecord, RunSnapshot, RunState};

use crate::graph::GraphDefinition;

/// In-memory directory of registered graphs and their runs.
///
/// Entries are keyed by freshly generated ids and each run entry is written
/// only by that run's execution task, so map-level locks are all that is
/// needed; they are never held across an await.
pub struct RunRegistry {
    graphs: RwLock<HashMap<GraphId, Arc<GraphDefinition>>>,
    runs: RwLock<HashMap<RunId, RunEntry>>,
}

struct RunEntry {
    graph_id: GraphId,
    phase: RunPhase,
    state: RunState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RunEntry {
    fn snapshot(&self, run_id: &RunId) -> RunSnapshot {
        RunSnapshot {
            run_id: run_id.clone(),
            graph_id: self.graph_id.clone(),
            phase: self.phase,
            finished: self.phase == RunPhase::Finished,
            logs: self.state.logs(),
            state: self.state.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn record(&self, run_id: &RunId) -> RunRecord {
        RunRecord {
            run_id: run_id.clone(),
            graph_id: self.graph_id.clone(),
            state: self.state.clone(),
            finished: self.phase == RunPhase::Finished,
            updated_at: self.updated_at,
        }
    }
}

impl RunRegistry {
    pub fn new() -> Self {
        Self {
            graphs: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Store an already validated graph under a new id.
    pub fn insert_graph(&self, graph: GraphDefinition) -> (GraphId, Arc<GraphDefinition>) {
        let graph_id = GraphId::new();
        let graph = Arc::new(graph);
        write(&self.graphs).insert(graph_id.clone(), graph.clone());
        (graph_id, graph)
    }

    pub fn graph(&self, graph_id: &GraphId) -> Result<Arc<GraphDefinition>> {
        read(&self.graphs)
            .get(graph_id)
            .cloned()
            .ok_or_else(|| LoopflowError::GraphNotFound(graph_id.to_string()))
    }

    /// Allocate a pending run seeded with `state`. Returns its initial record.
    pub fn create_run(&self, graph_id: &GraphId, state: RunState) -> (RunId, RunRecord) {
        let run_id = RunId::new();
        let now = Utc::now();
        let entry = RunEntry {
            graph_id: graph_id.clone(),
            phase: RunPhase::Pending,
            state,
            created_at: now,
            updated_at: now,
        };
        let record = entry.record(&run_id);
        write(&self.runs).insert(run_id.clone(), entry);
        (run_id, record)
    }

    /// Move a pending run to running.
    pub fn mark_running(&self, run_id: &RunId) {
        if let Some(entry) = write(&self.runs).get_mut(run_id) {
            if entry.phase == RunPhase::Pending {
                entry.phase = RunPhase::Running;
                entry.updated_at = Utc::now();
            }
        }
    }

    /// Replace a run's state wholesale. Returns the record to persist.
    pub fn replace_state(&self, run_id: &RunId, state: RunState) -> Result<RunRecord> {
        self.update(run_id, state, None)
    }

    /// Store the final state and mark the run finished.
    pub fn finish(&self, run_id: &RunId, state: RunState) -> Result<RunRecord> {
        self.update(run_id, state, Some(RunPhase::Finished))
    }

    fn update(&self, run_id: &RunId, state: RunState, phase: Option<RunPhase>) -> Result<RunRecord> {
        let mut runs = write(&self.runs);
        let entry = runs
            .get_mut(run_id)
            .ok_or_else(|| LoopflowError::RunNotFound(run_id.to_string()))?;
        entry.state = state;
        if let Some(phase) = phase {
            entry.phase = phase;
        }
        entry.updated_at = Utc::now();
        Ok(entry.record(run_id))
    }

    pub fn snapshot(&self, run_id: &RunId) -> Result<RunSnapshot> {
        read(&self.runs)
            .get(run_id)
            .map(|entry| entry.snapshot(run_id))
            .ok_or_else(|| LoopflowError::RunNotFound(run_id.to_string()))
    }

    /// `false` for unknown runs.
    pub fn is_finished(&self, run_id: &RunId) -> bool {
        read(&self.runs)
            .get(run_id)
            .is_some_and(|entry| entry.phase == RunPhase::Finished)
    }

    pub fn contains_run(&self, run_id: &RunId) -> bool {
        read(&self.runs).contains_key(run_id)
    }

    pub fn graph_count(&self) -> usize {
        read(&self.graphs).len()
    }

    pub fn run_count(&self) -> usize {
        read(&self.runs).len()
    }
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// A panicking writer cannot leave a half-written entry, so poisoning is ignored.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
