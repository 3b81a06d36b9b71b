//! Shared test doubles: scripted step functions and an in-memory store.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::Semaphore;

use loopflow_core::config::EngineConfig;
use loopflow_core::error::{LoopflowError, Result};
use loopflow_core::traits::{RunStore, StepFn};
use loopflow_core::types::{GraphId, GraphRecord, RunId, RunRecord, RunState};

/// Engine config with no pacing delay.
pub fn fast_engine_config() -> EngineConfig {
    EngineConfig {
        step_delay_ms: 0,
        ..EngineConfig::default()
    }
}

/// Appends its own name to the log.
pub struct LogStep {
    name: String,
    calls: AtomicUsize,
}

impl LogStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn arc(name: impl Into<String>) -> Arc<dyn StepFn> {
        Arc::new(Self::new(name))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StepFn for LogStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, mut state: RunState) -> BoxFuture<'_, Result<RunState>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            state.push_log(self.name.clone());
            Ok(state)
        })
    }
}

/// Always fails with the given message.
pub struct FailingStep {
    name: String,
    message: String,
}

impl FailingStep {
    pub fn arc(name: impl Into<String>, message: impl Into<String>) -> Arc<dyn StepFn> {
        Arc::new(Self {
            name: name.into(),
            message: message.into(),
        })
    }
}

impl StepFn for FailingStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, _state: RunState) -> BoxFuture<'_, Result<RunState>> {
        let message = self.message.clone();
        Box::pin(async move { Err(LoopflowError::Step(message)) })
    }
}

type StepClosure = dyn Fn(RunState) -> Result<RunState> + Send + Sync;

/// Wraps a synchronous closure as a step.
pub struct FnStep {
    name: String,
    f: Box<StepClosure>,
}

impl FnStep {
    pub fn arc<F>(name: impl Into<String>, f: F) -> Arc<dyn StepFn>
    where
        F: Fn(RunState) -> Result<RunState> + Send + Sync + 'static,
    {
        Arc::new(Self {
            name: name.into(),
            f: Box::new(f),
        })
    }
}

impl StepFn for FnStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, state: RunState) -> BoxFuture<'_, Result<RunState>> {
        let result = (self.f)(state);
        Box::pin(async move { result })
    }
}

/// Blocks until a permit is released through [`GatedStep::open`], then logs its name.
pub struct GatedStep {
    name: String,
    gate: Arc<Semaphore>,
}

impl GatedStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    /// Handle used to let one pending call through.
    pub fn gate(&self) -> Arc<Semaphore> {
        self.gate.clone()
    }

    pub fn open(gate: &Semaphore) {
        gate.add_permits(1);
    }
}

impl StepFn for GatedStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, mut state: RunState) -> BoxFuture<'_, Result<RunState>> {
        Box::pin(async move {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| LoopflowError::Step(e.to_string()))?;
            permit.forget();
            state.push_log(self.name.clone());
            Ok(state)
        })
    }
}

/// In-memory store that records every write in order.
#[derive(Default)]
pub struct RecordingStore {
    graphs: Mutex<Vec<GraphRecord>>,
    runs: Mutex<Vec<RunRecord>>,
    fail_writes: AtomicBool,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent write fail with a persistence error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn graph_writes(&self) -> Vec<GraphRecord> {
        self.graphs.lock().unwrap().clone()
    }

    /// Every run write, oldest first.
    pub fn run_writes(&self) -> Vec<RunRecord> {
        self.runs.lock().unwrap().clone()
    }

    /// Writes for one run, oldest first.
    pub fn writes_for(&self, run_id: &RunId) -> Vec<RunRecord> {
        self.run_writes()
            .into_iter()
            .filter(|r| &r.run_id == run_id)
            .collect()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(LoopflowError::Persistence("injected write failure".into()))
        } else {
            Ok(())
        }
    }
}

impl RunStore for RecordingStore {
    fn save_graph(&self, record: &GraphRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();
        Box::pin(async move {
            self.check_writable()?;
            self.graphs.lock().unwrap().push(record);
            Ok(())
        })
    }

    fn save_run(&self, record: &RunRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();
        Box::pin(async move {
            self.check_writable()?;
            self.runs.lock().unwrap().push(record);
            Ok(())
        })
    }

    fn load_graph(&self, graph_id: &GraphId) -> BoxFuture<'_, Result<Option<GraphRecord>>> {
        let graph_id = graph_id.clone();
        Box::pin(async move {
            Ok(self
                .graphs
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|g| g.graph_id == graph_id)
                .cloned())
        })
    }

    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunRecord>>> {
        let run_id = run_id.clone();
        Box::pin(async move { Ok(self.writes_for(&run_id).pop()) })
    }
}
