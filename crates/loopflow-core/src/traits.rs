use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{GraphId, GraphRecord, RunId, RunRecord, RunState};

/// The unit of work bound to a graph node.
///
/// Receives the run state by value and returns the updated state. Output must
/// be deterministic for a given input; any error is fatal to the run.
pub trait StepFn: Send + Sync + 'static {
    /// Step name, used in logs.
    fn name(&self) -> &str;

    /// Execute the step.
    fn call(&self, state: RunState) -> BoxFuture<'_, Result<RunState>>;
}

/// Durable record of graph definitions and run snapshots.
///
/// Writes are last-write-wins per id. Callers treat failures as best-effort.
pub trait RunStore: Send + Sync + 'static {
    /// Insert or replace a graph definition.
    fn save_graph(&self, record: &GraphRecord) -> BoxFuture<'_, Result<()>>;

    /// Insert or replace a run snapshot.
    fn save_run(&self, record: &RunRecord) -> BoxFuture<'_, Result<()>>;

    /// Load a graph definition.
    fn load_graph(&self, graph_id: &GraphId) -> BoxFuture<'_, Result<Option<GraphRecord>>>;

    /// Load the latest snapshot of a run.
    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunRecord>>>;
}

/// Store that accepts and discards every write.
#[derive(Debug, Default)]
pub struct NullStore;

impl RunStore for NullStore {
    fn save_graph(&self, _record: &GraphRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn save_run(&self, _record: &RunRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn load_graph(&self, _graph_id: &GraphId) -> BoxFuture<'_, Result<Option<GraphRecord>>> {
        Box::pin(async { Ok(None) })
    }

    fn load_run(&self, _run_id: &RunId) -> BoxFuture<'_, Result<Option<RunRecord>>> {
        Box::pin(async { Ok(None) })
    }
}
