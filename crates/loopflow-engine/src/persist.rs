use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use loopflow_core::traits::RunStore;
use loopflow_core::types::{GraphRecord, RunRecord};

/// Per-run FIFO of snapshots headed for the durable store.
///
/// A single writer task drains the lane, so writes for one run land in
/// submission order. Submitting never waits for the write.
pub struct PersistLane {
    tx: mpsc::UnboundedSender<RunRecord>,
}

impl PersistLane {
    /// Create a lane and spawn its writer on `tracker`.
    ///
    /// The writer exits once the lane is dropped and its backlog is written.
    pub fn spawn(store: Arc<dyn RunStore>, tracker: &TaskTracker) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RunRecord>();
        tracker.spawn(async move {
            while let Some(record) = rx.recv().await {
                match store.save_run(&record).await {
                    Ok(()) => debug!(
                        run_id = %record.run_id,
                        finished = record.finished,
                        "Run snapshot persisted"
                    ),
                    Err(e) => warn!(
                        run_id = %record.run_id,
                        error = %e,
                        "Failed to persist run snapshot"
                    ),
                }
            }
        });
        Self { tx }
    }

    /// Queue a snapshot. Best-effort: a closed lane is logged and ignored.
    pub fn submit(&self, record: RunRecord) {
        if let Err(e) = self.tx.send(record) {
            warn!(run_id = %e.0.run_id, "Persistence lane closed, snapshot dropped");
        }
    }
}

/// Persist a graph definition in the background.
pub fn persist_graph(store: Arc<dyn RunStore>, tracker: &TaskTracker, record: GraphRecord) {
    tracker.spawn(async move {
        match store.save_graph(&record).await {
            Ok(()) => debug!(graph_id = %record.graph_id, "Graph persisted"),
            Err(e) => warn!(graph_id = %record.graph_id, error = %e, "Failed to persist graph"),
        }
    });
}
