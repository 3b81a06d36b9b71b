use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::debug;

use crate::types::{RunId, WorkflowEvent};

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events published after they subscribed.
pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // No receivers means nobody is watching; nothing to deliver.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }

    /// Subscribe to the live log stream of a single run.
    pub fn subscribe_run(&self, run_id: RunId) -> RunSubscription {
        RunSubscription {
            run_id,
            rx: self.tx.subscribe(),
            finished_check: None,
            draining: false,
            done: false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Reports whether a run has already finished.
pub type FinishedCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Live log lines of one run, in emission order.
///
/// No history is replayed. Lines dropped because this subscriber lagged
/// are skipped, not redelivered. The stream ends when the run finishes.
///
/// A lag may swallow the run's `RunFinished` event. With a finished check
/// attached, the subscription then drains what is still buffered and ends;
/// without one it can only end on `RunFinished` or a closed bus.
pub struct RunSubscription {
    run_id: RunId,
    rx: broadcast::Receiver<WorkflowEvent>,
    finished_check: Option<FinishedCheck>,
    draining: bool,
    done: bool,
}

impl RunSubscription {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Attach the check consulted after a lag.
    pub fn with_finished_check(mut self, check: FinishedCheck) -> Self {
        self.finished_check = Some(check);
        self
    }

    /// Next log line, or `None` once the run has finished or the bus closed.
    pub async fn next_log(&mut self) -> Option<String> {
        while !self.done {
            let received = if self.draining {
                match self.rx.try_recv() {
                    Ok(event) => Ok(event),
                    Err(TryRecvError::Lagged(n)) => Err(RecvError::Lagged(n)),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => {
                        self.done = true;
                        break;
                    }
                }
            } else {
                self.rx.recv().await
            };

            match received {
                Ok(event) if event.run_id() != &self.run_id => {}
                Ok(WorkflowEvent::Log { line, .. }) => return Some(line),
                Ok(WorkflowEvent::RunFinished { .. }) | Err(RecvError::Closed) => {
                    self.done = true;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    debug!(run_id = %self.run_id, skipped = n, "Run subscriber lagged, skipped events");
                    if self.finished_check.as_ref().is_some_and(|check| check()) {
                        self.draining = true;
                    }
                }
            }
        }
        None
    }
}
