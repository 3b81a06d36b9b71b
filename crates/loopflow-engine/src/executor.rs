use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use loopflow_core::config::EngineConfig;
use loopflow_core::error::LoopflowError;
use loopflow_core::event::EventBus;
use loopflow_core::types::{GraphId, RunId, RunRecord, RunState, WorkflowEvent};

use crate::graph::{evaluate_branch, GraphDefinition};
use crate::persist::PersistLane;
use crate::registry::RunRegistry;

/// Result of executing one run to termination.
#[derive(Debug)]
pub struct ExecutionResult {
    pub run_id: RunId,
    /// Nodes in the order they were invoked, including a failing one.
    pub visited: Vec<String>,
    /// Number of steps that completed successfully.
    pub steps: usize,
    /// Final state, also stored in the registry.
    pub state: RunState,
    /// The fatal step error, if the run did not reach a terminal node.
    pub failure: Option<LoopflowError>,
    /// Total execution time in milliseconds.
    pub total_elapsed_ms: u64,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Drives one run from the start node to termination.
///
/// Each completed step replaces the run's state in the registry, queues a
/// snapshot on the run's persistence lane, and publishes the log entries it
/// appended. A failing step ends the run with the previous state plus an
/// `error-in-<node>:<error>` entry.
pub struct GraphExecutor {
    run_id: RunId,
    graph_id: GraphId,
    graph: Arc<GraphDefinition>,
    registry: Arc<RunRegistry>,
    events: Arc<EventBus>,
    lane: PersistLane,
    config: EngineConfig,
}

impl GraphExecutor {
    pub fn new(
        run_id: RunId,
        graph_id: GraphId,
        graph: Arc<GraphDefinition>,
        registry: Arc<RunRegistry>,
        events: Arc<EventBus>,
        lane: PersistLane,
        config: EngineConfig,
    ) -> Self {
        Self {
            run_id,
            graph_id,
            graph,
            registry,
            events,
            lane,
            config,
        }
    }

    /// Execute the run, starting from `initial`.
    pub async fn execute(self, initial: RunState) -> ExecutionResult {
        let start = Instant::now();
        let mut state = initial;
        state.ensure_logs();
        let mut emitted = state.log_len();
        let mut visited: Vec<String> = Vec::new();
        let mut branch_taken: HashMap<String, usize> = HashMap::new();
        let mut failure: Option<LoopflowError> = None;
        let mut steps = 0usize;

        self.registry.mark_running(&self.run_id);
        self.events.publish(WorkflowEvent::RunStarted {
            run_id: self.run_id.clone(),
            graph_id: self.graph_id.clone(),
        });
        info!(run_id = %self.run_id, graph_id = %self.graph_id, start = %self.graph.start(), "Run started");

        let mut current = Some(self.graph.start().to_string());
        while let Some(node) = current.take() {
            visited.push(node.clone());

            let Some(step) = self.graph.step(&node) else {
                warn!(run_id = %self.run_id, node = %node, "Node not found in graph");
                self.append_log(&mut state, &mut emitted, format!("error-in-{}:unknown node", node));
                failure = Some(LoopflowError::StepExecution {
                    node,
                    message: "unknown node".into(),
                });
                break;
            };

            debug!(run_id = %self.run_id, node = %node, step = step.name(), "Executing step");
            let step_start = Instant::now();
            match step.call(state.clone()).await {
                Ok(next_state) => {
                    state = next_state;
                    state.ensure_logs();
                    steps += 1;
                    self.commit_step(&mut state, &mut emitted, &node, steps);
                    debug!(
                        run_id = %self.run_id,
                        node = %node,
                        elapsed_ms = step_start.elapsed().as_millis() as u64,
                        "Step complete"
                    );
                }
                Err(e) => {
                    warn!(run_id = %self.run_id, node = %node, error = %e, "Step failed, ending run");
                    self.append_log(&mut state, &mut emitted, format!("error-in-{}:{}", node, e));
                    failure = Some(LoopflowError::StepExecution {
                        node,
                        message: e.to_string(),
                    });
                    break;
                }
            }

            current = self.next_node(&node, &mut state, &mut emitted, &mut branch_taken);

            if current.is_some() {
                if self.config.step_delay_ms > 0 {
                    tokio::time::sleep(self.config.step_delay()).await;
                } else {
                    tokio::task::yield_now().await;
                }
            }
        }

        self.finish(&state, failure.is_some());

        let total_elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            run_id = %self.run_id,
            steps,
            failed = failure.is_some(),
            total_elapsed_ms,
            "Run finished"
        );

        ExecutionResult {
            run_id: self.run_id,
            visited,
            steps,
            state,
            failure,
            total_elapsed_ms,
        }
    }

    /// Compute the successor of `node`: default edge, unless its branch rule
    /// fires and the per-node override budget is not yet spent.
    fn next_node(
        &self,
        node: &str,
        state: &mut RunState,
        emitted: &mut usize,
        branch_taken: &mut HashMap<String, usize>,
    ) -> Option<String> {
        let default = self.graph.default_next(node).map(str::to_string);

        let Some(rule) = self.graph.branch(node) else {
            return default;
        };
        let Some(target) = evaluate_branch(rule, state, self.graph.branch_threshold()) else {
            return default;
        };

        let taken = branch_taken.entry(node.to_string()).or_insert(0);
        if *taken < self.config.max_branch_iterations {
            *taken += 1;
            debug!(run_id = %self.run_id, node = %node, target = %target, iteration = *taken, "Branch override taken");
            return Some(target.to_string());
        }

        warn!(
            run_id = %self.run_id,
            node = %node,
            limit = self.config.max_branch_iterations,
            "Branch limit reached, following default edge"
        );
        self.append_log(state, emitted, format!("branch-limit-reached:{}", node));
        default
    }

    /// Publish a completed step: registry, durable lane, then live log lines.
    fn commit_step(&self, state: &mut RunState, emitted: &mut usize, node: &str, step: usize) {
        let new_lines = state.logs_since(*emitted);
        self.apply_retention(state);
        *emitted = state.log_len();

        match self.registry.replace_state(&self.run_id, state.clone()) {
            Ok(record) => self.lane.submit(record),
            Err(e) => warn!(run_id = %self.run_id, error = %e, "Run vanished from registry"),
        }

        for line in new_lines {
            self.events.publish(WorkflowEvent::Log {
                run_id: self.run_id.clone(),
                line,
            });
        }
        self.events.publish(WorkflowEvent::StepCompleted {
            run_id: self.run_id.clone(),
            node: node.to_string(),
            step,
        });
    }

    /// Append an engine bookkeeping entry and publish it immediately.
    fn append_log(&self, state: &mut RunState, emitted: &mut usize, entry: String) {
        state.push_log(entry.clone());
        self.apply_retention(state);
        *emitted = state.log_len();
        self.events.publish(WorkflowEvent::Log {
            run_id: self.run_id.clone(),
            line: entry,
        });
    }

    fn apply_retention(&self, state: &mut RunState) {
        if let Some(max) = self.config.max_log_entries {
            let dropped = state.retain_recent_logs(max);
            if dropped > 0 {
                debug!(run_id = %self.run_id, dropped, "Trimmed run log");
            }
        }
    }

    fn finish(&self, state: &RunState, failed: bool) {
        let record = match self.registry.finish(&self.run_id, state.clone()) {
            Ok(record) => record,
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "Run vanished from registry");
                RunRecord {
                    run_id: self.run_id.clone(),
                    graph_id: self.graph_id.clone(),
                    state: state.clone(),
                    finished: true,
                    updated_at: chrono::Utc::now(),
                }
            }
        };
        self.lane.submit(record);
        self.events.publish(WorkflowEvent::RunFinished {
            run_id: self.run_id.clone(),
            failed,
        });
    }
}
