use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use loopflow_core::config::EngineConfig;
use loopflow_core::error::{LoopflowError, Result};
use loopflow_core::event::{EventBus, RunSubscription};
use loopflow_core::traits::RunStore;
use loopflow_core::types::{GraphId, RunId, RunSnapshot, RunState, LOGS_FIELD, RUN_STARTED_LOG};

use crate::executor::GraphExecutor;
use crate::graph::GraphDefinition;
use crate::persist::{persist_graph, PersistLane};
use crate::registry::RunRegistry;

/// Entry point for registering graphs, starting runs, and observing them.
///
/// Run executions and durable writes are detached tasks on an internal
/// [`TaskTracker`]; [`drain`](Self::drain) waits for all of them.
pub struct WorkflowEngine {
    registry: Arc<RunRegistry>,
    store: Arc<dyn RunStore>,
    events: Arc<EventBus>,
    tracker: TaskTracker,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn RunStore>) -> Self {
        let events = Arc::new(EventBus::new(config.event_capacity));
        Self {
            registry: Arc::new(RunRegistry::new()),
            store,
            events,
            tracker: TaskTracker::new(),
            config,
        }
    }

    /// Validate and register a graph. Persistence happens in the background.
    pub fn register_graph(&self, graph: GraphDefinition) -> Result<GraphId> {
        graph.validate()?;
        let (graph_id, graph) = self.registry.insert_graph(graph);
        info!(graph_id = %graph_id, nodes = graph.node_count(), start = %graph.start(), "Graph registered");
        persist_graph(self.store.clone(), &self.tracker, graph.to_record(&graph_id));
        Ok(graph_id)
    }

    /// Start a run and return its id without waiting for execution.
    ///
    /// The registry snapshot starts as `fields` plus a `run-started` log
    /// entry; execution begins from `fields` alone.
    pub fn start_run(&self, graph_id: &GraphId, fields: Map<String, Value>) -> Result<RunId> {
        let graph = self.registry.graph(graph_id)?;

        let initial = RunState::from_fields(fields);
        let mut seed = initial.clone();
        if !seed.contains_key(LOGS_FIELD) {
            seed.push_log(RUN_STARTED_LOG);
        }

        let (run_id, record) = self.registry.create_run(graph_id, seed);
        let lane = PersistLane::spawn(self.store.clone(), &self.tracker);
        lane.submit(record);

        let executor = GraphExecutor::new(
            run_id.clone(),
            graph_id.clone(),
            graph,
            self.registry.clone(),
            self.events.clone(),
            lane,
            self.config.clone(),
        );
        self.tracker.spawn(async move {
            let result = executor.execute(initial).await;
            debug!(run_id = %result.run_id, visited = ?result.visited, "Run task exited");
        });

        info!(run_id = %run_id, graph_id = %graph_id, "Run scheduled");
        Ok(run_id)
    }

    /// Current in-memory view of a run. May be ahead of the durable copy.
    pub fn get_run(&self, run_id: &RunId) -> Result<RunSnapshot> {
        self.registry.snapshot(run_id)
    }

    /// Subscribe to the live log lines of a known run.
    ///
    /// The subscription consults the registry after a lag, so it still ends
    /// when the lag swallowed the run's finish event.
    pub fn subscribe(&self, run_id: &RunId) -> Result<RunSubscription> {
        if !self.registry.contains_run(run_id) {
            return Err(LoopflowError::RunNotFound(run_id.to_string()));
        }
        let registry = self.registry.clone();
        let id = run_id.clone();
        Ok(self
            .events
            .subscribe_run(run_id.clone())
            .with_finished_check(Arc::new(move || registry.is_finished(&id))))
    }

    /// Wait for every run and durable write spawned so far.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Number of tracked tasks still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn registry(&self) -> Arc<RunRegistry> {
        self.registry.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopflow_core::types::{BranchRule, RunPhase, WorkflowEvent};
    use loopflow_test_utils::{
        fast_engine_config, FailingStep, FnStep, GatedStep, LogStep, RecordingStore,
    };
    use serde_json::json;

    fn engine(store: Arc<RecordingStore>) -> WorkflowEngine {
        WorkflowEngine::new(fast_engine_config(), store)
    }

    fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn a_to_b() -> GraphDefinition {
        GraphDefinition::new("A")
            .with_node("A", LogStep::arc("A"))
            .with_node("B", LogStep::arc("B"))
            .with_edge("A", "B")
            .with_terminal("B")
    }

    /// `score` starts at 3 and `improve` raises it by 2 per pass.
    fn scoring_graph(threshold: i64) -> GraphDefinition {
        GraphDefinition::new("score")
            .with_node(
                "score",
                FnStep::arc("score", |mut s| {
                    let score = s.get_i64("quality").unwrap_or(3);
                    s.set("quality", json!(score));
                    s.push_log(format!("score -> {}", score));
                    Ok(s)
                }),
            )
            .with_node(
                "improve",
                FnStep::arc("improve", |mut s| {
                    let score = s.get_i64("quality").unwrap_or(0) + 2;
                    s.set("quality", json!(score));
                    s.push_log("improve");
                    Ok(s)
                }),
            )
            .with_node("report", LogStep::arc("report"))
            .with_edge("score", "report")
            .with_edge("improve", "score")
            .with_terminal("report")
            .with_branch("score", BranchRule::score_below("quality", "improve"))
            .with_branch_threshold(threshold)
    }

    #[tokio::test]
    async fn test_linear_run_logs_in_order() {
        let store = RecordingStore::new();
        let engine = engine(store.clone());
        let graph_id = engine.register_graph(a_to_b()).unwrap();

        let run_id = engine.start_run(&graph_id, Map::new()).unwrap();
        engine.drain().await;

        let snap = engine.get_run(&run_id).unwrap();
        assert!(snap.finished);
        assert_eq!(snap.phase, RunPhase::Finished);
        assert_eq!(snap.logs, vec!["A", "B"]);
        assert_eq!(engine.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_start_run_returns_before_execution() {
        let engine = engine(RecordingStore::new());
        let graph_id = engine.register_graph(a_to_b()).unwrap();

        let run_id = engine.start_run(&graph_id, Map::new()).unwrap();
        let snap = engine.get_run(&run_id).unwrap();
        assert!(!snap.finished);
        assert_eq!(snap.phase, RunPhase::Pending);
        assert_eq!(snap.logs, vec![RUN_STARTED_LOG]);

        engine.drain().await;
        assert!(engine.get_run(&run_id).unwrap().finished);
    }

    #[tokio::test]
    async fn test_unknown_graph_creates_no_run() {
        let engine = engine(RecordingStore::new());
        let err = engine.start_run(&GraphId::new(), Map::new()).unwrap_err();
        assert!(matches!(err, LoopflowError::GraphNotFound(_)));
        assert_eq!(engine.registry().run_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_graph_rejected_at_registration() {
        let store = RecordingStore::new();
        let engine = engine(store.clone());
        let err = engine
            .register_graph(a_to_b().with_edge("B", "ghost"))
            .unwrap_err();
        assert!(matches!(err, LoopflowError::Configuration(_)));
        engine.drain().await;
        assert!(store.graph_writes().is_empty());
        assert_eq!(engine.registry().graph_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_run_lookups() {
        let engine = engine(RecordingStore::new());
        assert!(engine.get_run(&RunId::new()).unwrap_err().is_not_found());
        assert!(engine.subscribe(&RunId::new()).is_err());
    }

    #[tokio::test]
    async fn test_step_failure_keeps_last_state() {
        let store = RecordingStore::new();
        let engine = engine(store.clone());
        let graph = GraphDefinition::new("A")
            .with_node("A", LogStep::arc("A"))
            .with_node("X", FailingStep::arc("X", "boom"))
            .with_node("C", LogStep::arc("C"))
            .with_edge("A", "X")
            .with_edge("X", "C")
            .with_terminal("C");
        let graph_id = engine.register_graph(graph).unwrap();

        let run_id = engine
            .start_run(&graph_id, fields(&[("code", json!("x = 1"))]))
            .unwrap();
        engine.drain().await;

        let snap = engine.get_run(&run_id).unwrap();
        assert!(snap.finished);
        assert_eq!(snap.logs, vec!["A", "error-in-X:boom"]);
        assert_eq!(snap.state.get_str("code"), Some("x = 1"));

        let last = store.writes_for(&run_id).pop().unwrap();
        assert!(last.finished);
        assert_eq!(last.state.logs(), snap.logs);
    }

    #[tokio::test]
    async fn test_branch_loops_until_threshold() {
        let engine = engine(RecordingStore::new());
        let graph_id = engine.register_graph(scoring_graph(7)).unwrap();

        let run_id = engine.start_run(&graph_id, Map::new()).unwrap();
        engine.drain().await;

        let snap = engine.get_run(&run_id).unwrap();
        assert!(snap.finished);
        assert_eq!(
            snap.logs,
            vec![
                "score -> 3",
                "improve",
                "score -> 5",
                "improve",
                "score -> 7",
                "report"
            ]
        );
    }

    #[tokio::test]
    async fn test_branch_not_taken_at_threshold() {
        let engine = engine(RecordingStore::new());
        let graph_id = engine.register_graph(scoring_graph(3)).unwrap();

        let run_id = engine.start_run(&graph_id, Map::new()).unwrap();
        engine.drain().await;

        assert_eq!(engine.get_run(&run_id).unwrap().logs, vec!["score -> 3", "report"]);
    }

    #[tokio::test]
    async fn test_branch_decided_by_graph_threshold() {
        let engine = engine(RecordingStore::new());
        let lenient = engine
            .register_graph(scoring_graph(7).with_branch_threshold(3))
            .unwrap();
        let strict = engine
            .register_graph(scoring_graph(3).with_branch_threshold(5))
            .unwrap();

        let lenient_run = engine.start_run(&lenient, Map::new()).unwrap();
        let strict_run = engine.start_run(&strict, Map::new()).unwrap();
        engine.drain().await;

        assert_eq!(
            engine.get_run(&lenient_run).unwrap().logs,
            vec!["score -> 3", "report"]
        );
        assert_eq!(
            engine.get_run(&strict_run).unwrap().logs,
            vec!["score -> 3", "improve", "score -> 5", "report"]
        );
    }

    #[tokio::test]
    async fn test_branch_limit_falls_back_to_default_edge() {
        let config = EngineConfig {
            max_branch_iterations: 1,
            ..fast_engine_config()
        };
        let engine = WorkflowEngine::new(config, RecordingStore::new());
        let graph_id = engine.register_graph(scoring_graph(100)).unwrap();

        let run_id = engine.start_run(&graph_id, Map::new()).unwrap();
        engine.drain().await;

        let snap = engine.get_run(&run_id).unwrap();
        assert!(snap.finished);
        assert_eq!(
            snap.logs,
            vec![
                "score -> 3",
                "improve",
                "score -> 5",
                "branch-limit-reached:score",
                "report"
            ]
        );
    }

    #[tokio::test]
    async fn test_subscriber_sees_logs_in_order() {
        let engine = engine(RecordingStore::new());
        let graph_id = engine.register_graph(scoring_graph(7)).unwrap();

        let run_id = engine.start_run(&graph_id, Map::new()).unwrap();
        let mut sub = engine.subscribe(&run_id).unwrap();

        let mut lines = Vec::new();
        while let Some(line) = sub.next_log().await {
            lines.push(line);
        }
        engine.drain().await;

        assert_eq!(lines, engine.get_run(&run_id).unwrap().logs);
    }

    #[tokio::test]
    async fn test_non_string_seed_logs_do_not_hide_lines() {
        let engine = engine(RecordingStore::new());
        let graph_id = engine.register_graph(a_to_b()).unwrap();

        let run_id = engine
            .start_run(&graph_id, fields(&[("logs", json!([42, "seed"]))]))
            .unwrap();
        let mut sub = engine.subscribe(&run_id).unwrap();

        let mut lines = Vec::new();
        while let Some(line) = sub.next_log().await {
            lines.push(line);
        }
        assert_eq!(lines, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_ends_after_run_finishes() {
        let config = EngineConfig {
            event_capacity: 2,
            ..fast_engine_config()
        };
        let engine = WorkflowEngine::new(config, RecordingStore::new());
        let graph_id = engine.register_graph(a_to_b()).unwrap();

        let run_id = engine.start_run(&graph_id, Map::new()).unwrap();
        let mut sub = engine.subscribe(&run_id).unwrap();
        engine.drain().await;

        // Push this run's finish event out of the buffer
        let other = RunId::new();
        for line in ["x", "y"] {
            engine.event_bus().publish(WorkflowEvent::Log {
                run_id: other.clone(),
                line: line.to_string(),
            });
        }

        let ended = tokio::time::timeout(std::time::Duration::from_millis(300), async {
            while sub.next_log().await.is_some() {}
        })
        .await;
        assert!(ended.is_ok());
    }

    #[tokio::test]
    async fn test_status_reflects_latest_completed_step() {
        let engine = engine(RecordingStore::new());
        let gated = GatedStep::new("B");
        let gate = gated.gate();
        let graph = GraphDefinition::new("A")
            .with_node("A", LogStep::arc("A"))
            .with_node("B", Arc::new(gated))
            .with_edge("A", "B")
            .with_terminal("B");
        let graph_id = engine.register_graph(graph).unwrap();

        let run_id = engine.start_run(&graph_id, Map::new()).unwrap();
        let mut sub = engine.subscribe(&run_id).unwrap();
        assert_eq!(sub.next_log().await.as_deref(), Some("A"));

        let snap = engine.get_run(&run_id).unwrap();
        assert!(!snap.finished);
        assert_eq!(snap.phase, RunPhase::Running);
        assert_eq!(snap.logs, vec!["A"]);

        GatedStep::open(&gate);
        engine.drain().await;
        assert_eq!(engine.get_run(&run_id).unwrap().logs, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_abort_run() {
        let store = RecordingStore::new();
        store.fail_writes(true);
        let engine = engine(store.clone());
        let graph_id = engine.register_graph(a_to_b()).unwrap();

        let run_id = engine.start_run(&graph_id, Map::new()).unwrap();
        engine.drain().await;

        let snap = engine.get_run(&run_id).unwrap();
        assert!(snap.finished);
        assert_eq!(snap.logs, vec!["A", "B"]);
        assert!(store.run_writes().is_empty());
    }

    #[tokio::test]
    async fn test_snapshots_persisted_in_step_order() {
        let store = RecordingStore::new();
        let engine = engine(store.clone());
        let graph_id = engine.register_graph(a_to_b()).unwrap();

        let run_id = engine.start_run(&graph_id, Map::new()).unwrap();
        engine.drain().await;

        let writes = store.writes_for(&run_id);
        let logs: Vec<Vec<String>> = writes.iter().map(|w| w.state.logs()).collect();
        assert_eq!(
            logs,
            vec![
                vec![RUN_STARTED_LOG.to_string()],
                vec!["A".to_string()],
                vec!["A".to_string(), "B".to_string()],
                vec!["A".to_string(), "B".to_string()],
            ]
        );
        let finished: Vec<bool> = writes.iter().map(|w| w.finished).collect();
        assert_eq!(finished, vec![false, false, false, true]);
        assert_eq!(store.graph_writes().len(), 1);
    }

    #[tokio::test]
    async fn test_log_retention_bound() {
        let config = EngineConfig {
            max_log_entries: Some(2),
            ..fast_engine_config()
        };
        let engine = WorkflowEngine::new(config, RecordingStore::new());
        let graph_id = engine.register_graph(scoring_graph(7)).unwrap();

        let run_id = engine.start_run(&graph_id, Map::new()).unwrap();
        engine.drain().await;

        assert_eq!(
            engine.get_run(&run_id).unwrap().logs,
            vec!["score -> 7", "report"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_are_independent() {
        let engine = Arc::new(engine(RecordingStore::new()));
        let graph_id = engine.register_graph(scoring_graph(7)).unwrap();

        let mut run_ids = Vec::new();
        for i in 0..20 {
            let run_id = engine
                .start_run(&graph_id, fields(&[("quality", json!(i % 8))]))
                .unwrap();
            run_ids.push((run_id, i % 8));
        }
        engine.drain().await;

        for (run_id, seed) in run_ids {
            let snap = engine.get_run(&run_id).unwrap();
            assert!(snap.finished);
            assert_eq!(snap.logs.first().cloned(), Some(format!("score -> {}", seed)));
            assert_eq!(snap.logs.last().map(String::as_str), Some("report"));
            assert!(snap.state.get_i64("quality").unwrap() >= 7);
        }
    }
}
