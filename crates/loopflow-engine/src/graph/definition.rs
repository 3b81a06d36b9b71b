use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use loopflow_core::error::{LoopflowError, Result};
use loopflow_core::traits::StepFn;
use loopflow_core::types::{BranchRule, GraphId, GraphRecord};

/// Immutable workflow template.
///
/// Built with the `with_*` methods, then validated once by the registry.
#[derive(Clone)]
pub struct GraphDefinition {
    start: String,
    nodes: HashMap<String, Arc<dyn StepFn>>,
    edges: HashMap<String, Option<String>>,
    branches: HashMap<String, BranchRule>,
    branch_threshold: i64,
}

impl GraphDefinition {
    /// Create an empty graph that starts at `start`.
    pub fn new(start: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            nodes: HashMap::new(),
            edges: HashMap::new(),
            branches: HashMap::new(),
            branch_threshold: 0,
        }
    }

    /// Bind a step function to a node name.
    pub fn with_node(mut self, name: impl Into<String>, step: Arc<dyn StepFn>) -> Self {
        self.nodes.insert(name.into(), step);
        self
    }

    /// Set the default next node.
    pub fn with_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.insert(from.into(), Some(to.into()));
        self
    }

    /// Mark a node as terminal.
    pub fn with_terminal(mut self, node: impl Into<String>) -> Self {
        self.edges.insert(node.into(), None);
        self
    }

    /// Attach a branch rule, evaluated after `node` completes.
    pub fn with_branch(mut self, node: impl Into<String>, rule: BranchRule) -> Self {
        self.branches.insert(node.into(), rule);
        self
    }

    pub fn with_branch_threshold(mut self, threshold: i64) -> Self {
        self.branch_threshold = threshold;
        self
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn step(&self, node: &str) -> Option<&Arc<dyn StepFn>> {
        self.nodes.get(node)
    }

    /// Default successor of `node`; `None` for terminal or missing edges.
    pub fn default_next(&self, node: &str) -> Option<&str> {
        self.edges.get(node).and_then(|next| next.as_deref())
    }

    pub fn branch(&self, node: &str) -> Option<&BranchRule> {
        self.branches.get(node)
    }

    pub fn branch_threshold(&self) -> i64 {
        self.branch_threshold
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Check structural invariants.
    ///
    /// Every node named by `start`, by an edge (either end), or by a branch
    /// rule (either end) must exist, and default edges reachable from `start`
    /// must not form a cycle.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(LoopflowError::Configuration("graph has no nodes".into()));
        }
        if !self.nodes.contains_key(&self.start) {
            return Err(LoopflowError::Configuration(format!(
                "start node '{}' is not defined",
                self.start
            )));
        }

        for (from, to) in &self.edges {
            self.require_node(from, "edge source")?;
            if let Some(to) = to {
                self.require_node(to, &format!("edge target of '{}'", from))?;
            }
        }

        for (node, rule) in &self.branches {
            self.require_node(node, "branch source")?;
            self.require_node(rule.target(), &format!("branch target of '{}'", node))?;
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let mut path: Vec<&str> = Vec::new();
        let mut current = Some(self.start.as_str());
        while let Some(node) = current {
            path.push(node);
            if !seen.insert(node) {
                return Err(LoopflowError::Configuration(format!(
                    "default edges form a cycle: {}",
                    path.join(" -> ")
                )));
            }
            current = self.default_next(node);
        }

        Ok(())
    }

    fn require_node(&self, name: &str, role: &str) -> Result<()> {
        if self.nodes.contains_key(name) {
            Ok(())
        } else {
            Err(LoopflowError::Configuration(format!(
                "{} '{}' is not a defined node",
                role, name
            )))
        }
    }

    /// Serializable description for the durable store.
    pub fn to_record(&self, graph_id: &GraphId) -> GraphRecord {
        let mut nodes: Vec<String> = self.nodes.keys().cloned().collect();
        nodes.sort();
        GraphRecord {
            graph_id: graph_id.clone(),
            start: self.start.clone(),
            nodes,
            edges: self
                .edges
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
            branches: self
                .branches
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
            branch_threshold: self.branch_threshold,
        }
    }
}

impl std::fmt::Debug for GraphDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut nodes: Vec<&String> = self.nodes.keys().collect();
        nodes.sort();
        f.debug_struct("GraphDefinition")
            .field("start", &self.start)
            .field("nodes", &nodes)
            .field("edges", &self.edges)
            .field("branches", &self.branches)
            .field("branch_threshold", &self.branch_threshold)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopflow_test_utils::LogStep;

    fn linear() -> GraphDefinition {
        GraphDefinition::new("a")
            .with_node("a", LogStep::arc("a"))
            .with_node("b", LogStep::arc("b"))
            .with_edge("a", "b")
            .with_terminal("b")
    }

    fn config_error(def: &GraphDefinition) -> String {
        match def.validate() {
            Err(LoopflowError::Configuration(msg)) => msg,
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_linear_graph_is_valid() {
        let def = linear();
        def.validate().unwrap();
        assert_eq!(def.start(), "a");
        assert_eq!(def.default_next("a"), Some("b"));
        assert_eq!(def.default_next("b"), None);
        assert_eq!(def.node_count(), 2);
    }

    #[test]
    fn test_empty_graph_rejected() {
        let msg = config_error(&GraphDefinition::new("a"));
        assert!(msg.contains("no nodes"));
    }

    #[test]
    fn test_unknown_start_rejected() {
        let def = GraphDefinition::new("missing").with_node("a", LogStep::arc("a"));
        assert!(config_error(&def).contains("start node 'missing'"));
    }

    #[test]
    fn test_unknown_edge_target_rejected() {
        let def = linear().with_edge("b", "ghost");
        assert!(config_error(&def).contains("'ghost'"));
    }

    #[test]
    fn test_unknown_edge_source_rejected() {
        let def = linear().with_edge("ghost", "a");
        assert!(config_error(&def).contains("edge source 'ghost'"));
    }

    #[test]
    fn test_unknown_branch_target_rejected() {
        let def = linear().with_branch("b", BranchRule::score_below("score", "ghost"));
        assert!(config_error(&def).contains("branch target"));
    }

    #[test]
    fn test_default_edge_cycle_rejected() {
        let def = linear().with_edge("b", "a");
        assert!(config_error(&def).contains("a -> b -> a"));
    }

    #[test]
    fn test_branch_loop_is_allowed() {
        let def = linear().with_branch("b", BranchRule::score_below("score", "a"));
        def.validate().unwrap();
    }

    #[test]
    fn test_missing_edge_entry_is_terminal() {
        let def = GraphDefinition::new("a").with_node("a", LogStep::arc("a"));
        def.validate().unwrap();
        assert_eq!(def.default_next("a"), None);
    }

    #[test]
    fn test_to_record() {
        let def = linear()
            .with_branch("b", BranchRule::score_below("score", "a"))
            .with_branch_threshold(7);
        let id = GraphId::new();
        let record = def.to_record(&id);
        assert_eq!(record.graph_id, id);
        assert_eq!(record.start, "a");
        assert_eq!(record.nodes, vec!["a", "b"]);
        assert_eq!(record.edges.get("a"), Some(&Some("b".to_string())));
        assert_eq!(record.edges.get("b"), Some(&None));
        assert_eq!(record.branches.len(), 1);
        assert_eq!(record.branch_threshold, 7);
    }
}
