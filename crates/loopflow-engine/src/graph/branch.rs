use loopflow_core::types::{BranchRule, RunState};

/// Evaluate a branch rule against the state produced by its node.
///
/// `threshold` is the owning graph's `branch_threshold`. Returns the override
/// target when the rule fires.
pub fn evaluate_branch<'a>(
    rule: &'a BranchRule,
    state: &RunState,
    threshold: i64,
) -> Option<&'a str> {
    let fires = match rule {
        BranchRule::ScoreBelow { field, .. } => {
            let score = state.get_f64(field).unwrap_or(0.0);
            score < threshold as f64
        }
    };
    fires.then(|| rule.target())
}
