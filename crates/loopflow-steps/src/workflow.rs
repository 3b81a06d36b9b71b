use std::sync::Arc;

use loopflow_core::types::BranchRule;
use loopflow_engine::GraphDefinition;

use crate::code_review::{
    CheckComplexity, ComputeQuality, DetectIssues, ExtractFunctions, SuggestImprovements,
    QUALITY_FIELD,
};

pub const EXTRACT_FUNCTIONS: &str = "extract_functions";
pub const CHECK_COMPLEXITY: &str = "check_complexity";
pub const DETECT_ISSUES: &str = "detect_issues";
pub const SUGGEST_IMPROVEMENTS: &str = "suggest_improvements";
pub const COMPUTE_QUALITY: &str = "compute_quality";

/// Build the code-review workflow.
///
/// Runs the five heuristics in order, then loops from `compute_quality` back
/// to `suggest_improvements` while `quality_score < threshold`.
pub fn code_review_workflow(threshold: i64) -> GraphDefinition {
    GraphDefinition::new(EXTRACT_FUNCTIONS)
        .with_node(EXTRACT_FUNCTIONS, Arc::new(ExtractFunctions))
        .with_node(CHECK_COMPLEXITY, Arc::new(CheckComplexity))
        .with_node(DETECT_ISSUES, Arc::new(DetectIssues))
        .with_node(SUGGEST_IMPROVEMENTS, Arc::new(SuggestImprovements))
        .with_node(COMPUTE_QUALITY, Arc::new(ComputeQuality))
        .with_edge(EXTRACT_FUNCTIONS, CHECK_COMPLEXITY)
        .with_edge(CHECK_COMPLEXITY, DETECT_ISSUES)
        .with_edge(DETECT_ISSUES, SUGGEST_IMPROVEMENTS)
        .with_edge(SUGGEST_IMPROVEMENTS, COMPUTE_QUALITY)
        .with_terminal(COMPUTE_QUALITY)
        .with_branch(
            COMPUTE_QUALITY,
            BranchRule::score_below(QUALITY_FIELD, SUGGEST_IMPROVEMENTS),
        )
        .with_branch_threshold(threshold)
}
