//! Rule-based code-review heuristics.
//!
//! Each step reads the `code` field (or what earlier steps produced), writes
//! its result back into the run state and appends one log entry. The
//! heuristics are deliberately shallow: they exist to drive the workflow, not
//! to review code.

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use loopflow_core::error::Result;
use loopflow_core::traits::StepFn;
use loopflow_core::types::RunState;

pub const CODE_FIELD: &str = "code";
pub const FUNCTIONS_FIELD: &str = "functions";
pub const COMPLEXITY_FIELD: &str = "complexity";
pub const ISSUES_FIELD: &str = "issues";
pub const SUGGESTIONS_FIELD: &str = "suggestions";
pub const QUALITY_FIELD: &str = "quality_score";

/// Placeholder recorded when the source defines no functions.
pub const NO_FUNCTION_FOUND: &str = "<no_function_found>";

const LONG_LINE_LIMIT: usize = 120;
const BASE_COMPLEXITY: i64 = 3;
const DEFAULT_COMPLEXITY: i64 = 5;
const HIGH_COMPLEXITY: i64 = 6;
const MAX_QUALITY: i64 = 10;

pub const ISSUE_PRINT: &str = "use-logging-instead-of-print";
pub const ISSUE_NESTING: &str = "possible-deep-nesting";
const ISSUE_LONG_LINE_PREFIX: &str = "long-line";

fn string_array(items: &[String]) -> Value {
    Value::Array(items.iter().cloned().map(Value::String).collect())
}

/// Collects the names of `def` lines into `functions`.
pub struct ExtractFunctions;

impl StepFn for ExtractFunctions {
    fn name(&self) -> &str {
        "extract_functions"
    }

    fn call(&self, mut state: RunState) -> BoxFuture<'_, Result<RunState>> {
        Box::pin(async move {
            let code = state.get_str(CODE_FIELD).unwrap_or_default();
            let mut functions = function_names(code);
            if functions.is_empty() {
                functions.push(NO_FUNCTION_FOUND.to_string());
            }

            debug!(count = functions.len(), "Extracted functions");
            state.set(FUNCTIONS_FIELD, string_array(&functions));
            state.push_log(format!("extract_functions -> {} found", functions.len()));
            Ok(state)
        })
    }
}

fn function_names(code: &str) -> Vec<String> {
    code.lines()
        .map(str::trim)
        .filter(|line| line.starts_with("def "))
        .map(|line| {
            let head = line.split('(').next().unwrap_or(line);
            head.replace("def ", "").trim().to_string()
        })
        .collect()
}

/// Scores complexity from the average function name length.
pub struct CheckComplexity;

impl StepFn for CheckComplexity {
    fn name(&self) -> &str {
        "check_complexity"
    }

    fn call(&self, mut state: RunState) -> BoxFuture<'_, Result<RunState>> {
        Box::pin(async move {
            let functions = state.get_str_list(FUNCTIONS_FIELD);
            let complexity = complexity_of(&functions);

            state.set(COMPLEXITY_FIELD, Value::from(complexity));
            state.push_log(format!("check_complexity -> {}", complexity));
            Ok(state)
        })
    }
}

fn complexity_of(functions: &[String]) -> i64 {
    let real = !functions.is_empty() && functions != [NO_FUNCTION_FOUND];
    if !real {
        return DEFAULT_COMPLEXITY;
    }
    let total: usize = functions.iter().map(|f| f.chars().count()).sum();
    (total / functions.len()) as i64 + BASE_COMPLEXITY
}

/// Flags print calls, long lines and indentation.
pub struct DetectIssues;

impl StepFn for DetectIssues {
    fn name(&self) -> &str {
        "detect_issues"
    }

    fn call(&self, mut state: RunState) -> BoxFuture<'_, Result<RunState>> {
        Box::pin(async move {
            let code = state.get_str(CODE_FIELD).unwrap_or_default();
            let issues = issues_in(code);

            state.set(ISSUES_FIELD, string_array(&issues));
            state.push_log(format!("detect_issues -> {}", issues.len()));
            Ok(state)
        })
    }
}

fn issues_in(code: &str) -> Vec<String> {
    let mut issues = Vec::new();
    if code.contains("print(") && !code.contains("logging") {
        issues.push(ISSUE_PRINT.to_string());
    }
    for (i, line) in code.lines().enumerate() {
        if line.chars().count() > LONG_LINE_LIMIT {
            issues.push(format!("{}:{}", ISSUE_LONG_LINE_PREFIX, i + 1));
        }
    }
    if code.contains('\t') || code.contains("    ") {
        issues.push(ISSUE_NESTING.to_string());
    }
    issues
}

/// Appends suggestions for the detected problems and lowers complexity by one.
///
/// The decrement is what lets the quality loop converge.
pub struct SuggestImprovements;

impl StepFn for SuggestImprovements {
    fn name(&self) -> &str {
        "suggest_improvements"
    }

    fn call(&self, mut state: RunState) -> BoxFuture<'_, Result<RunState>> {
        Box::pin(async move {
            let complexity = state.get_i64(COMPLEXITY_FIELD).unwrap_or(0);
            let issues = state.get_str_list(ISSUES_FIELD);

            let mut suggestions = Vec::new();
            if complexity > HIGH_COMPLEXITY {
                suggestions.push("refactor:break-into-smaller-functions".to_string());
            }
            if issues.iter().any(|i| i.starts_with(ISSUE_LONG_LINE_PREFIX)) {
                suggestions.push("wrap-or-shorter-lines".to_string());
            }
            if issues.iter().any(|i| i == ISSUE_PRINT) {
                suggestions.push("replace-print-with-logging".to_string());
            }
            if issues.iter().any(|i| i == ISSUE_NESTING) {
                suggestions.push("reduce-nesting".to_string());
            }

            let mut all = state.get_str_list(SUGGESTIONS_FIELD);
            all.extend(suggestions.iter().cloned());
            state.set(SUGGESTIONS_FIELD, string_array(&all));
            state.set(COMPLEXITY_FIELD, Value::from((complexity - 1).max(0)));
            state.push_log(format!("suggest_improvements -> {}", suggestions.len()));
            Ok(state)
        })
    }
}

/// `quality_score = max(0, 10 - complexity - issues)`.
pub struct ComputeQuality;

impl StepFn for ComputeQuality {
    fn name(&self) -> &str {
        "compute_quality"
    }

    fn call(&self, mut state: RunState) -> BoxFuture<'_, Result<RunState>> {
        Box::pin(async move {
            let complexity = state.get_i64(COMPLEXITY_FIELD).unwrap_or(0);
            let issues = state.get_str_list(ISSUES_FIELD).len() as i64;
            let score = (MAX_QUALITY - complexity - issues).max(0);

            state.set(QUALITY_FIELD, Value::from(score));
            state.push_log(format!("compute_quality -> {}", score));
            Ok(state)
        })
    }
}
