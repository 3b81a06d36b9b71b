pub mod code_review;
pub mod workflow;

pub use code_review::{
    CheckComplexity, ComputeQuality, DetectIssues, ExtractFunctions, SuggestImprovements,
};
pub use workflow::code_review_workflow;
