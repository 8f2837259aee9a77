//! Pattern Recorder.
//!
//! Advisory analysis over iteration history: recurring failure signatures
//! and criteria suggestions for new tasks. Read-only; the orchestrator never
//! consults it.

pub mod failures;
pub mod suggest;

pub use failures::{
    FailurePattern, cluster_failures, common_failure_patterns, display_failure_patterns,
    failure_signature, normalize_output,
};
pub use suggest::{CriterionSuggestion, display_suggestions, suggest_criteria};
