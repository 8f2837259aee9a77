//! Acceptance-criteria verification.
//!
//! - `verifier`: parse a stored criterion into the closed [`Verifier`] type
//! - `engine`: run one verifier ([`VerifierEngine`])
//! - `aggregator`: run every criterion of a task ([`VerificationAggregator`])
//! - `templates`: built-in criteria sets per stack

pub mod aggregator;
pub mod engine;
pub mod templates;
pub mod verifier;

pub use aggregator::VerificationAggregator;
pub use engine::{VerifierEngine, matches_pattern, resolve_path};
pub use templates::{CriteriaTemplate, TEMPLATES, find_template};
pub use verifier::{CommandCheck, VERIFIER_KINDS, Verifier};
