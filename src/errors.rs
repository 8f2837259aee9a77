//! Typed error hierarchy for autoloop.
//!
//! Three enums cover the three layers:
//! - `VerifierError`: a criterion that cannot be verified as declared
//! - `StoreError`: datastore lookups and access failures
//! - `OrchestratorError`: failures inside one auto-iteration cycle
//!
//! `VerifierError` never escapes the engine: it is rendered into a failing
//! `VerifierResult`. `OrchestratorError` is caught at the single boundary in
//! `AutoIterator::on_session_exit` and broadcast as `autoIterate:error`.

use thiserror::Error;

/// A criterion whose declaration cannot be executed.
#[derive(Debug, Error, PartialEq)]
pub enum VerifierError {
    #[error("Unknown verifier type: {kind}")]
    UnknownKind { kind: String },

    #[error("{kind} verifier is missing required field '{field}'")]
    MissingField { kind: &'static str, field: &'static str },

    #[error("Invalid {kind} verifier parameters: {message}")]
    InvalidParams { kind: &'static str, message: String },
}

/// Errors from the datastore.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task {id} not found")]
    TaskNotFound { id: i64 },

    #[error("Project {id} not found")]
    ProjectNotFound { id: i64 },

    #[error("Criterion {id} not found")]
    CriterionNotFound { id: i64 },

    #[error("Iteration {id} not found")]
    IterationNotFound { id: i64 },

    #[error("Task {task_id} already has running iteration {iteration_number}")]
    IterationAlreadyRunning { task_id: i64, iteration_number: u32 },

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

/// Errors raised inside one auto-iteration cycle.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Failed to spawn agent session: {0}")]
    SpawnFailed(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
