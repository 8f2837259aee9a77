//! Shared domain types for autoloop.
//!
//! | Module      | Types                                                          |
//! |-------------|----------------------------------------------------------------|
//! | `task`      | `Project`, `Task`, `TaskStatus`                                |
//! | `criteria`  | `AcceptanceCriterion`, `CriterionStatus`, `Priority`, results  |
//! | `iteration` | `TaskIteration`, `IterationStatus`, `IterationSettings`, stats |

pub mod criteria;
pub mod iteration;
pub mod task;

pub use criteria::{
    AcceptanceCriterion, CriterionStatus, MANUAL_VERIFIER, NewCriterion, Priority,
    TaskVerificationResult, VerifierResult,
};
pub use iteration::{IterationSettings, IterationStats, IterationStatus, TaskIteration};
pub use task::{Project, Task, TaskStatus};
