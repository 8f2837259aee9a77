use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Verifier kind string for criteria that only a human can resolve.
pub const MANUAL_VERIFIER: &str = "manual";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CriterionStatus {
    Pending,
    Pass,
    Fail,
}

impl CriterionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Pass => "pass",
            Self::Fail => "fail",
        }
    }

    pub fn from_passed(passed: bool) -> Self {
        if passed { Self::Pass } else { Self::Fail }
    }
}

impl FromStr for CriterionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "pass" => Ok(Self::Pass),
            "fail" => Ok(Self::Fail),
            _ => Err(format!("Invalid criterion status: {}", s)),
        }
    }
}

impl std::fmt::Display for CriterionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// A single checkable condition attached to a task.
///
/// `verifier` is the declared kind (`command`, `file_exists`, `grep`,
/// `test_pass`, `manual`) and `params` holds its kind-specific fields as a
/// JSON object. The kind is kept as stored text so that rows written with a
/// kind this build does not know still load and fail verification cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub id: i64,
    pub task_id: i64,
    pub description: String,
    pub verifier: String,
    pub params: serde_json::Value,
    pub status: CriterionStatus,
    pub last_output: Option<String>,
    pub priority: Priority,
    pub position: i32,
    pub created_at: String,
    pub updated_at: String,
}

impl AcceptanceCriterion {
    pub fn is_manual(&self) -> bool {
        self.verifier == MANUAL_VERIFIER
    }
}

/// Criterion declaration before it is persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewCriterion {
    pub description: String,
    pub verifier: String,
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl NewCriterion {
    pub fn new(
        description: impl Into<String>,
        verifier: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            description: description.into(),
            verifier: verifier.into(),
            params,
            priority: Priority::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Outcome of running one verifier against one criterion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerifierResult {
    pub criterion_id: i64,
    pub passed: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl VerifierResult {
    pub fn pass(criterion_id: i64, output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            criterion_id,
            passed: true,
            output: output.into(),
            exit_code: None,
            duration_ms,
            timestamp: Utc::now(),
        }
    }

    pub fn fail(criterion_id: i64, output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            criterion_id,
            passed: false,
            output: output.into(),
            exit_code: None,
            duration_ms,
            timestamp: Utc::now(),
        }
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }
}

/// Aggregate of one verification pass over all criteria of a task.
///
/// `all_passed` holds exactly when `auto_criteria_passed` is true and no
/// manual criterion is still waiting on a human (`manual_pending == 0`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskVerificationResult {
    pub task_id: i64,
    pub all_passed: bool,
    pub auto_criteria_passed: bool,
    pub manual_pending: usize,
    pub results: Vec<VerifierResult>,
    pub checked_at: DateTime<Utc>,
}

impl TaskVerificationResult {
    /// Result for a task with nothing declared: nothing can block it.
    pub fn empty(task_id: i64) -> Self {
        Self {
            task_id,
            all_passed: true,
            auto_criteria_passed: true,
            manual_pending: 0,
            results: Vec::new(),
            checked_at: Utc::now(),
        }
    }

    pub fn new(
        task_id: i64,
        auto_criteria_passed: bool,
        manual_pending: usize,
        results: Vec<VerifierResult>,
    ) -> Self {
        Self {
            task_id,
            all_passed: auto_criteria_passed && manual_pending == 0,
            auto_criteria_passed,
            manual_pending,
            results,
            checked_at: Utc::now(),
        }
    }

    pub fn failed_results(&self) -> impl Iterator<Item = &VerifierResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_result_passes_everything() {
        let result = TaskVerificationResult::empty(7);
        assert!(result.all_passed);
        assert!(result.auto_criteria_passed);
        assert_eq!(result.manual_pending, 0);
        assert!(result.results.is_empty());
    }

    #[test]
    fn test_all_passed_requires_manual_resolution() {
        let result = TaskVerificationResult::new(1, true, 2, vec![]);
        assert!(result.auto_criteria_passed);
        assert!(!result.all_passed);

        let result = TaskVerificationResult::new(1, false, 0, vec![]);
        assert!(!result.all_passed);

        let result = TaskVerificationResult::new(1, true, 0, vec![]);
        assert!(result.all_passed);
    }

    #[test]
    fn test_failed_results_filters_passing() {
        let result = TaskVerificationResult::new(
            1,
            false,
            0,
            vec![
                VerifierResult::pass(1, "ok", 3),
                VerifierResult::fail(2, "boom", 4),
            ],
        );
        let failed: Vec<_> = result.failed_results().map(|r| r.criterion_id).collect();
        assert_eq!(failed, vec![2]);
    }

    #[test]
    fn test_new_criterion_params_default_to_empty_object() {
        let parsed: NewCriterion =
            serde_json::from_str(r#"{"description": "check", "verifier": "manual"}"#).unwrap();
        assert!(parsed.params.as_object().unwrap().is_empty());
        assert_eq!(parsed.priority, Priority::Medium);
    }

    #[test]
    fn test_verifier_result_omits_missing_exit_code() {
        let json = serde_json::to_string(&VerifierResult::fail(3, "missing", 0)).unwrap();
        assert!(!json.contains("exit_code"));
        let json = serde_json::to_string(&VerifierResult::fail(3, "x", 0).with_exit_code(Some(2)))
            .unwrap();
        assert!(json.contains("\"exit_code\":2"));
    }

    #[test]
    fn test_criterion_status_from_passed() {
        assert_eq!(CriterionStatus::from_passed(true), CriterionStatus::Pass);
        assert_eq!(CriterionStatus::from_passed(false), CriterionStatus::Fail);
    }
}
