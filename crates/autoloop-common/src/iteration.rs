use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::criteria::TaskVerificationResult;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    Running,
    Completed,
    Failed,
}

impl IterationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for IterationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid iteration status: {}", s)),
        }
    }
}

impl std::fmt::Display for IterationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One verify-(optional retry-spawn) cycle for a task.
///
/// Append-only: numbers start at 1 and only grow per task, and a task has
/// at most one `Running` iteration at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskIteration {
    pub id: i64,
    pub task_id: i64,
    pub iteration_number: u32,
    pub status: IterationStatus,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub duration_ms: Option<u64>,
    pub files_changed: Option<u32>,
    pub verification_snapshot: Option<TaskVerificationResult>,
}

/// Bounds for the auto-iteration loop of one task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IterationSettings {
    #[serde(default)]
    pub auto_iterate: bool,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_require_approval_after")]
    pub require_approval_after: u32,
    #[serde(default = "default_pause_between_iterations_ms")]
    pub pause_between_iterations_ms: u64,
}

fn default_max_iterations() -> u32 {
    5
}

fn default_require_approval_after() -> u32 {
    3
}

fn default_pause_between_iterations_ms() -> u64 {
    2000
}

impl Default for IterationSettings {
    fn default() -> Self {
        Self {
            auto_iterate: false,
            max_iterations: default_max_iterations(),
            require_approval_after: default_require_approval_after(),
            pause_between_iterations_ms: default_pause_between_iterations_ms(),
        }
    }
}

/// Iteration counts by status plus the mean duration of finished ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IterationStats {
    pub total: u32,
    pub running: u32,
    pub completed: u32,
    pub failed: u32,
    pub avg_duration_ms: Option<f64>,
}

impl IterationStats {
    /// Fraction of finished iterations that passed verification.
    pub fn pass_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            return 0.0;
        }
        self.completed as f64 / finished as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iteration_settings_defaults() {
        let settings = IterationSettings::default();
        assert!(!settings.auto_iterate);
        assert_eq!(settings.max_iterations, 5);
        assert_eq!(settings.require_approval_after, 3);
        assert_eq!(settings.pause_between_iterations_ms, 2000);
    }

    #[test]
    fn test_iteration_settings_partial_deserialize() {
        let settings: IterationSettings =
            serde_json::from_str(r#"{"auto_iterate": true, "max_iterations": 2}"#).unwrap();
        assert!(settings.auto_iterate);
        assert_eq!(settings.max_iterations, 2);
        assert_eq!(settings.require_approval_after, 3);
    }

    #[test]
    fn test_pass_rate_ignores_running() {
        let stats = IterationStats {
            total: 5,
            running: 1,
            completed: 1,
            failed: 3,
            avg_duration_ms: Some(10.0),
        };
        assert_eq!(stats.pass_rate(), 0.25);
        assert_eq!(IterationStats::default().pass_rate(), 0.0);
    }

    #[test]
    fn test_iteration_status_rejects_unknown() {
        assert!(IterationStatus::from_str("paused").is_err());
        assert_eq!(
            IterationStatus::from_str("failed"),
            Ok(IterationStatus::Failed)
        );
    }
}
