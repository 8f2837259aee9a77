//! Verifier Engine: runs one criterion's check and reports a [`VerifierResult`].
//!
//! Nothing here returns an error. Bad declarations, spawn failures, missing
//! files and timeouts all come back as a failing result whose `output`
//! explains what happened.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use autoloop_common::{AcceptanceCriterion, VerifierResult};
use regex::Regex;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::verifier::{CommandCheck, Verifier};
use crate::config::VerifierSection;
use crate::util::cap_chars;

pub struct VerifierEngine {
    command_timeout: Duration,
    max_output_chars: usize,
}

impl Default for VerifierEngine {
    fn default() -> Self {
        Self::from_config(&VerifierSection::default())
    }
}

impl VerifierEngine {
    pub fn new(command_timeout: Duration, max_output_chars: usize) -> Self {
        Self {
            command_timeout,
            max_output_chars,
        }
    }

    pub fn from_config(section: &VerifierSection) -> Self {
        Self::new(section.command_timeout(), section.max_output_chars)
    }

    /// Verify one criterion with `cwd` as the working directory.
    pub async fn verify(&self, criterion: &AcceptanceCriterion, cwd: &Path) -> VerifierResult {
        let id = criterion.id;
        let verifier = match Verifier::from_criterion(&criterion.verifier, &criterion.params) {
            Ok(v) => v,
            Err(e) => {
                warn!(criterion_id = id, error = %e, "criterion cannot be verified");
                return VerifierResult::fail(id, e.to_string(), 0);
            }
        };
        debug!(criterion_id = id, kind = verifier.kind(), "verifying criterion");

        let result = match &verifier {
            Verifier::Command(check) => self.run_command(id, check, cwd).await,
            Verifier::TestPass { .. } => match verifier.as_command() {
                Some(check) => self.run_command(id, &check, cwd).await,
                None => VerifierResult::fail(id, "test_pass verifier has no command", 0),
            },
            Verifier::FileExists { path } => check_file_exists(id, path, cwd),
            Verifier::Grep {
                file,
                pattern,
                should_match,
            } => check_grep(id, file, pattern, *should_match, cwd).await,
            Verifier::Manual { instructions } => {
                let output = match instructions {
                    Some(text) => format!("Manual verification required: {}", text),
                    None => "Manual verification required".to_string(),
                };
                VerifierResult::fail(id, output, 0)
            }
        };

        debug!(
            criterion_id = id,
            passed = result.passed,
            duration_ms = result.duration_ms,
            "criterion verified"
        );
        result
    }

    async fn run_command(&self, id: i64, check: &CommandCheck, cwd: &Path) -> VerifierResult {
        let start = Instant::now();
        let spawned = Command::new("sh")
            .arg("-c")
            .arg(&check.command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return VerifierResult::fail(
                    id,
                    format!("Failed to spawn command '{}': {}", check.command, e),
                    elapsed_ms(start),
                );
            }
        };

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match timeout(self.command_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return VerifierResult::fail(
                    id,
                    format!("Failed to wait for command '{}': {}", check.command, e),
                    elapsed_ms(start),
                );
            }
            Err(_) => {
                warn!(
                    criterion_id = id,
                    command = %check.command,
                    timeout_secs = self.command_timeout.as_secs(),
                    "verifier command timed out"
                );
                return VerifierResult::fail(
                    id,
                    format!(
                        "Command timed out after {} seconds: {}",
                        self.command_timeout.as_secs(),
                        check.command
                    ),
                    elapsed_ms(start),
                );
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        let combined = cap_chars(combined, self.max_output_chars);
        let exit_code = output.status.code();
        let duration_ms = elapsed_ms(start);

        if exit_code != Some(check.expected_exit_code) {
            let actual = exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none (terminated by signal)".to_string());
            let message = format!(
                "Expected exit code {} but got {}\n{}",
                check.expected_exit_code, actual, combined
            );
            return VerifierResult::fail(id, message.trim_end(), duration_ms)
                .with_exit_code(exit_code);
        }

        if let Some(pattern) = &check.expected_output
            && !matches_pattern(pattern, &combined)
        {
            let message = format!(
                "Output did not match expected pattern '{}'\n{}",
                pattern, combined
            );
            return VerifierResult::fail(id, message.trim_end(), duration_ms)
                .with_exit_code(exit_code);
        }

        VerifierResult::pass(id, combined, duration_ms).with_exit_code(exit_code)
    }
}

/// Regex match, or plain substring containment when `pattern` is not a
/// valid regex.
pub fn matches_pattern(pattern: &str, haystack: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(haystack),
        Err(_) => haystack.contains(pattern),
    }
}

/// Absolute paths are used as-is; relative paths are joined onto `cwd`.
pub fn resolve_path(cwd: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        cwd.join(p)
    }
}

fn check_file_exists(id: i64, path: &str, cwd: &Path) -> VerifierResult {
    let start = Instant::now();
    let resolved = resolve_path(cwd, path);
    if resolved.exists() {
        VerifierResult::pass(
            id,
            format!("File exists: {}", resolved.display()),
            elapsed_ms(start),
        )
    } else {
        VerifierResult::fail(
            id,
            format!("File not found: {}", resolved.display()),
            elapsed_ms(start),
        )
    }
}

async fn check_grep(
    id: i64,
    file: &str,
    pattern: &str,
    should_match: bool,
    cwd: &Path,
) -> VerifierResult {
    let start = Instant::now();
    let resolved = resolve_path(cwd, file);
    if !resolved.exists() {
        return VerifierResult::fail(
            id,
            format!("File not found: {}", resolved.display()),
            elapsed_ms(start),
        );
    }
    let content = match tokio::fs::read(&resolved).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            return VerifierResult::fail(
                id,
                format!("Failed to read {}: {}", resolved.display(), e),
                elapsed_ms(start),
            );
        }
    };

    let matched = matches_pattern(pattern, &content);
    let passed = if should_match { matched } else { !matched };
    let output = match (matched, should_match) {
        (true, true) => format!("Pattern '{}' found in {}", pattern, file),
        (false, true) => format!("Pattern '{}' not found in {}", pattern, file),
        (true, false) => format!("Pattern '{}' unexpectedly found in {}", pattern, file),
        (false, false) => format!("Pattern '{}' absent from {} as expected", pattern, file),
    };
    if passed {
        VerifierResult::pass(id, output, elapsed_ms(start))
    } else {
        VerifierResult::fail(id, output, elapsed_ms(start))
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoloop_common::{CriterionStatus, Priority};
    use serde_json::json;
    use tempfile::tempdir;

    fn criterion(verifier: &str, params: serde_json::Value) -> AcceptanceCriterion {
        AcceptanceCriterion {
            id: 7,
            task_id: 1,
            description: "test criterion".into(),
            verifier: verifier.into(),
            params,
            status: CriterionStatus::Pending,
            last_output: None,
            priority: Priority::Medium,
            position: 0,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[tokio::test]
    async fn test_command_exit_zero_passes_by_default() {
        let dir = tempdir().unwrap();
        let engine = VerifierEngine::default();
        let result = engine
            .verify(&criterion("command", json!({"command": "echo hello"})), dir.path())
            .await;
        assert!(result.passed);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.output.trim(), "hello");
        assert_eq!(result.criterion_id, 7);
    }

    #[tokio::test]
    async fn test_command_nonzero_exit_fails() {
        let dir = tempdir().unwrap();
        let engine = VerifierEngine::default();
        let result = engine
            .verify(&criterion("command", json!({"command": "exit 1"})), dir.path())
            .await;
        assert!(!result.passed);
        assert_eq!(result.exit_code, Some(1));
        assert!(result.output.contains("Expected exit code 0 but got 1"));
    }

    #[tokio::test]
    async fn test_command_expected_exit_code_honoured() {
        let dir = tempdir().unwrap();
        let engine = VerifierEngine::default();
        let result = engine
            .verify(
                &criterion("command", json!({"command": "exit 3", "expected_exit_code": 3})),
                dir.path(),
            )
            .await;
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_command_runs_in_cwd() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let engine = VerifierEngine::default();
        let result = engine
            .verify(&criterion("command", json!({"command": "test -f marker.txt"})), dir.path())
            .await;
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_command_expected_output_regex_over_stderr() {
        let dir = tempdir().unwrap();
        let engine = VerifierEngine::default();
        let pass = engine
            .verify(
                &criterion(
                    "command",
                    json!({"command": "echo 'test result: ok. 12 passed' >&2", "expected_output": r"\d+ passed"}),
                ),
                dir.path(),
            )
            .await;
        assert!(pass.passed, "output was: {}", pass.output);

        let fail = engine
            .verify(
                &criterion("command", json!({"command": "echo nope", "expected_output": "^yes$"})),
                dir.path(),
            )
            .await;
        assert!(!fail.passed);
        assert!(fail.output.contains("did not match"));
    }

    #[tokio::test]
    async fn test_command_invalid_regex_falls_back_to_substring() {
        let dir = tempdir().unwrap();
        let engine = VerifierEngine::default();
        let result = engine
            .verify(
                &criterion("command", json!({"command": "echo 'found [unclosed'", "expected_output": "[unclosed"})),
                dir.path(),
            )
            .await;
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_command_missing_fails_immediately() {
        let dir = tempdir().unwrap();
        let engine = VerifierEngine::default();
        let result = engine.verify(&criterion("command", json!({})), dir.path()).await;
        assert!(!result.passed);
        assert_eq!(result.duration_ms, 0);
        assert!(result.output.contains("command"));
    }

    #[tokio::test]
    async fn test_command_timeout_kills_and_fails() {
        let dir = tempdir().unwrap();
        let engine = VerifierEngine::new(Duration::from_millis(200), 10_000);
        let start = Instant::now();
        let result = engine
            .verify(&criterion("command", json!({"command": "sleep 10"})), dir.path())
            .await;
        assert!(!result.passed);
        assert!(result.output.contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_command_output_is_capped() {
        let dir = tempdir().unwrap();
        let engine = VerifierEngine::new(Duration::from_secs(30), 50);
        let result = engine
            .verify(
                &criterion("command", json!({"command": "yes x | head -n 500"})),
                dir.path(),
            )
            .await;
        assert!(result.passed);
        assert_eq!(result.output.chars().count(), 50);
    }

    #[tokio::test]
    async fn test_file_exists_relative_and_absolute() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        let engine = VerifierEngine::default();

        let rel = engine
            .verify(&criterion("file_exists", json!({"path": "Cargo.toml"})), dir.path())
            .await;
        assert!(rel.passed);

        let abs_path = dir.path().join("Cargo.toml");
        let abs = engine
            .verify(
                &criterion("file_exists", json!({"path": abs_path.to_string_lossy()})),
                Path::new("/"),
            )
            .await;
        assert!(abs.passed);

        let missing = engine
            .verify(&criterion("file_exists", json!({"path": "nope.txt"})), dir.path())
            .await;
        assert!(!missing.passed);
        assert!(missing.output.contains("File not found"));
    }

    #[tokio::test]
    async fn test_file_exists_missing_path_field() {
        let dir = tempdir().unwrap();
        let result = VerifierEngine::default()
            .verify(&criterion("file_exists", json!({})), dir.path())
            .await;
        assert!(!result.passed);
        assert!(result.output.contains("path"));
    }

    #[tokio::test]
    async fn test_grep_should_match_inverts() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("lib.rs"), "fn main() {}\n// TODO: later\n").unwrap();
        let engine = VerifierEngine::default();

        let found = engine
            .verify(&criterion("grep", json!({"file": "lib.rs", "pattern": r"fn \w+"})), dir.path())
            .await;
        assert!(found.passed);

        let forbidden = engine
            .verify(
                &criterion("grep", json!({"file": "lib.rs", "pattern": "TODO", "should_match": false})),
                dir.path(),
            )
            .await;
        assert!(!forbidden.passed);

        let absent = engine
            .verify(
                &criterion("grep", json!({"file": "lib.rs", "pattern": "unwrap", "should_match": false})),
                dir.path(),
            )
            .await;
        assert!(absent.passed);
    }

    #[tokio::test]
    async fn test_grep_missing_file_fails() {
        let dir = tempdir().unwrap();
        let result = VerifierEngine::default()
            .verify(&criterion("grep", json!({"file": "gone.rs", "pattern": "x"})), dir.path())
            .await;
        assert!(!result.passed);
        assert!(result.output.contains("File not found"));
    }

    #[tokio::test]
    async fn test_grep_invalid_regex_uses_substring() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "value (unbalanced\n").unwrap();
        let result = VerifierEngine::default()
            .verify(&criterion("grep", json!({"file": "a.txt", "pattern": "(unbalanced"})), dir.path())
            .await;
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_test_pass_requires_zero_exit_and_pattern() {
        let dir = tempdir().unwrap();
        let engine = VerifierEngine::default();
        let ok = engine
            .verify(
                &criterion("test_pass", json!({"test_command": "echo '3 passed'", "test_pattern": "passed"})),
                dir.path(),
            )
            .await;
        assert!(ok.passed);

        let failing = engine
            .verify(
                &criterion("test_pass", json!({"test_command": "echo '3 passed'; exit 2"})),
                dir.path(),
            )
            .await;
        assert!(!failing.passed);
        assert_eq!(failing.exit_code, Some(2));
    }

    #[tokio::test]
    async fn test_manual_never_passes() {
        let dir = tempdir().unwrap();
        let result = VerifierEngine::default()
            .verify(
                &criterion("manual", json!({"instructions": "Check the login page renders"})),
                dir.path(),
            )
            .await;
        assert!(!result.passed);
        assert!(result.output.contains("Check the login page renders"));
    }

    #[tokio::test]
    async fn test_unknown_kind_names_kind() {
        let dir = tempdir().unwrap();
        let result = VerifierEngine::default()
            .verify(&criterion("lint", json!({})), dir.path())
            .await;
        assert!(!result.passed);
        assert_eq!(result.output, "Unknown verifier type: lint");
    }

    #[test]
    fn test_matches_pattern() {
        assert!(matches_pattern(r"^\d+ passed", "12 passed"));
        assert!(!matches_pattern(r"^\d+ passed", "passed"));
        assert!(matches_pattern("a+(b", "xa+(by"));
    }
}
