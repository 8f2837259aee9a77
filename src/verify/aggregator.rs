//! Verification Aggregator: verifies every criterion of a task in stored order.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use autoloop_common::{CriterionStatus, TaskVerificationResult};
use tracing::{debug, info};

use super::engine::VerifierEngine;
use crate::store::Datastore;

pub struct VerificationAggregator {
    store: Arc<dyn Datastore>,
    engine: Arc<VerifierEngine>,
}

impl VerificationAggregator {
    pub fn new(store: Arc<dyn Datastore>, engine: Arc<VerifierEngine>) -> Self {
        Self { store, engine }
    }

    /// Run all criteria of `task_id` one after another and persist each
    /// outcome.
    ///
    /// Manual criteria are written back as `pending` unless a human already
    /// marked them `pass`; the engine's verdict never resolves them. Store
    /// failures propagate to the caller.
    pub async fn verify_task(&self, task_id: i64, cwd: &Path) -> Result<TaskVerificationResult> {
        let criteria = self.store.get_criteria_for_task(task_id).await?;
        if criteria.is_empty() {
            debug!(task_id, "no criteria declared, nothing to verify");
            return Ok(TaskVerificationResult::empty(task_id));
        }

        let mut results = Vec::with_capacity(criteria.len());
        let mut auto_passed = true;

        // Sequential: later criteria may rely on effects of earlier ones.
        for criterion in &criteria {
            let result = self.engine.verify(criterion, cwd).await;
            let status = if criterion.is_manual() {
                if criterion.status == CriterionStatus::Pass {
                    CriterionStatus::Pass
                } else {
                    CriterionStatus::Pending
                }
            } else {
                if !result.passed {
                    auto_passed = false;
                }
                CriterionStatus::from_passed(result.passed)
            };
            self.store
                .update_criterion_status(criterion.id, status, Some(result.output.clone()))
                .await?;
            results.push(result);
        }

        // Re-read so manual criteria resolved during the pass are honoured.
        let manual_pending = self
            .store
            .get_criteria_for_task(task_id)
            .await?
            .iter()
            .filter(|c| c.is_manual() && c.status != CriterionStatus::Pass)
            .count();

        let aggregate = TaskVerificationResult::new(task_id, auto_passed, manual_pending, results);
        info!(
            task_id,
            all_passed = aggregate.all_passed,
            auto_criteria_passed = aggregate.auto_criteria_passed,
            manual_pending,
            "task verified"
        );
        Ok(aggregate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Db, DbHandle, SqliteStore};
    use autoloop_common::{IterationSettings, NewCriterion};
    use serde_json::json;
    use tempfile::tempdir;

    fn setup() -> (Arc<SqliteStore>, DbHandle, i64) {
        let db = Db::new_in_memory().unwrap();
        let project = db.create_project("p", "/tmp/p").unwrap();
        let task = db.create_task(project.id, "t", "").unwrap();
        let handle = DbHandle::new(db);
        let store = Arc::new(SqliteStore::new(handle.clone(), IterationSettings::default()));
        (store, handle, task.id)
    }

    fn aggregator(store: Arc<SqliteStore>) -> VerificationAggregator {
        VerificationAggregator::new(store, Arc::new(VerifierEngine::default()))
    }

    #[tokio::test]
    async fn test_empty_criteria_pass_trivially() {
        let (store, _, task_id) = setup();
        let dir = tempdir().unwrap();
        let result = aggregator(store).verify_task(task_id, dir.path()).await.unwrap();
        assert!(result.all_passed);
        assert!(result.auto_criteria_passed);
        assert_eq!(result.manual_pending, 0);
        assert!(result.results.is_empty());
    }

    #[tokio::test]
    async fn test_runs_in_order_and_persists_status() {
        let (store, handle, task_id) = setup();
        let dir = tempdir().unwrap();
        {
            let db = handle.lock_sync().unwrap();
            db.add_criterion(
                task_id,
                &NewCriterion::new("build", "command", json!({"command": "echo built > out.txt"})),
            )
            .unwrap();
            db.add_criterion(
                task_id,
                &NewCriterion::new("artifact", "file_exists", json!({"path": "out.txt"})),
            )
            .unwrap();
            db.add_criterion(
                task_id,
                &NewCriterion::new("broken", "command", json!({"command": "exit 4"})),
            )
            .unwrap();
        }

        let result = aggregator(store).verify_task(task_id, dir.path()).await.unwrap();
        assert!(!result.auto_criteria_passed);
        assert!(!result.all_passed);
        assert_eq!(result.results.len(), 3);
        assert!(result.results[0].passed);
        assert!(result.results[1].passed, "file created by earlier criterion");
        assert!(!result.results[2].passed);

        let criteria = handle.lock_sync().unwrap().get_criteria_for_task(task_id).unwrap();
        assert_eq!(criteria[0].status, CriterionStatus::Pass);
        assert_eq!(criteria[2].status, CriterionStatus::Fail);
        assert!(criteria[2].last_output.as_deref().unwrap().contains("got 4"));
    }

    #[tokio::test]
    async fn test_manual_stays_pending_and_is_counted() {
        let (store, handle, task_id) = setup();
        let dir = tempdir().unwrap();
        {
            let db = handle.lock_sync().unwrap();
            db.add_criterion(task_id, &NewCriterion::new("ok", "command", json!({"command": "true"})))
                .unwrap();
            db.add_criterion(task_id, &NewCriterion::new("look", "manual", json!({})))
                .unwrap();
        }
        let result = aggregator(store).verify_task(task_id, dir.path()).await.unwrap();
        assert!(result.auto_criteria_passed);
        assert_eq!(result.manual_pending, 1);
        assert!(!result.all_passed);

        let criteria = handle.lock_sync().unwrap().get_criteria_for_task(task_id).unwrap();
        assert_eq!(criteria[1].status, CriterionStatus::Pending);
    }

    #[tokio::test]
    async fn test_manual_pass_is_sticky() {
        let (store, handle, task_id) = setup();
        let dir = tempdir().unwrap();
        {
            let db = handle.lock_sync().unwrap();
            let manual = db
                .add_criterion(task_id, &NewCriterion::new("look", "manual", json!({})))
                .unwrap();
            db.update_criterion_status(manual.id, CriterionStatus::Pass, None)
                .unwrap();
        }
        let result = aggregator(store).verify_task(task_id, dir.path()).await.unwrap();
        assert_eq!(result.manual_pending, 0);
        assert!(result.all_passed);
        let criteria = handle.lock_sync().unwrap().get_criteria_for_task(task_id).unwrap();
        assert_eq!(criteria[0].status, CriterionStatus::Pass);
    }

    #[tokio::test]
    async fn test_reverifying_unchanged_passing_set_is_stable() {
        let (store, handle, task_id) = setup();
        let dir = tempdir().unwrap();
        handle
            .lock_sync()
            .unwrap()
            .add_criterion(task_id, &NewCriterion::new("ok", "command", json!({"command": "true"})))
            .unwrap();
        let agg = aggregator(store);
        let first = agg.verify_task(task_id, dir.path()).await.unwrap();
        let second = agg.verify_task(task_id, dir.path()).await.unwrap();
        assert_eq!(first.all_passed, second.all_passed);
        assert_eq!(first.auto_criteria_passed, second.auto_criteria_passed);
        assert_eq!(first.manual_pending, second.manual_pending);
        assert_eq!(
            first.results.iter().map(|r| r.passed).collect::<Vec<_>>(),
            second.results.iter().map(|r| r.passed).collect::<Vec<_>>()
        );
    }
}
