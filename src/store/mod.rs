//! Persistent storage for tasks, acceptance criteria and iteration history.
//!
//! `Db` is the synchronous SQLite layer. The orchestrator and aggregator only
//! see the [`Datastore`] trait so they can be driven against test doubles.

pub mod db;

use anyhow::Result;
use async_trait::async_trait;
use autoloop_common::{
    AcceptanceCriterion, CriterionStatus, IterationSettings, IterationStatus, Task, TaskIteration,
    TaskStatus, TaskVerificationResult,
};

pub use db::{Db, DbHandle};

/// Accessors consumed by the verification aggregator and the orchestrator.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn get_criteria_for_task(&self, task_id: i64) -> Result<Vec<AcceptanceCriterion>>;

    async fn update_criterion_status(
        &self,
        id: i64,
        status: CriterionStatus,
        output: Option<String>,
    ) -> Result<()>;

    async fn get_task(&self, id: i64) -> Result<Option<Task>>;

    /// Per-task override if one is stored, else the configured defaults.
    async fn get_iteration_settings(&self, task_id: i64) -> Result<IterationSettings>;

    async fn get_current_iteration_number(&self, task_id: i64) -> Result<u32>;

    async fn create_iteration(&self, task_id: i64) -> Result<TaskIteration>;

    async fn complete_iteration(
        &self,
        id: i64,
        status: IterationStatus,
        duration_ms: u64,
        files_changed: Option<u32>,
        snapshot: &TaskVerificationResult,
    ) -> Result<()>;

    /// Close a running iteration that never got a verification snapshot.
    async fn fail_iteration(&self, id: i64, duration_ms: u64) -> Result<()>;

    /// Close iterations a previous cycle left `running`.
    async fn fail_stale_iterations(&self, task_id: i64) -> Result<usize>;

    async fn update_task_status(&self, task_id: i64, status: TaskStatus) -> Result<()>;
}

/// SQLite-backed [`Datastore`].
#[derive(Clone)]
pub struct SqliteStore {
    db: DbHandle,
    defaults: IterationSettings,
}

impl SqliteStore {
    pub fn new(db: DbHandle, defaults: IterationSettings) -> Self {
        Self { db, defaults }
    }

    pub fn handle(&self) -> &DbHandle {
        &self.db
    }
}

#[async_trait]
impl Datastore for SqliteStore {
    async fn get_criteria_for_task(&self, task_id: i64) -> Result<Vec<AcceptanceCriterion>> {
        self.db
            .call(move |db| db.get_criteria_for_task(task_id))
            .await
    }

    async fn update_criterion_status(
        &self,
        id: i64,
        status: CriterionStatus,
        output: Option<String>,
    ) -> Result<()> {
        self.db
            .call(move |db| {
                db.update_criterion_status(id, status, output.as_deref())
                    .map(|_| ())
            })
            .await
    }

    async fn get_task(&self, id: i64) -> Result<Option<Task>> {
        self.db.call(move |db| db.get_task(id)).await
    }

    async fn get_iteration_settings(&self, task_id: i64) -> Result<IterationSettings> {
        let defaults = self.defaults;
        self.db
            .call(move |db| Ok(db.get_iteration_settings(task_id)?.unwrap_or(defaults)))
            .await
    }

    async fn get_current_iteration_number(&self, task_id: i64) -> Result<u32> {
        self.db
            .call(move |db| db.current_iteration_number(task_id))
            .await
    }

    async fn create_iteration(&self, task_id: i64) -> Result<TaskIteration> {
        self.db.call(move |db| db.create_iteration(task_id)).await
    }

    async fn complete_iteration(
        &self,
        id: i64,
        status: IterationStatus,
        duration_ms: u64,
        files_changed: Option<u32>,
        snapshot: &TaskVerificationResult,
    ) -> Result<()> {
        let snapshot = snapshot.clone();
        self.db
            .call(move |db| {
                db.complete_iteration(id, status, duration_ms, files_changed, &snapshot)
                    .map(|_| ())
            })
            .await
    }

    async fn fail_iteration(&self, id: i64, duration_ms: u64) -> Result<()> {
        self.db
            .call(move |db| db.fail_iteration(id, duration_ms))
            .await
    }

    async fn fail_stale_iterations(&self, task_id: i64) -> Result<usize> {
        self.db
            .call(move |db| db.fail_stale_iterations(task_id))
            .await
    }

    async fn update_task_status(&self, task_id: i64, status: TaskStatus) -> Result<()> {
        self.db
            .call(move |db| db.update_task_status(task_id, status).map(|_| ()))
            .await
    }
}
