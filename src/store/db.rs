use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use autoloop_common::{
    AcceptanceCriterion, CriterionStatus, IterationSettings, IterationStats, IterationStatus,
    NewCriterion, Priority, Project, Task, TaskIteration, TaskStatus, TaskVerificationResult,
};
use rusqlite::{Connection, Row, params};

use crate::errors::StoreError;

/// Async-safe handle to the autoloop database.
///
/// Wraps `Db` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, so synchronous SQLite I/O never ties up
/// async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Db>>,
}

impl DbHandle {
    pub fn new(db: Db) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Db) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For CLI commands and tests
    /// that are not running on an async worker.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Db>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::LockPoisoned.into())
    }
}

pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    path TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'backlog',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS acceptance_criteria (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    description TEXT NOT NULL DEFAULT '',
                    verifier TEXT NOT NULL,
                    params TEXT NOT NULL DEFAULT '{}',
                    status TEXT NOT NULL DEFAULT 'pending',
                    last_output TEXT,
                    priority TEXT NOT NULL DEFAULT 'medium',
                    position INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS task_iterations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    iteration_number INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'running',
                    started_at TEXT NOT NULL DEFAULT (datetime('now')),
                    completed_at TEXT,
                    duration_ms INTEGER,
                    files_changed INTEGER,
                    verification_snapshot TEXT,
                    UNIQUE(task_id, iteration_number)
                );

                CREATE TABLE IF NOT EXISTS task_iteration_settings (
                    task_id INTEGER PRIMARY KEY REFERENCES tasks(id) ON DELETE CASCADE,
                    auto_iterate INTEGER NOT NULL,
                    max_iterations INTEGER NOT NULL,
                    require_approval_after INTEGER NOT NULL,
                    pause_between_iterations_ms INTEGER NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);
                CREATE INDEX IF NOT EXISTS idx_criteria_task ON acceptance_criteria(task_id, position);
                CREATE INDEX IF NOT EXISTS idx_iterations_task ON task_iterations(task_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(&self, name: &str, path: &str) -> Result<Project> {
        self.conn
            .execute(
                "INSERT INTO projects (name, path) VALUES (?1, ?2)",
                params![name, path],
            )
            .context("Failed to insert project")?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?
            .context("Project not found after insert")
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, path, created_at FROM projects ORDER BY id")
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], project_from_row)
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?);
        }
        Ok(projects)
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, path, created_at FROM projects WHERE id = ?1")
            .context("Failed to prepare get_project")?;
        let mut rows = stmt
            .query_map(params![id], project_from_row)
            .context("Failed to query project")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read project row")?)),
            None => Ok(None),
        }
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub fn create_task(&self, project_id: i64, title: &str, description: &str) -> Result<Task> {
        if self.get_project(project_id)?.is_none() {
            return Err(StoreError::ProjectNotFound { id: project_id }.into());
        }
        self.conn
            .execute(
                "INSERT INTO tasks (project_id, title, description) VALUES (?1, ?2, ?3)",
                params![project_id, title, description],
            )
            .context("Failed to insert task")?;
        let id = self.conn.last_insert_rowid();
        self.get_task(id)?.context("Task not found after insert")
    }

    pub fn list_tasks(&self, project_id: i64) -> Result<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, project_id, title, description, status, created_at, updated_at
                 FROM tasks WHERE project_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_tasks")?;
        let rows = stmt
            .query_map(params![project_id], task_row)
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, project_id, title, description, status, created_at, updated_at
                 FROM tasks WHERE id = ?1",
            )
            .context("Failed to prepare get_task")?;
        let mut rows = stmt
            .query_map(params![id], task_row)
            .context("Failed to query task")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read task row")?.into_task()?)),
            None => Ok(None),
        }
    }

    pub fn update_task_status(&self, id: i64, status: TaskStatus) -> Result<Task> {
        let count = self
            .conn
            .execute(
                "UPDATE tasks SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update task status")?;
        if count == 0 {
            return Err(StoreError::TaskNotFound { id }.into());
        }
        self.get_task(id)?.context("Task not found after update")
    }

    pub fn delete_task(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .context("Failed to delete task")?;
        Ok(count > 0)
    }

    // ── Acceptance criteria ───────────────────────────────────────────

    pub fn add_criterion(&self, task_id: i64, criterion: &NewCriterion) -> Result<AcceptanceCriterion> {
        if self.get_task(task_id)?.is_none() {
            return Err(StoreError::TaskNotFound { id: task_id }.into());
        }
        let id = insert_criterion(&self.conn, task_id, criterion)?;
        self.get_criterion(id)?
            .context("Criterion not found after insert")
    }

    /// Criteria for a task in stored (declaration) order.
    pub fn get_criteria_for_task(&self, task_id: i64) -> Result<Vec<AcceptanceCriterion>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, task_id, description, verifier, params, status, last_output, priority, position, created_at, updated_at
                 FROM acceptance_criteria WHERE task_id = ?1 ORDER BY position, id",
            )
            .context("Failed to prepare get_criteria_for_task")?;
        let rows = stmt
            .query_map(params![task_id], criterion_row)
            .context("Failed to query criteria")?;
        let mut criteria = Vec::new();
        for row in rows {
            criteria.push(row.context("Failed to read criterion row")?.into_criterion()?);
        }
        Ok(criteria)
    }

    pub fn get_criterion(&self, id: i64) -> Result<Option<AcceptanceCriterion>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, task_id, description, verifier, params, status, last_output, priority, position, created_at, updated_at
                 FROM acceptance_criteria WHERE id = ?1",
            )
            .context("Failed to prepare get_criterion")?;
        let mut rows = stmt
            .query_map(params![id], criterion_row)
            .context("Failed to query criterion")?;
        match rows.next() {
            Some(row) => Ok(Some(
                row.context("Failed to read criterion row")?.into_criterion()?,
            )),
            None => Ok(None),
        }
    }

    /// Set a criterion's status. `output` replaces `last_output` when given.
    pub fn update_criterion_status(
        &self,
        id: i64,
        status: CriterionStatus,
        output: Option<&str>,
    ) -> Result<AcceptanceCriterion> {
        let count = match output {
            Some(out) => self.conn.execute(
                "UPDATE acceptance_criteria SET status = ?1, last_output = ?2, updated_at = datetime('now') WHERE id = ?3",
                params![status.as_str(), out, id],
            ),
            None => self.conn.execute(
                "UPDATE acceptance_criteria SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), id],
            ),
        }
        .context("Failed to update criterion status")?;
        if count == 0 {
            return Err(StoreError::CriterionNotFound { id }.into());
        }
        self.get_criterion(id)?
            .context("Criterion not found after update")
    }

    pub fn delete_criterion(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM acceptance_criteria WHERE id = ?1", params![id])
            .context("Failed to delete criterion")?;
        Ok(count > 0)
    }

    /// Replace all criteria of a task atomically (template reapplication).
    pub fn replace_criteria(
        &self,
        task_id: i64,
        criteria: &[NewCriterion],
    ) -> Result<Vec<AcceptanceCriterion>> {
        if self.get_task(task_id)?.is_none() {
            return Err(StoreError::TaskNotFound { id: task_id }.into());
        }
        // DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "DELETE FROM acceptance_criteria WHERE task_id = ?1",
            params![task_id],
        )
        .context("Failed to clear criteria")?;
        for criterion in criteria {
            insert_criterion(&tx, task_id, criterion)?;
        }
        tx.commit().context("Failed to commit criteria replacement")?;
        self.get_criteria_for_task(task_id)
    }

    // ── Iteration settings ────────────────────────────────────────────

    pub fn get_iteration_settings(&self, task_id: i64) -> Result<Option<IterationSettings>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT auto_iterate, max_iterations, require_approval_after, pause_between_iterations_ms
                 FROM task_iteration_settings WHERE task_id = ?1",
            )
            .context("Failed to prepare get_iteration_settings")?;
        let mut rows = stmt
            .query_map(params![task_id], |row| {
                Ok(IterationSettings {
                    auto_iterate: row.get::<_, i64>(0)? != 0,
                    max_iterations: row.get(1)?,
                    require_approval_after: row.get(2)?,
                    pause_between_iterations_ms: row.get::<_, i64>(3)?.max(0) as u64,
                })
            })
            .context("Failed to query iteration settings")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read iteration settings row")?)),
            None => Ok(None),
        }
    }

    pub fn set_iteration_settings(&self, task_id: i64, settings: &IterationSettings) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO task_iteration_settings
                    (task_id, auto_iterate, max_iterations, require_approval_after, pause_between_iterations_ms, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))
                 ON CONFLICT(task_id) DO UPDATE SET
                    auto_iterate = excluded.auto_iterate,
                    max_iterations = excluded.max_iterations,
                    require_approval_after = excluded.require_approval_after,
                    pause_between_iterations_ms = excluded.pause_between_iterations_ms,
                    updated_at = datetime('now')",
                params![
                    task_id,
                    settings.auto_iterate as i64,
                    settings.max_iterations,
                    settings.require_approval_after,
                    settings.pause_between_iterations_ms as i64
                ],
            )
            .context("Failed to upsert iteration settings")?;
        Ok(())
    }

    /// Let a task that stopped at its approval threshold run `base` more
    /// iterations: the override's `require_approval_after` becomes
    /// `current + base`. Other settings are kept (or taken from `defaults`).
    pub fn approve_continuation(
        &self,
        task_id: i64,
        defaults: &IterationSettings,
    ) -> Result<IterationSettings> {
        if self.get_task(task_id)?.is_none() {
            return Err(StoreError::TaskNotFound { id: task_id }.into());
        }
        let current = self.current_iteration_number(task_id)?;
        let mut settings = self.get_iteration_settings(task_id)?.unwrap_or(*defaults);
        let base = defaults.require_approval_after.max(1);
        settings.require_approval_after = settings.require_approval_after.max(current + base);
        self.set_iteration_settings(task_id, &settings)?;
        Ok(settings)
    }

    // ── Iterations ────────────────────────────────────────────────────

    /// Highest iteration number recorded for a task, 0 if none.
    pub fn current_iteration_number(&self, task_id: i64) -> Result<u32> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(iteration_number), 0) FROM task_iterations WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .context("Failed to get current iteration number")
    }

    /// Append a `running` iteration numbered one past the current maximum.
    ///
    /// Refuses to open a second running iteration for the same task.
    pub fn create_iteration(&self, task_id: i64) -> Result<TaskIteration> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let running: Option<u32> = tx
            .query_row(
                "SELECT MAX(iteration_number) FROM task_iterations WHERE task_id = ?1 AND status = 'running'",
                params![task_id],
                |row| row.get(0),
            )
            .context("Failed to check running iterations")?;
        if let Some(iteration_number) = running {
            return Err(StoreError::IterationAlreadyRunning {
                task_id,
                iteration_number,
            }
            .into());
        }
        tx.execute(
            "INSERT INTO task_iterations (task_id, iteration_number, status)
             SELECT ?1, COALESCE(MAX(iteration_number), 0) + 1, 'running'
             FROM task_iterations WHERE task_id = ?1",
            params![task_id],
        )
        .context("Failed to insert iteration")?;
        let id = tx.last_insert_rowid();
        tx.commit().context("Failed to commit iteration")?;
        self.get_iteration(id)?
            .context("Iteration not found after insert")
    }

    pub fn complete_iteration(
        &self,
        id: i64,
        status: IterationStatus,
        duration_ms: u64,
        files_changed: Option<u32>,
        snapshot: &TaskVerificationResult,
    ) -> Result<TaskIteration> {
        let snapshot_json =
            serde_json::to_string(snapshot).context("Failed to serialize verification snapshot")?;
        let count = self
            .conn
            .execute(
                "UPDATE task_iterations
                 SET status = ?1, duration_ms = ?2, files_changed = ?3, verification_snapshot = ?4,
                     completed_at = datetime('now')
                 WHERE id = ?5",
                params![
                    status.as_str(),
                    duration_ms as i64,
                    files_changed,
                    snapshot_json,
                    id
                ],
            )
            .context("Failed to complete iteration")?;
        if count == 0 {
            return Err(StoreError::IterationNotFound { id }.into());
        }
        self.get_iteration(id)?
            .context("Iteration not found after update")
    }

    /// Close an iteration that ended without a verification snapshot.
    pub fn fail_iteration(&self, id: i64, duration_ms: u64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE task_iterations SET status = 'failed', duration_ms = ?1, completed_at = datetime('now')
                 WHERE id = ?2 AND status = 'running'",
                params![duration_ms as i64, id],
            )
            .context("Failed to mark iteration failed")?;
        Ok(())
    }

    /// Close every `running` iteration of a task as `failed`. Returns how
    /// many were closed.
    ///
    /// A row is left `running` when the process driving a cycle dies before
    /// recording the verdict.
    pub fn fail_stale_iterations(&self, task_id: i64) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE task_iterations SET status = 'failed', completed_at = datetime('now')
                 WHERE task_id = ?1 AND status = 'running'",
                params![task_id],
            )
            .context("Failed to close stale iterations")
    }

    pub fn get_iteration(&self, id: i64) -> Result<Option<TaskIteration>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, task_id, iteration_number, status, started_at, completed_at, duration_ms, files_changed, verification_snapshot
                 FROM task_iterations WHERE id = ?1",
            )
            .context("Failed to prepare get_iteration")?;
        let mut rows = stmt
            .query_map(params![id], iteration_row)
            .context("Failed to query iteration")?;
        match rows.next() {
            Some(row) => Ok(Some(
                row.context("Failed to read iteration row")?.into_iteration()?,
            )),
            None => Ok(None),
        }
    }

    pub fn list_iterations(&self, task_id: i64) -> Result<Vec<TaskIteration>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, task_id, iteration_number, status, started_at, completed_at, duration_ms, files_changed, verification_snapshot
                 FROM task_iterations WHERE task_id = ?1 ORDER BY iteration_number",
            )
            .context("Failed to prepare list_iterations")?;
        let rows = stmt
            .query_map(params![task_id], iteration_row)
            .context("Failed to query iterations")?;
        let mut iterations = Vec::new();
        for row in rows {
            iterations.push(row.context("Failed to read iteration row")?.into_iteration()?);
        }
        Ok(iterations)
    }

    /// Finished (completed or failed) iterations across every task of a project.
    pub fn list_project_iterations(&self, project_id: i64) -> Result<Vec<TaskIteration>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT i.id, i.task_id, i.iteration_number, i.status, i.started_at, i.completed_at, i.duration_ms, i.files_changed, i.verification_snapshot
                 FROM task_iterations i JOIN tasks t ON t.id = i.task_id
                 WHERE t.project_id = ?1 AND i.status != 'running'
                 ORDER BY i.id",
            )
            .context("Failed to prepare list_project_iterations")?;
        let rows = stmt
            .query_map(params![project_id], iteration_row)
            .context("Failed to query project iterations")?;
        let mut iterations = Vec::new();
        for row in rows {
            iterations.push(row.context("Failed to read iteration row")?.into_iteration()?);
        }
        Ok(iterations)
    }

    /// Counts by status and mean duration, for one task or for all tasks.
    pub fn iteration_stats(&self, task_id: Option<i64>) -> Result<IterationStats> {
        self.conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(status = 'running'), 0),
                        COALESCE(SUM(status = 'completed'), 0),
                        COALESCE(SUM(status = 'failed'), 0),
                        AVG(duration_ms)
                 FROM task_iterations WHERE ?1 IS NULL OR task_id = ?1",
                params![task_id],
                |row| {
                    Ok(IterationStats {
                        total: row.get(0)?,
                        running: row.get(1)?,
                        completed: row.get(2)?,
                        failed: row.get(3)?,
                        avg_duration_ms: row.get(4)?,
                    })
                },
            )
            .context("Failed to aggregate iteration stats")
    }
}

fn insert_criterion(conn: &Connection, task_id: i64, criterion: &NewCriterion) -> Result<i64> {
    let params_json =
        serde_json::to_string(&criterion.params).context("Failed to serialize criterion params")?;
    conn.execute(
        "INSERT INTO acceptance_criteria (task_id, description, verifier, params, priority, position)
         SELECT ?1, ?2, ?3, ?4, ?5, COALESCE(MAX(position), -1) + 1
         FROM acceptance_criteria WHERE task_id = ?1",
        params![
            task_id,
            criterion.description,
            criterion.verifier,
            params_json,
            criterion.priority.as_str()
        ],
    )
    .context("Failed to insert criterion")?;
    Ok(conn.last_insert_rowid())
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        created_at: row.get(3)?,
    })
}

/// Intermediate row struct for tasks.
struct TaskRow {
    id: i64,
    project_id: i64,
    title: String,
    description: String,
    status: String,
    created_at: String,
    updated_at: String,
}

fn task_row(row: &Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let status = TaskStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task status")?;
        Ok(Task {
            id: self.id,
            project_id: self.project_id,
            title: self.title,
            description: self.description,
            status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Intermediate row struct for acceptance_criteria.
struct CriterionRow {
    id: i64,
    task_id: i64,
    description: String,
    verifier: String,
    params: String,
    status: String,
    last_output: Option<String>,
    priority: String,
    position: i32,
    created_at: String,
    updated_at: String,
}

fn criterion_row(row: &Row<'_>) -> rusqlite::Result<CriterionRow> {
    Ok(CriterionRow {
        id: row.get(0)?,
        task_id: row.get(1)?,
        description: row.get(2)?,
        verifier: row.get(3)?,
        params: row.get(4)?,
        status: row.get(5)?,
        last_output: row.get(6)?,
        priority: row.get(7)?,
        position: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

impl CriterionRow {
    fn into_criterion(self) -> Result<AcceptanceCriterion> {
        let status = CriterionStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse criterion status")?;
        let priority = Priority::from_str(&self.priority)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse criterion priority")?;
        let params: serde_json::Value =
            serde_json::from_str(&self.params).context("Failed to parse criterion params JSON")?;
        Ok(AcceptanceCriterion {
            id: self.id,
            task_id: self.task_id,
            description: self.description,
            verifier: self.verifier,
            params,
            status,
            last_output: self.last_output,
            priority,
            position: self.position,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Intermediate row struct for task_iterations.
struct IterationRow {
    id: i64,
    task_id: i64,
    iteration_number: u32,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
    files_changed: Option<u32>,
    verification_snapshot: Option<String>,
}

fn iteration_row(row: &Row<'_>) -> rusqlite::Result<IterationRow> {
    Ok(IterationRow {
        id: row.get(0)?,
        task_id: row.get(1)?,
        iteration_number: row.get(2)?,
        status: row.get(3)?,
        started_at: row.get(4)?,
        completed_at: row.get(5)?,
        duration_ms: row.get(6)?,
        files_changed: row.get(7)?,
        verification_snapshot: row.get(8)?,
    })
}

impl IterationRow {
    fn into_iteration(self) -> Result<TaskIteration> {
        let status = IterationStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse iteration status")?;
        let verification_snapshot = match self.verification_snapshot {
            Some(json) => Some(
                serde_json::from_str(&json).context("Failed to parse verification snapshot JSON")?,
            ),
            None => None,
        };
        Ok(TaskIteration {
            id: self.id,
            task_id: self.task_id,
            iteration_number: self.iteration_number,
            status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms.map(|d| d.max(0) as u64),
            files_changed: self.files_changed,
            verification_snapshot,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use autoloop_common::VerifierResult;
    use serde_json::json;

    fn seeded() -> Result<(Db, Task)> {
        let db = Db::new_in_memory()?;
        let project = db.create_project("demo", "/tmp/demo")?;
        let task = db.create_task(project.id, "Add login", "Wire the login form")?;
        Ok((db, task))
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = Db::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('projects', 'tasks', 'acceptance_criteria', 'task_iterations', 'task_iteration_settings')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 5, "Expected 5 tables to exist");
        Ok(())
    }

    #[test]
    fn test_create_task_requires_project() -> Result<()> {
        let db = Db::new_in_memory()?;
        let err = db.create_task(99, "orphan", "").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::ProjectNotFound { id: 99 })
        ));
        Ok(())
    }

    #[test]
    fn test_task_defaults_to_backlog_and_updates_status() -> Result<()> {
        let (db, task) = seeded()?;
        assert_eq!(task.status, TaskStatus::Backlog);
        let updated = db.update_task_status(task.id, TaskStatus::InProgress)?;
        assert_eq!(updated.status, TaskStatus::InProgress);
        assert!(db.update_task_status(1234, TaskStatus::Done).is_err());
        Ok(())
    }

    #[test]
    fn test_criteria_keep_declaration_order() -> Result<()> {
        let (db, task) = seeded()?;
        db.add_criterion(
            task.id,
            &NewCriterion::new("build", "command", json!({"command": "cargo build"})),
        )?;
        db.add_criterion(
            task.id,
            &NewCriterion::new("tests", "test_pass", json!({"test_command": "cargo test"})),
        )?;
        db.add_criterion(task.id, &NewCriterion::new("review UI", "manual", json!({})))?;

        let criteria = db.get_criteria_for_task(task.id)?;
        let names: Vec<_> = criteria.iter().map(|c| c.description.as_str()).collect();
        assert_eq!(names, vec!["build", "tests", "review UI"]);
        assert_eq!(criteria[0].params["command"], "cargo build");
        assert!(criteria.iter().all(|c| c.status == CriterionStatus::Pending));
        assert!(criteria[2].is_manual());
        Ok(())
    }

    #[test]
    fn test_update_criterion_status_keeps_output_when_absent() -> Result<()> {
        let (db, task) = seeded()?;
        let c = db.add_criterion(task.id, &NewCriterion::new("x", "command", json!({})))?;
        db.update_criterion_status(c.id, CriterionStatus::Fail, Some("exit 1"))?;
        let updated = db.update_criterion_status(c.id, CriterionStatus::Pass, None)?;
        assert_eq!(updated.status, CriterionStatus::Pass);
        assert_eq!(updated.last_output.as_deref(), Some("exit 1"));

        let err = db
            .update_criterion_status(999, CriterionStatus::Pass, None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::CriterionNotFound { id: 999 })
        ));
        Ok(())
    }

    #[test]
    fn test_replace_criteria_swaps_whole_set() -> Result<()> {
        let (db, task) = seeded()?;
        db.add_criterion(task.id, &NewCriterion::new("old", "manual", json!({})))?;
        let replaced = db.replace_criteria(
            task.id,
            &[
                NewCriterion::new("a", "file_exists", json!({"path": "Cargo.toml"})),
                NewCriterion::new("b", "grep", json!({"file": "src/lib.rs", "pattern": "fn"})),
            ],
        )?;
        assert_eq!(replaced.len(), 2);
        assert_eq!(replaced[0].description, "a");
        assert_eq!(replaced[0].position, 0);
        assert_eq!(replaced[1].position, 1);
        Ok(())
    }

    #[test]
    fn test_iteration_numbers_increase_from_one() -> Result<()> {
        let (db, task) = seeded()?;
        assert_eq!(db.current_iteration_number(task.id)?, 0);

        let first = db.create_iteration(task.id)?;
        assert_eq!(first.iteration_number, 1);
        assert_eq!(first.status, IterationStatus::Running);

        let snapshot = TaskVerificationResult::new(task.id, false, 0, vec![]);
        db.complete_iteration(first.id, IterationStatus::Failed, 1200, Some(3), &snapshot)?;

        let second = db.create_iteration(task.id)?;
        assert_eq!(second.iteration_number, 2);
        assert_eq!(db.current_iteration_number(task.id)?, 2);
        Ok(())
    }

    #[test]
    fn test_second_running_iteration_is_rejected() -> Result<()> {
        let (db, task) = seeded()?;
        db.create_iteration(task.id)?;
        let err = db.create_iteration(task.id).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::IterationAlreadyRunning {
                iteration_number: 1,
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn test_complete_iteration_stores_snapshot() -> Result<()> {
        let (db, task) = seeded()?;
        let iteration = db.create_iteration(task.id)?;
        let snapshot = TaskVerificationResult::new(
            task.id,
            false,
            1,
            vec![VerifierResult::fail(4, "assertion failed", 12).with_exit_code(Some(101))],
        );
        let done =
            db.complete_iteration(iteration.id, IterationStatus::Failed, 850, None, &snapshot)?;
        assert_eq!(done.status, IterationStatus::Failed);
        assert_eq!(done.duration_ms, Some(850));
        assert!(done.completed_at.is_some());
        let stored = done.verification_snapshot.expect("snapshot stored");
        assert_eq!(stored.results[0].output, "assertion failed");
        assert_eq!(stored.results[0].exit_code, Some(101));
        assert_eq!(stored.manual_pending, 1);
        Ok(())
    }

    #[test]
    fn test_fail_iteration_only_touches_running() -> Result<()> {
        let (db, task) = seeded()?;
        let iteration = db.create_iteration(task.id)?;
        let snapshot = TaskVerificationResult::empty(task.id);
        db.complete_iteration(iteration.id, IterationStatus::Completed, 5, None, &snapshot)?;
        db.fail_iteration(iteration.id, 10)?;
        let fetched = db.get_iteration(iteration.id)?.unwrap();
        assert_eq!(fetched.status, IterationStatus::Completed);
        assert_eq!(fetched.duration_ms, Some(5));
        Ok(())
    }

    #[test]
    fn test_fail_stale_iterations_unblocks_task() -> Result<()> {
        let (db, task) = seeded()?;
        let stale = db.create_iteration(task.id)?;
        assert_eq!(db.fail_stale_iterations(task.id)?, 1);
        assert_eq!(db.fail_stale_iterations(task.id)?, 0);

        let fetched = db.get_iteration(stale.id)?.unwrap();
        assert_eq!(fetched.status, IterationStatus::Failed);
        assert!(fetched.completed_at.is_some());
        assert_eq!(db.create_iteration(task.id)?.iteration_number, 2);
        Ok(())
    }

    #[test]
    fn test_iteration_stats() -> Result<()> {
        let (db, task) = seeded()?;
        let snapshot = TaskVerificationResult::empty(task.id);
        let a = db.create_iteration(task.id)?;
        db.complete_iteration(a.id, IterationStatus::Failed, 100, None, &snapshot)?;
        let b = db.create_iteration(task.id)?;
        db.complete_iteration(b.id, IterationStatus::Completed, 300, None, &snapshot)?;
        db.create_iteration(task.id)?;

        let stats = db.iteration_stats(Some(task.id))?;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.avg_duration_ms, Some(200.0));

        let empty = db.iteration_stats(Some(task.id + 100))?;
        assert_eq!(empty.total, 0);
        assert_eq!(empty.avg_duration_ms, None);
        Ok(())
    }

    #[test]
    fn test_list_project_iterations_skips_running() -> Result<()> {
        let (db, task) = seeded()?;
        let a = db.create_iteration(task.id)?;
        db.complete_iteration(
            a.id,
            IterationStatus::Failed,
            1,
            None,
            &TaskVerificationResult::empty(task.id),
        )?;
        db.create_iteration(task.id)?;
        let listed = db.list_project_iterations(task.project_id)?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, a.id);
        Ok(())
    }

    #[test]
    fn test_iteration_settings_round_trip() -> Result<()> {
        let (db, task) = seeded()?;
        assert!(db.get_iteration_settings(task.id)?.is_none());
        let settings = IterationSettings {
            auto_iterate: true,
            max_iterations: 4,
            require_approval_after: 2,
            pause_between_iterations_ms: 0,
        };
        db.set_iteration_settings(task.id, &settings)?;
        assert_eq!(db.get_iteration_settings(task.id)?, Some(settings));

        let bumped = IterationSettings {
            require_approval_after: 4,
            ..settings
        };
        db.set_iteration_settings(task.id, &bumped)?;
        assert_eq!(db.get_iteration_settings(task.id)?, Some(bumped));
        Ok(())
    }

    #[test]
    fn test_approve_continuation_raises_threshold() -> Result<()> {
        let (db, task) = seeded()?;
        let snapshot = TaskVerificationResult::empty(task.id);
        for _ in 0..3 {
            let it = db.create_iteration(task.id)?;
            db.complete_iteration(it.id, IterationStatus::Failed, 1, None, &snapshot)?;
        }
        let defaults = IterationSettings {
            auto_iterate: true,
            ..IterationSettings::default()
        };
        let approved = db.approve_continuation(task.id, &defaults)?;
        assert_eq!(approved.require_approval_after, 6);
        assert!(approved.auto_iterate);
        assert_eq!(db.get_iteration_settings(task.id)?, Some(approved));

        assert!(db.approve_continuation(999, &defaults).is_err());
        Ok(())
    }

    #[test]
    fn test_delete_task_cascades() -> Result<()> {
        let (db, task) = seeded()?;
        let c = db.add_criterion(task.id, &NewCriterion::new("x", "manual", json!({})))?;
        let it = db.create_iteration(task.id)?;
        assert!(db.delete_task(task.id)?);
        assert!(db.get_criterion(c.id)?.is_none());
        assert!(db.get_iteration(it.id)?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_db_handle_call_runs_on_blocking_pool() -> Result<()> {
        let handle = DbHandle::new(Db::new_in_memory()?);
        let project = handle
            .call(|db| db.create_project("async", "/tmp/async"))
            .await?;
        let listed = handle.call(|db| db.list_projects()).await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, project.id);
        Ok(())
    }
}
