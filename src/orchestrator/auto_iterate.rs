//! Auto-Iteration Orchestrator.
//!
//! Driven by agent-session-exit events. Each event runs one bounded cycle:
//! gate checks, a full verification pass, then either a stop (with a
//! broadcast) or a single agent respawn carrying the failure feedback.
//! Iteration numbers live in the datastore, so the loop survives a
//! restart between sessions.
//!
//! ```text
//! Idle ──exit(0)──▶ Verifying ──┬─▶ Passed            (stop)
//!                               ├─▶ Failed-Retrying   (agent spawned, back to Idle on next exit)
//!                               └─▶ Failed-Stopped    (max reached | approval | cancelled | error)
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use autoloop_common::{IterationStatus, TaskStatus};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::prompt::build_retry_prompt;
use crate::agent::{AgentSpawner, SpawnRequest};
use crate::errors::OrchestratorError;
use crate::events::{AutoIterateEvent, EventBus};
use crate::store::Datastore;
use crate::tracker::count_changed_files;
use crate::verify::{VerificationAggregator, VerifierEngine};

/// One agent-session-exit trigger.
#[derive(Debug, Clone)]
pub struct SessionExit {
    pub task_id: i64,
    pub exit_code: i32,
    pub project_id: i64,
    pub cwd: PathBuf,
    pub previous_session_id: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlightPhase {
    Verifying,
    /// A retry session was spawned; waiting for its exit.
    Retrying,
}

#[derive(Debug)]
struct Flight {
    phase: FlightPhase,
    cancelled: bool,
}

/// Iteration opened by the current cycle and not yet closed.
struct OpenIteration {
    id: i64,
    started: Instant,
}

pub struct AutoIterator {
    store: Arc<dyn Datastore>,
    aggregator: VerificationAggregator,
    spawner: Arc<dyn AgentSpawner>,
    events: EventBus,
    in_flight: Mutex<HashMap<i64, Flight>>,
    /// Held for the verification pass; one task verifies at a time.
    verify_lock: Mutex<()>,
}

impl AutoIterator {
    pub fn new(
        store: Arc<dyn Datastore>,
        engine: Arc<VerifierEngine>,
        spawner: Arc<dyn AgentSpawner>,
        events: EventBus,
    ) -> Self {
        Self {
            aggregator: VerificationAggregator::new(store.clone(), engine),
            store,
            spawner,
            events,
            in_flight: Mutex::new(HashMap::new()),
            verify_lock: Mutex::new(()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Handle one session exit. Returns `true` when a new agent session was
    /// spawned and the loop continues, `false` when nothing further happens
    /// automatically.
    pub async fn on_session_exit(&self, exit: SessionExit) -> bool {
        let task_id = exit.task_id;
        {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight
                .get(&task_id)
                .is_some_and(|f| f.phase == FlightPhase::Verifying)
            {
                warn!(task_id, "session exit ignored: task is already being verified");
                return false;
            }
            if exit.exit_code != 0 {
                debug!(task_id, exit_code = exit.exit_code, "agent exited uncleanly, not verifying");
                in_flight.remove(&task_id);
                return false;
            }
            in_flight
                .entry(task_id)
                .and_modify(|f| f.phase = FlightPhase::Verifying)
                .or_insert(Flight {
                    phase: FlightPhase::Verifying,
                    cancelled: false,
                });
        }

        let mut open: Option<OpenIteration> = None;
        let continued = match self.run_cycle(&exit, &mut open).await {
            Ok(continued) => continued,
            Err(e) => {
                let message = match &e {
                    OrchestratorError::SpawnFailed(msg) => msg.clone(),
                    other => format!("{:#}", other),
                };
                error!(task_id, error = %message, "auto-iteration stopped on error");
                if let Some(iteration) = open.take() {
                    self.close_failed_iteration(task_id, iteration).await;
                }
                self.events
                    .broadcast(&AutoIterateEvent::Error { task_id, message });
                false
            }
        };

        let mut in_flight = self.in_flight.lock().await;
        if continued {
            if let Some(flight) = in_flight.get_mut(&task_id) {
                flight.phase = FlightPhase::Retrying;
            }
        } else {
            in_flight.remove(&task_id);
        }
        continued
    }

    /// Flag the task so that no further agent session is spawned for it.
    /// Returns `false` when the task is not auto-iterating.
    pub async fn cancel_auto_iteration(&self, task_id: i64) -> bool {
        let mut in_flight = self.in_flight.lock().await;
        match in_flight.get_mut(&task_id) {
            Some(flight) => {
                flight.cancelled = true;
                info!(task_id, "auto-iteration cancelled");
                true
            }
            None => false,
        }
    }

    pub async fn is_auto_iterating(&self, task_id: i64) -> bool {
        let in_flight = self.in_flight.lock().await;
        in_flight.get(&task_id).is_some_and(|f| !f.cancelled)
    }

    async fn is_cancelled(&self, task_id: i64) -> bool {
        let in_flight = self.in_flight.lock().await;
        in_flight.get(&task_id).is_some_and(|f| f.cancelled)
    }

    async fn run_cycle(
        &self,
        exit: &SessionExit,
        open: &mut Option<OpenIteration>,
    ) -> Result<bool, OrchestratorError> {
        let task_id = exit.task_id;

        let Some(task) = self.store.get_task(task_id).await? else {
            debug!(task_id, "task not found, stopping");
            return Ok(false);
        };
        let settings = self.store.get_iteration_settings(task_id).await?;
        if !settings.auto_iterate {
            debug!(task_id, "auto-iterate disabled for task");
            return Ok(false);
        }
        let criteria = self.store.get_criteria_for_task(task_id).await?;
        if criteria.is_empty() {
            debug!(task_id, "no acceptance criteria, nothing to iterate on");
            return Ok(false);
        }

        let current = self.store.get_current_iteration_number(task_id).await?;
        if current >= settings.max_iterations {
            info!(task_id, current, max = settings.max_iterations, "max iterations reached");
            self.events
                .broadcast(&AutoIterateEvent::MaxReached { task_id });
            return Ok(false);
        }
        if current >= settings.require_approval_after {
            info!(
                task_id,
                current,
                threshold = settings.require_approval_after,
                "approval required to continue"
            );
            self.events.broadcast(&AutoIterateEvent::ApprovalRequired {
                task_id,
                count: current,
            });
            return Ok(false);
        }

        let (iteration_number, result) = {
            let _verifying = self.verify_lock.lock().await;
            // No cycle of this task is live here, so any running row is left
            // over from a process that died mid-verification.
            let stale = self.store.fail_stale_iterations(task_id).await?;
            if stale > 0 {
                warn!(task_id, stale, "closed iterations left running by an interrupted cycle");
            }
            let iteration = self.store.create_iteration(task_id).await?;
            info!(task_id, iteration = iteration.iteration_number, "iteration started");
            *open = Some(OpenIteration {
                id: iteration.id,
                started: Instant::now(),
            });

            let result = self.aggregator.verify_task(task_id, &exit.cwd).await?;
            let status = if result.auto_criteria_passed {
                IterationStatus::Completed
            } else {
                IterationStatus::Failed
            };
            let files_changed = files_changed(exit.cwd.clone()).await;
            if let Some(opened) = open.as_ref() {
                self.store
                    .complete_iteration(
                        opened.id,
                        status,
                        elapsed_ms(opened.started),
                        files_changed,
                        &result,
                    )
                    .await?;
            }
            *open = None;
            (iteration.iteration_number, result)
        };

        if result.auto_criteria_passed {
            info!(task_id, iteration = iteration_number, "automatic criteria passed");
            let manual_pending = result.manual_pending;
            self.events.broadcast(&AutoIterateEvent::Passed {
                task_id,
                result: Box::new(result),
            });
            if manual_pending > 0 {
                self.events.broadcast(&AutoIterateEvent::ManualPending {
                    task_id,
                    count: manual_pending,
                });
            }
            return Ok(false);
        }

        let prompt = build_retry_prompt(
            &task,
            &criteria,
            &result,
            iteration_number,
            settings.max_iterations,
        );

        if settings.pause_between_iterations_ms > 0 {
            tokio::time::sleep(Duration::from_millis(settings.pause_between_iterations_ms)).await;
        }

        if self.is_cancelled(task_id).await {
            info!(task_id, "cancelled before respawn");
            self.events
                .broadcast(&AutoIterateEvent::Cancelled { task_id });
            return Ok(false);
        }

        let outcome = self
            .spawner
            .spawn(SpawnRequest {
                task_id,
                project_id: exit.project_id,
                cwd: exit.cwd.clone(),
                prompt,
                model: exit.model.clone(),
                previous_session_id: exit.previous_session_id.clone(),
            })
            .await?;
        if !outcome.success {
            return Err(OrchestratorError::SpawnFailed(
                outcome
                    .error
                    .unwrap_or_else(|| "Agent spawn failed".to_string()),
            ));
        }

        self.store
            .update_task_status(task_id, TaskStatus::InProgress)
            .await?;
        info!(
            task_id,
            iteration = iteration_number,
            session_id = ?outcome.session_id,
            "agent respawned with failure feedback"
        );
        Ok(true)
    }

    async fn close_failed_iteration(&self, task_id: i64, iteration: OpenIteration) {
        if let Err(e) = self
            .store
            .fail_iteration(iteration.id, elapsed_ms(iteration.started))
            .await
        {
            warn!(task_id, iteration_id = iteration.id, "Failed to close iteration: {:#}", e);
        }
    }
}

async fn files_changed(cwd: PathBuf) -> Option<u32> {
    tokio::task::spawn_blocking(move || count_changed_files(&cwd))
        .await
        .ok()
        .flatten()
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
