//! Agent runs: `run`, `on-exit`, `approve`.
//!
//! `run` owns the whole loop: it starts the first session, waits for each
//! exit and hands it to the orchestrator until no new session is spawned.
//! `on-exit` feeds one externally observed exit and, if that spawns a retry,
//! waits for it so the caller can report the next exit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use autoloop::agent::{AgentExit, AgentSpawner, ClaudeSpawner, SpawnRequest};
use autoloop::config::Config;
use autoloop::events::{EventBus, EventEnvelope};
use autoloop::orchestrator::{AutoIterator, SessionExit, build_task_prompt};
use autoloop::store::{DbHandle, SqliteStore};
use autoloop::verify::VerifierEngine;
use autoloop_common::{Project, Task, TaskStatus, TaskVerificationResult};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use tokio::sync::broadcast;
use tracing::debug;

use super::verify::print_verification;
use super::{open_db, require_project, require_task, spinner};

/// Everything one CLI invocation needs to drive the loop for a task.
struct LoopContext {
    config: Config,
    db: DbHandle,
    task: Task,
    project: Project,
    spawner: Arc<ClaudeSpawner>,
    iterator: AutoIterator,
    events: broadcast::Receiver<String>,
}

impl LoopContext {
    fn open(project_dir: &Path, task_id: i64) -> Result<Self> {
        let (config, db) = open_db(project_dir)?;
        let task = require_task(&db, task_id)?;
        let project = require_project(&db, task.project_id)?;

        let db = DbHandle::new(db);
        let store = Arc::new(SqliteStore::new(db.clone(), config.settings.iteration));
        let engine = Arc::new(VerifierEngine::from_config(&config.settings.verifier));
        let spawner = Arc::new(ClaudeSpawner::new(config.settings.agent.clone()));
        let bus = EventBus::new();
        let events = bus.subscribe();
        let iterator = AutoIterator::new(store, engine, spawner.clone(), bus);

        Ok(Self {
            config,
            db,
            task,
            project,
            spawner,
            iterator,
            events,
        })
    }

    fn cwd(&self) -> PathBuf {
        PathBuf::from(&self.project.path)
    }

    fn session_exit(
        &self,
        exit_code: i32,
        session_id: Option<String>,
        model: Option<String>,
    ) -> SessionExit {
        SessionExit {
            task_id: self.task.id,
            exit_code,
            project_id: self.project.id,
            cwd: self.cwd(),
            previous_session_id: session_id,
            model,
        }
    }

    /// Hand one exit to the orchestrator and report what happened.
    async fn feed_exit(&mut self, exit: SessionExit) -> Result<bool> {
        let exit_code = exit.exit_code;
        let continued = self.iterator.on_session_exit(exit).await;

        let mut reported = false;
        while let Ok(raw) = self.events.try_recv() {
            match serde_json::from_str::<EventEnvelope>(&raw) {
                Ok(envelope) => {
                    print_event(&envelope);
                    reported = true;
                }
                Err(e) => debug!("Unreadable event: {}", e),
            }
        }

        if continued {
            self.report_retry().await?;
        } else if !reported {
            self.explain_silent_stop(exit_code).await?;
        }
        Ok(continued)
    }

    /// `feed_exit` that Ctrl-C can abort. Dropping the cycle kills any running
    /// verifier command; the iteration it opened is closed by the next cycle.
    async fn feed_exit_or_interrupt(&mut self, exit: SessionExit) -> Result<bool> {
        let task_id = self.task.id;
        let fed = tokio::select! {
            continued = self.feed_exit(exit) => Some(continued?),
            _ = tokio::signal::ctrl_c() => None,
        };
        match fed {
            Some(continued) => Ok(continued),
            None => {
                self.spawner.kill(task_id).await;
                bail!("Interrupted during verification: auto-iteration stopped");
            }
        }
    }

    async fn report_retry(&self) -> Result<()> {
        let task_id = self.task.id;
        let (iterations, criteria) = self
            .db
            .call(move |db| Ok((db.list_iterations(task_id)?, db.get_criteria_for_task(task_id)?)))
            .await?;
        if let Some(last) = iterations.last() {
            println!(
                "{} Iteration {} failed verification",
                style("✗").red(),
                last.iteration_number
            );
            if let Some(snapshot) = &last.verification_snapshot {
                print_verification(&criteria, snapshot);
            }
        }
        println!("{} Agent respawned with failure feedback", style("↻").cyan());
        Ok(())
    }

    async fn explain_silent_stop(&self, exit_code: i32) -> Result<()> {
        if exit_code != 0 {
            println!(
                "Agent exited with code {}: not verifying. Fix the session and rerun.",
                exit_code
            );
            return Ok(());
        }
        let task_id = self.task.id;
        let defaults = self.config.settings.iteration;
        let (settings, criteria) = self
            .db
            .call(move |db| {
                Ok((
                    db.get_iteration_settings(task_id)?.unwrap_or(defaults),
                    db.get_criteria_for_task(task_id)?,
                ))
            })
            .await?;
        if !settings.auto_iterate {
            println!(
                "Auto-iteration is off for task #{}. Enable it with `autoloop task settings {} --auto-iterate true`.",
                task_id, task_id
            );
        } else if criteria.is_empty() {
            println!(
                "Task #{} has no acceptance criteria: nothing to verify.",
                task_id
            );
        }
        Ok(())
    }

    /// Wait for the live session to end. Ctrl-C kills it and cancels the loop.
    async fn wait_for_agent(&self, label: &str) -> Result<Option<AgentExit>> {
        let task_id = self.task.id;
        let bar = spinner("Agent", format!("{} on task #{}", label, task_id));
        let exit = tokio::select! {
            exit = self.spawner.wait_for_exit(task_id) => exit,
            _ = tokio::signal::ctrl_c() => {
                bar.finish_and_clear();
                self.iterator.cancel_auto_iteration(task_id).await;
                self.spawner.kill(task_id).await;
                bail!("Interrupted: agent session killed, auto-iteration cancelled");
            }
        };
        bar.finish_and_clear();
        if let Some(exit) = &exit {
            println!(
                "Agent session ended with exit code {}{}",
                exit.exit_code,
                exit.session_id
                    .as_deref()
                    .map(|s| format!(" (session {})", s))
                    .unwrap_or_default()
            );
        }
        Ok(exit)
    }
}

pub async fn cmd_run(
    project_dir: &Path,
    task_id: i64,
    prompt: Option<String>,
    model: Option<String>,
) -> Result<()> {
    let mut ctx = LoopContext::open(project_dir, task_id)?;

    let prompt = match prompt {
        Some(p) => p,
        None => {
            let criteria = ctx
                .db
                .call(move |db| db.get_criteria_for_task(task_id))
                .await?;
            build_task_prompt(&ctx.task, &criteria)
        }
    };

    let outcome = ctx
        .spawner
        .spawn(SpawnRequest {
            task_id,
            project_id: ctx.project.id,
            cwd: ctx.cwd(),
            prompt,
            model: model.clone(),
            previous_session_id: None,
        })
        .await?;
    if !outcome.success {
        bail!(
            outcome
                .error
                .unwrap_or_else(|| "Agent failed to start".to_string())
        );
    }
    ctx.db
        .call(move |db| db.update_task_status(task_id, TaskStatus::InProgress))
        .await?;
    println!(
        "Started agent for task #{} '{}'",
        task_id,
        style(&ctx.task.title).bold()
    );

    let mut session = 1u32;
    loop {
        let Some(exit) = ctx.wait_for_agent(&format!("session {}", session)).await? else {
            break;
        };
        let trigger = ctx.session_exit(exit.exit_code, exit.session_id, model.clone());
        if !ctx.feed_exit_or_interrupt(trigger).await? {
            break;
        }
        session += 1;
    }
    Ok(())
}

pub async fn cmd_on_exit(
    project_dir: &Path,
    task_id: i64,
    exit_code: i32,
    session_id: Option<String>,
    model: Option<String>,
) -> Result<()> {
    let mut ctx = LoopContext::open(project_dir, task_id)?;
    let trigger = ctx.session_exit(exit_code, session_id, model);
    if ctx.feed_exit_or_interrupt(trigger).await?
        && let Some(exit) = ctx.wait_for_agent("retry session").await?
    {
        println!(
            "Report it with: autoloop on-exit {} --exit-code {}{}",
            task_id,
            exit.exit_code,
            exit.session_id
                .map(|s| format!(" --session-id {}", s))
                .unwrap_or_default()
        );
    }
    Ok(())
}

pub fn cmd_approve(project_dir: &Path, task_id: i64, yes: bool) -> Result<()> {
    let (config, db) = open_db(project_dir)?;
    let task = require_task(&db, task_id)?;
    let current = db.current_iteration_number(task_id)?;

    if !yes {
        let proceed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!(
                "Task #{} '{}' has run {} iterations. Allow more?",
                task.id, task.title, current
            ))
            .default(true)
            .interact()?;
        if !proceed {
            println!("Not approved.");
            return Ok(());
        }
    }

    let settings = db.approve_continuation(task_id, &config.settings.iteration)?;
    println!(
        "Approved: task #{} may run up to iteration {} before asking again (max {}).",
        task_id,
        settings.require_approval_after.min(settings.max_iterations),
        settings.max_iterations
    );
    println!("Resume with: autoloop on-exit {} --exit-code 0", task_id);
    Ok(())
}

fn print_event(envelope: &EventEnvelope) {
    let task_id = envelope.task_id;
    match envelope.channel.as_str() {
        "autoIterate:passed" => {
            println!(
                "{} Automatic acceptance criteria passed for task #{}",
                style("✓").green().bold(),
                task_id
            );
            if let Ok(result) =
                serde_json::from_value::<TaskVerificationResult>(envelope.payload.clone())
            {
                let passed = result.results.iter().filter(|r| r.passed).count();
                println!("  {}/{} results passing", passed, result.results.len());
            }
        }
        "autoIterate:manualPending" => {
            println!(
                "{} {} manual criteria await review: `autoloop criteria set-status <id> pass`",
                style("?").yellow().bold(),
                envelope.payload
            );
        }
        "autoIterate:maxReached" => {
            println!(
                "{} Task #{} reached its iteration limit. Raise it with `autoloop task settings {} --max-iterations N`.",
                style("■").red().bold(),
                task_id,
                task_id
            );
        }
        "autoIterate:approvalRequired" => {
            println!(
                "{} Task #{} paused after {} iterations. Continue with `autoloop approve {}`.",
                style("‖").yellow().bold(),
                task_id,
                envelope.payload,
                task_id
            );
        }
        "autoIterate:cancelled" => {
            println!("{} Auto-iteration cancelled for task #{}", style("■").dim(), task_id);
        }
        "autoIterate:error" => {
            let message = envelope
                .payload
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| envelope.payload.to_string());
            println!(
                "{} Auto-iteration error on task #{}: {}",
                style("✗").red().bold(),
                task_id,
                message
            );
        }
        other => debug!(channel = other, "unhandled event"),
    }
}
