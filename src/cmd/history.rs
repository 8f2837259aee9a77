//! Iteration history and statistics.

use std::path::Path;

use anyhow::{Result, bail};
use autoloop_common::{IterationStatus, TaskIteration};
use chrono::{DateTime, NaiveDateTime, Utc};
use console::style;

use super::verify::print_verification;
use super::{open_db, require_task};

pub fn cmd_iterations(project_dir: &Path, task_id: i64, detail: Option<u32>) -> Result<()> {
    let (_config, db) = open_db(project_dir)?;
    let task = require_task(&db, task_id)?;
    let iterations = db.list_iterations(task_id)?;

    if let Some(number) = detail {
        let Some(iteration) = iterations.iter().find(|i| i.iteration_number == number) else {
            bail!("Task #{} has no iteration {}", task_id, number);
        };
        print_iteration_header(iteration);
        match &iteration.verification_snapshot {
            Some(snapshot) => print_verification(&db.get_criteria_for_task(task_id)?, snapshot),
            None => println!("No verification snapshot recorded."),
        }
        return Ok(());
    }

    if iterations.is_empty() {
        println!("Task #{} '{}' has no iterations yet.", task.id, task.title);
        return Ok(());
    }

    println!();
    println!("Iterations for task #{} '{}':", task.id, task.title);
    println!(
        "{:<4} {:<10} {:<20} {:<10} {:<6} {:<8}",
        "#", "STATUS", "STARTED", "DURATION", "FILES", "PASSED"
    );
    println!(
        "{:<4} {:<10} {:<20} {:<10} {:<6} {:<8}",
        "----", "----------", "--------------------", "----------", "------", "--------"
    );
    for it in &iterations {
        let passed = it
            .verification_snapshot
            .as_ref()
            .map(|s| {
                format!(
                    "{}/{}",
                    s.results.iter().filter(|r| r.passed).count(),
                    s.results.len()
                )
            })
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<4} {:<10} {:<20} {:<10} {:<6} {:<8}",
            it.iteration_number,
            it.status.as_str(),
            it.started_at,
            it.duration_ms
                .map(format_duration)
                .unwrap_or_else(|| "-".to_string()),
            it.files_changed
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string()),
            passed
        );
    }
    println!();
    Ok(())
}

pub fn cmd_stats(project_dir: &Path, task_id: Option<i64>) -> Result<()> {
    let (_config, db) = open_db(project_dir)?;
    let scope = match task_id {
        Some(id) => {
            let task = require_task(&db, id)?;
            format!("task #{} '{}'", task.id, task.title)
        }
        None => "all tasks".to_string(),
    };
    let stats = db.iteration_stats(task_id)?;

    println!();
    println!("Iteration statistics for {}:", scope);
    println!("  Total:      {}", stats.total);
    println!("  Completed:  {}", style(stats.completed).green());
    println!("  Failed:     {}", style(stats.failed).red());
    println!("  Running:    {}", stats.running);
    println!("  Pass rate:  {:.0}%", stats.pass_rate() * 100.0);
    println!(
        "  Avg time:   {}",
        stats
            .avg_duration_ms
            .map(|ms| format_duration(ms.round() as u64))
            .unwrap_or_else(|| "-".to_string())
    );
    println!();
    Ok(())
}

fn print_iteration_header(it: &TaskIteration) {
    let status = match it.status {
        IterationStatus::Completed => style(it.status.as_str()).green(),
        IterationStatus::Failed => style(it.status.as_str()).red(),
        IterationStatus::Running => style(it.status.as_str()).yellow(),
    };
    println!();
    println!(
        "Iteration {} of task #{}: {}",
        it.iteration_number, it.task_id, status
    );
    println!(
        "  Started:   {}{}",
        it.started_at,
        time_ago(&it.started_at, Utc::now())
            .map(|ago| format!(" ({})", ago))
            .unwrap_or_default()
    );
    if let Some(done) = &it.completed_at {
        println!("  Completed: {}", done);
    }
    if let Some(files) = it.files_changed {
        println!("  Files changed: {}", files);
    }
}

/// Age of a SQLite `datetime('now')` timestamp (UTC), e.g. `5m ago`.
fn time_ago(timestamp: &str, now: DateTime<Utc>) -> Option<String> {
    let then = NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%d %H:%M:%S")
        .ok()?
        .and_utc();
    let secs = (now - then).num_seconds().max(0);
    Some(match secs {
        0..=59 => format!("{}s ago", secs),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    })
}

/// `850ms`, `12.3s`, `4m 05s`.
pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        let secs = ms / 1000;
        format!("{}m {:02}s", secs / 60, secs % 60)
    }
}
