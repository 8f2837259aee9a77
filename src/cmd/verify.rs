//! One-shot verification of a task.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, bail};
use autoloop::store::{DbHandle, SqliteStore};
use autoloop::util::truncate_str;
use autoloop::verify::{VerificationAggregator, VerifierEngine};
use autoloop_common::{AcceptanceCriterion, TaskVerificationResult};
use console::style;

use super::{open_db, require_project, require_task, spinner};

pub async fn cmd_verify(project_dir: &Path, task_id: i64) -> Result<()> {
    let (config, db) = open_db(project_dir)?;
    let task = require_task(&db, task_id)?;
    let project = require_project(&db, task.project_id)?;

    let handle = DbHandle::new(db);
    let store = Arc::new(SqliteStore::new(handle.clone(), config.settings.iteration));
    let engine = Arc::new(VerifierEngine::from_config(&config.settings.verifier));
    let aggregator = VerificationAggregator::new(store, engine);

    let bar = spinner("Verify", format!("task #{}: {}", task.id, task.title));
    let result = aggregator
        .verify_task(task.id, Path::new(&project.path))
        .await;
    bar.finish_and_clear();
    let result = result?;

    let criteria = handle.call(move |db| db.get_criteria_for_task(task_id)).await?;
    print_verification(&criteria, &result);

    if !result.auto_criteria_passed {
        let failed = result.failed_results().count() - failing_manual(&criteria, &result);
        bail!("{} criteria failed verification", failed);
    }
    Ok(())
}

fn failing_manual(criteria: &[AcceptanceCriterion], result: &TaskVerificationResult) -> usize {
    result
        .failed_results()
        .filter(|r| {
            criteria
                .iter()
                .any(|c| c.id == r.criterion_id && c.is_manual())
        })
        .count()
}

/// Per-criterion outcome table followed by a one-line summary.
pub fn print_verification(criteria: &[AcceptanceCriterion], result: &TaskVerificationResult) {
    if result.results.is_empty() {
        println!("No acceptance criteria declared: nothing to verify.");
        return;
    }

    println!();
    for r in &result.results {
        let criterion = criteria.iter().find(|c| c.id == r.criterion_id);
        let manual = criterion.is_some_and(AcceptanceCriterion::is_manual);
        let mark = if r.passed {
            style("✓").green()
        } else if manual {
            style("?").yellow()
        } else {
            style("✗").red()
        };
        let description = criterion
            .map(|c| c.description.as_str())
            .unwrap_or("(criterion removed)");
        println!(
            "  {} #{:<5} {:<40} {:>6}ms",
            mark,
            r.criterion_id,
            truncate_str(description, 40),
            r.duration_ms
        );
        if !r.passed {
            let first_line = r.output.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
            if !first_line.is_empty() {
                println!("           {}", style(truncate_str(first_line.trim(), 100)).dim());
            }
        }
    }
    println!();

    let passed = result.results.iter().filter(|r| r.passed).count();
    let summary = format!("{}/{} criteria passed", passed, result.results.len());
    if result.all_passed {
        println!("{}", style(summary).green().bold());
    } else if result.auto_criteria_passed {
        println!(
            "{} ({} manual pending)",
            style(summary).yellow().bold(),
            result.manual_pending
        );
    } else {
        println!("{}", style(summary).red().bold());
    }
}
