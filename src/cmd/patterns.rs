//! Pattern Recorder commands: failure patterns and criteria suggestions.

use std::path::Path;

use anyhow::Result;
use autoloop::patterns::{
    common_failure_patterns, display_failure_patterns, display_suggestions, suggest_criteria,
};
use dialoguer::{Confirm, theme::ColorfulTheme};

use super::{open_db, require_project, require_task};

pub fn cmd_patterns(project_dir: &Path, project_id: i64, limit: usize) -> Result<()> {
    let (_config, db) = open_db(project_dir)?;
    let project = require_project(&db, project_id)?;
    println!("Project #{} '{}'", project.id, project.name);
    display_failure_patterns(&common_failure_patterns(&db, project_id, limit)?);
    Ok(())
}

pub fn cmd_suggest(
    project_dir: &Path,
    project_id: i64,
    title: &str,
    description: &str,
    limit: usize,
    apply_to: Option<i64>,
    yes: bool,
) -> Result<()> {
    let (_config, db) = open_db(project_dir)?;
    require_project(&db, project_id)?;
    let suggestions = suggest_criteria(&db, project_id, title, description, limit)?;
    display_suggestions(&suggestions);

    let Some(task_id) = apply_to else {
        return Ok(());
    };
    if suggestions.is_empty() {
        return Ok(());
    }
    let task = require_task(&db, task_id)?;
    if !yes {
        let proceed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!(
                "Add {} suggested criteria to task #{} '{}'?",
                suggestions.len(),
                task.id,
                task.title
            ))
            .default(true)
            .interact()?;
        if !proceed {
            return Ok(());
        }
    }
    for suggestion in &suggestions {
        db.add_criterion(task_id, &suggestion.criterion)?;
    }
    println!(
        "Added {} criteria to task #{}",
        suggestions.len(),
        task_id
    );
    Ok(())
}
