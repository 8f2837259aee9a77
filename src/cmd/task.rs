//! Task commands.

use std::path::Path;

use anyhow::{Result, bail};
use autoloop::store::Db;
use autoloop::util::truncate_str;
use autoloop::verify::find_template;
use autoloop_common::IterationSettings;
use console::style;

use super::super::{SettingsArgs, TaskCommands};
use super::criteria::print_criteria;
use super::{open_db, require_task};

pub fn cmd_task(project_dir: &Path, command: TaskCommands) -> Result<()> {
    let (config, db) = open_db(project_dir)?;
    let defaults = config.settings.iteration;

    match command {
        TaskCommands::Add {
            project,
            title,
            description,
            template,
            settings,
        } => {
            let template = match template {
                Some(name) => match find_template(&name) {
                    Some(t) => Some(t),
                    None => bail!("Unknown template '{}'", name),
                },
                None => None,
            };
            let task = db.create_task(project, &title, &description)?;
            println!("Created task #{} '{}'", task.id, task.title);
            if let Some(t) = template {
                let criteria = db.replace_criteria(task.id, &t.criteria())?;
                println!("  {} criteria from template '{}'", criteria.len(), t.name);
            }
            if !settings.is_empty() {
                let applied = apply_settings(&db, task.id, &defaults, &settings)?;
                print_settings(&applied, true);
            }
        }
        TaskCommands::List { project } => {
            let tasks = db.list_tasks(project)?;
            if tasks.is_empty() {
                println!("No tasks in project #{}.", project);
                return Ok(());
            }
            println!(
                "{:<6} {:<36} {:<12} {:<10} {:<10}",
                "ID", "TITLE", "STATUS", "CRITERIA", "ITERATION"
            );
            for task in tasks {
                let criteria = db.get_criteria_for_task(task.id)?;
                let passing = criteria
                    .iter()
                    .filter(|c| c.status == autoloop_common::CriterionStatus::Pass)
                    .count();
                println!(
                    "{:<6} {:<36} {:<12} {:<10} {:<10}",
                    task.id,
                    truncate_str(&task.title, 36),
                    task.status.as_str(),
                    format!("{}/{}", passing, criteria.len()),
                    db.current_iteration_number(task.id)?
                );
            }
        }
        TaskCommands::Show { task } => {
            let task = require_task(&db, task)?;
            println!();
            println!("{} {}", style(format!("Task #{}", task.id)).bold(), task.title);
            println!("  Project:  #{}", task.project_id);
            println!("  Status:   {}", task.status);
            println!("  Created:  {}", task.created_at);
            println!("  Updated:  {}", task.updated_at);
            if !task.description.is_empty() {
                println!();
                println!("  {}", task.description);
            }
            println!();
            let stored = db.get_iteration_settings(task.id)?;
            print_settings(&stored.unwrap_or(defaults), stored.is_some());
            println!(
                "  Iterations so far: {}",
                db.current_iteration_number(task.id)?
            );
            println!();
            print_criteria(&db.get_criteria_for_task(task.id)?);
        }
        TaskCommands::Remove { task } => {
            let task = require_task(&db, task)?;
            db.delete_task(task.id)?;
            println!("Removed task #{} '{}'", task.id, task.title);
        }
        TaskCommands::Settings { task, settings } => {
            require_task(&db, task)?;
            if settings.is_empty() {
                let stored = db.get_iteration_settings(task)?;
                print_settings(&stored.unwrap_or(defaults), stored.is_some());
            } else {
                let applied = apply_settings(&db, task, &defaults, &settings)?;
                print_settings(&applied, true);
            }
        }
    }
    Ok(())
}

/// Merge `args` over the task's current settings and store the result as
/// its override.
pub fn apply_settings(
    db: &Db,
    task_id: i64,
    defaults: &IterationSettings,
    args: &SettingsArgs,
) -> Result<IterationSettings> {
    let mut settings = db.get_iteration_settings(task_id)?.unwrap_or(*defaults);
    if let Some(v) = args.auto_iterate {
        settings.auto_iterate = v;
    }
    if let Some(v) = args.max_iterations {
        settings.max_iterations = v;
    }
    if let Some(v) = args.require_approval_after {
        settings.require_approval_after = v;
    }
    if let Some(v) = args.pause_ms {
        settings.pause_between_iterations_ms = v;
    }
    db.set_iteration_settings(task_id, &settings)?;
    Ok(settings)
}

fn print_settings(settings: &IterationSettings, is_override: bool) {
    let source = if is_override { "task override" } else { "defaults" };
    println!("  Iteration settings ({}):", style(source).dim());
    println!("    auto_iterate             = {}", settings.auto_iterate);
    println!("    max_iterations           = {}", settings.max_iterations);
    println!("    require_approval_after   = {}", settings.require_approval_after);
    println!(
        "    pause_between_iterations = {}ms",
        settings.pause_between_iterations_ms
    );
}
