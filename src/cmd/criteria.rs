//! Acceptance-criteria commands.

use std::path::Path;

use anyhow::{Context, Result, bail};
use autoloop::util::truncate_str;
use autoloop::verify::{TEMPLATES, Verifier, find_template};
use autoloop_common::{AcceptanceCriterion, CriterionStatus, NewCriterion, Priority};
use console::style;
use serde_json::{Map, Value};

use super::super::CriteriaCommands;
use super::{open_db, require_task};

pub fn cmd_criteria(project_dir: &Path, command: CriteriaCommands) -> Result<()> {
    let db = || open_db(project_dir).map(|(_config, db)| db);

    match command {
        CriteriaCommands::Add {
            task,
            description,
            verifier,
            param,
            params,
            priority,
        } => {
            let params = match params {
                Some(json) => parse_params_json(&json)?,
                None => parse_key_values(&param)?,
            };
            // Reject declarations the engine could never run.
            Verifier::from_criterion(&verifier, &params)?;
            let priority: Priority = priority.parse().map_err(anyhow::Error::msg)?;
            let criterion = db()?.add_criterion(
                task,
                &NewCriterion::new(description, verifier, params).with_priority(priority),
            )?;
            println!(
                "Added criterion #{} '{}' ({}) to task #{}",
                criterion.id, criterion.description, criterion.verifier, task
            );
        }
        CriteriaCommands::List { task } => {
            let db = db()?;
            require_task(&db, task)?;
            print_criteria(&db.get_criteria_for_task(task)?);
        }
        CriteriaCommands::Remove { criterion } => {
            if !db()?.delete_criterion(criterion)? {
                bail!("Criterion {} not found", criterion);
            }
            println!("Removed criterion #{}", criterion);
        }
        CriteriaCommands::SetStatus {
            criterion,
            status,
            note,
        } => {
            let status: CriterionStatus = status.parse().map_err(anyhow::Error::msg)?;
            let updated = db()?.update_criterion_status(criterion, status, note.as_deref())?;
            println!(
                "Criterion #{} '{}' is now {}",
                updated.id,
                updated.description,
                status_label(updated.status)
            );
        }
        CriteriaCommands::Template {
            name: Some(name),
            task,
            replace,
        } => {
            let Some(template) = find_template(&name) else {
                bail!(
                    "Unknown template '{}'. Available: {}",
                    name,
                    TEMPLATES.iter().map(|t| t.name).collect::<Vec<_>>().join(", ")
                );
            };
            let Some(task) = task else {
                println!("Template '{}': {}", template.name, template.description);
                for c in template.criteria() {
                    println!(
                        "  - [{}] {} ({}) {}",
                        c.priority.as_str(),
                        c.description,
                        c.verifier,
                        c.params
                    );
                }
                return Ok(());
            };
            let db = db()?;
            let criteria = if replace {
                db.replace_criteria(task, &template.criteria())?
            } else {
                for c in template.criteria() {
                    db.add_criterion(task, &c)?;
                }
                db.get_criteria_for_task(task)?
            };
            println!(
                "Applied template '{}' to task #{} ({} criteria)",
                template.name,
                task,
                criteria.len()
            );
        }
        CriteriaCommands::Template { name: None, .. } => list_templates(),
    }
    Ok(())
}

fn list_templates() {
    println!("{:<10} DESCRIPTION", "NAME");
    for t in TEMPLATES {
        println!("{:<10} {}", t.name, t.description);
    }
}

pub fn status_label(status: CriterionStatus) -> String {
    match status {
        CriterionStatus::Pass => style("pass").green().to_string(),
        CriterionStatus::Fail => style("fail").red().to_string(),
        CriterionStatus::Pending => style("pending").yellow().to_string(),
    }
}

/// Table of criteria with their latest status.
pub fn print_criteria(criteria: &[AcceptanceCriterion]) {
    if criteria.is_empty() {
        println!("No acceptance criteria.");
        return;
    }
    println!(
        "{:<6} {:<36} {:<12} {:<9} {:<8}",
        "ID", "DESCRIPTION", "VERIFIER", "PRIORITY", "STATUS"
    );
    for c in criteria {
        println!(
            "{:<6} {:<36} {:<12} {:<9} {}",
            c.id,
            truncate_str(&c.description, 36),
            c.verifier,
            c.priority.as_str(),
            status_label(c.status)
        );
    }
}

fn parse_params_json(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw).context("--params must be valid JSON")?;
    if !value.is_object() {
        bail!("--params must be a JSON object");
    }
    Ok(value)
}

/// Parameters whose `--param` value is parsed as a JSON scalar.
const TYPED_PARAMS: [&str; 2] = ["expected_exit_code", "should_match"];

/// `key=value` pairs into a JSON object. Values are strings except for
/// [`TYPED_PARAMS`].
fn parse_key_values(pairs: &[String]) -> Result<Value> {
    let mut map = Map::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("Invalid --param '{}': expected key=value", pair);
        };
        let key = key.trim();
        let value = match serde_json::from_str::<Value>(raw) {
            Ok(v @ (Value::Bool(_) | Value::Number(_))) if TYPED_PARAMS.contains(&key) => v,
            _ => Value::String(raw.to_string()),
        };
        map.insert(key.to_string(), value);
    }
    Ok(Value::Object(map))
}
