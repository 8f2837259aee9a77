//! Project initialization and registry commands.

use std::path::Path;

use anyhow::{Context, Result};
use autoloop::config::AutoloopToml;

use super::super::ProjectCommands;
use super::open_db;

pub fn cmd_init(project_dir: &Path, name: Option<&str>) -> Result<()> {
    let (config, db) = open_db(project_dir)?;

    let config_file = config.config_file();
    if config_file.exists() {
        println!("Config already present at {}", config_file.display());
    } else {
        std::fs::write(&config_file, AutoloopToml::default().to_toml_string()?)
            .with_context(|| format!("Failed to write {}", config_file.display()))?;
        println!("Wrote default config to {}", config_file.display());
    }

    let path = project_dir
        .canonicalize()
        .unwrap_or_else(|_| project_dir.to_path_buf());
    let path_str = path.to_string_lossy().to_string();
    if let Some(existing) = db.list_projects()?.into_iter().find(|p| p.path == path_str) {
        println!(
            "Project #{} '{}' already registered for {}",
            existing.id, existing.name, existing.path
        );
        return Ok(());
    }

    let name = match name {
        Some(n) => n.to_string(),
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "project".to_string()),
    };
    let project = db.create_project(&name, &path_str)?;
    println!("Registered project #{} '{}'", project.id, project.name);
    println!();
    println!("Next steps:");
    println!("  1. autoloop task add {} \"<title>\"", project.id);
    println!("  2. autoloop criteria add <task> \"<description>\" --verifier command --param command=\"cargo test\"");
    println!("  3. autoloop run <task>");
    Ok(())
}

pub fn cmd_project(project_dir: &Path, command: ProjectCommands) -> Result<()> {
    let (_config, db) = open_db(project_dir)?;

    match command {
        ProjectCommands::Add { name, path } => {
            let path = path.unwrap_or_else(|| project_dir.to_path_buf());
            let path = path.canonicalize().unwrap_or(path);
            let project = db.create_project(&name, &path.to_string_lossy())?;
            println!(
                "Created project #{} '{}' at {}",
                project.id, project.name, project.path
            );
        }
        ProjectCommands::List => {
            let projects = db.list_projects()?;
            if projects.is_empty() {
                println!("No projects. Run `autoloop init` or `autoloop project add <name>`.");
                return Ok(());
            }
            println!("{:<6} {:<24} {:<20} PATH", "ID", "NAME", "CREATED");
            for p in projects {
                println!(
                    "{:<6} {:<24} {:<20} {}",
                    p.id,
                    autoloop::util::truncate_str(&p.name, 24),
                    p.created_at,
                    p.path
                );
            }
        }
    }
    Ok(())
}
