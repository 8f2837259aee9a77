//! Configuration view and initialization: `autoloop config`.

use std::path::Path;

use anyhow::{Context, Result, bail};
use autoloop::config::{AutoloopToml, Config, global_config_path};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let config = Config::load(project_dir)?;

            println!();
            println!("Autoloop Configuration");
            println!("======================");
            println!();
            let project_file = config.config_file();
            if project_file.exists() {
                println!("Project config: {}", project_file.display());
            } else {
                println!("Project config: {} (not present)", project_file.display());
            }
            if let Some(global) = global_config_path() {
                let marker = if global.exists() { "" } else { " (not present)" };
                println!("Global config:  {}{}", global.display(), marker);
            }
            println!("Database:       {}", config.db_path().display());
            println!();
            println!("Effective values (with env overrides):");
            println!();
            print!("{}", config.settings.to_toml_string()?);
            println!();
        }
        Some(ConfigCommands::Init { force }) => {
            let config = Config::with_defaults(project_dir);
            let path = config.config_file();
            if path.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            std::fs::create_dir_all(&config.autoloop_dir)
                .context("Failed to create .autoloop directory")?;
            std::fs::write(&path, AutoloopToml::default().to_toml_string()?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}
