//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module      | Commands handled                                   |
//! |-------------|----------------------------------------------------|
//! | `project`   | `Init`, `Project`                                  |
//! | `task`      | `Task`                                             |
//! | `criteria`  | `Criteria`                                         |
//! | `verify`    | `Verify`                                           |
//! | `run`       | `Run`, `OnExit`, `Approve`                         |
//! | `history`   | `Iterations`, `Stats`                              |
//! | `patterns`  | `Patterns`, `Suggest`                              |
//! | `config`    | `Config`                                           |

pub mod config;
pub mod criteria;
pub mod history;
pub mod patterns;
pub mod project;
pub mod run;
pub mod task;
pub mod verify;

use std::path::Path;

use anyhow::Result;
use autoloop::config::Config;
use autoloop::errors::StoreError;
use autoloop::store::Db;
use autoloop_common::{Project, Task};

pub use config::cmd_config;
pub use criteria::cmd_criteria;
pub use history::{cmd_iterations, cmd_stats};
pub use patterns::{cmd_patterns, cmd_suggest};
pub use project::{cmd_init, cmd_project};
pub use run::{cmd_approve, cmd_on_exit, cmd_run};
pub use task::cmd_task;
pub use verify::cmd_verify;

/// Load configuration and open (creating if needed) the project database.
pub fn open_db(project_dir: &Path) -> Result<(Config, Db)> {
    let config = Config::load(project_dir)?;
    config.ensure_directories()?;
    let db = Db::new(&config.db_path())?;
    Ok((config, db))
}

pub fn require_task(db: &Db, id: i64) -> Result<Task> {
    db.get_task(id)?
        .ok_or_else(|| StoreError::TaskNotFound { id }.into())
}

pub fn require_project(db: &Db, id: i64) -> Result<Project> {
    db.get_project(id)?
        .ok_or_else(|| StoreError::ProjectNotFound { id }.into())
}

/// Spinner on stderr; hidden when stderr is not a terminal.
pub fn spinner(prefix: &str, message: impl Into<String>) -> indicatif::ProgressBar {
    let style = indicatif::ProgressStyle::default_spinner()
        .template("{prefix:.bold.dim} {spinner} {msg}")
        .unwrap_or_else(|_| indicatif::ProgressStyle::default_spinner());
    let bar = indicatif::ProgressBar::new_spinner();
    bar.set_style(style);
    bar.set_prefix(prefix.to_string());
    bar.set_message(message.into());
    bar.enable_steady_tick(std::time::Duration::from_millis(100));
    bar
}
