use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "autoloop")]
#[command(
    version,
    about = "Verify coding-agent work against acceptance criteria and iterate until it passes"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Answer yes to every confirmation prompt
    #[arg(long, global = true)]
    pub yes: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .autoloop/ with a default config and register the directory as a project
    Init {
        /// Project name (defaults to the directory name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Manage projects
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Manage tasks and their iteration settings
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Manage acceptance criteria
    Criteria {
        #[command(subcommand)]
        command: CriteriaCommands,
    },
    /// Run every acceptance criterion of a task once
    Verify { task: i64 },
    /// Start an agent on a task and auto-iterate until the loop stops
    Run {
        task: i64,
        /// Prompt for the first session (defaults to the task and its criteria)
        #[arg(long)]
        prompt: Option<String>,
        /// Model for every session of this run
        #[arg(long)]
        model: Option<String>,
    },
    /// Feed a single agent-session exit into the auto-iteration loop
    OnExit {
        task: i64,
        #[arg(long)]
        exit_code: i32,
        /// Session to resume if a retry is spawned
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Allow a task stopped at its approval threshold to keep iterating
    Approve { task: i64 },
    /// Show the iteration history of a task
    Iterations {
        task: i64,
        /// Print the verification snapshot of this iteration number
        #[arg(long)]
        detail: Option<u32>,
    },
    /// Iteration statistics for one task or all tasks
    Stats { task: Option<i64> },
    /// Recurring failure patterns of a project
    Patterns {
        project: i64,
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Suggest acceptance criteria for a new task from similar past tasks
    Suggest {
        project: i64,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "5")]
        limit: usize,
        /// Add the suggestions to this task
        #[arg(long)]
        apply: Option<i64>,
    },
    /// View or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ProjectCommands {
    Add {
        name: String,
        /// Working directory of the project (defaults to --project-dir)
        #[arg(long)]
        path: Option<PathBuf>,
    },
    List,
}

#[derive(Subcommand, Clone)]
pub enum TaskCommands {
    Add {
        project: i64,
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Seed criteria from a built-in template
        #[arg(long)]
        template: Option<String>,
        #[command(flatten)]
        settings: SettingsArgs,
    },
    List { project: i64 },
    Show { task: i64 },
    /// Delete a task with its criteria and iteration history
    Remove { task: i64 },
    /// Show or change the iteration settings of a task
    Settings {
        task: i64,
        #[command(flatten)]
        settings: SettingsArgs,
    },
}

/// Iteration setting overrides. Unset flags keep the current value.
#[derive(clap::Args, Clone, Debug, Default)]
pub struct SettingsArgs {
    #[arg(long)]
    pub auto_iterate: Option<bool>,
    #[arg(long)]
    pub max_iterations: Option<u32>,
    #[arg(long)]
    pub require_approval_after: Option<u32>,
    #[arg(long)]
    pub pause_ms: Option<u64>,
}

impl SettingsArgs {
    pub fn is_empty(&self) -> bool {
        self.auto_iterate.is_none()
            && self.max_iterations.is_none()
            && self.require_approval_after.is_none()
            && self.pause_ms.is_none()
    }
}

#[derive(Subcommand, Clone)]
pub enum CriteriaCommands {
    Add {
        task: i64,
        description: String,
        /// command, file_exists, grep, test_pass or manual
        #[arg(long)]
        verifier: String,
        /// Verifier parameter as key=value (repeatable)
        #[arg(long = "param")]
        param: Vec<String>,
        /// Verifier parameters as a JSON object
        #[arg(long, conflicts_with = "param")]
        params: Option<String>,
        #[arg(long, default_value = "medium")]
        priority: String,
    },
    List { task: i64 },
    Remove { criterion: i64 },
    /// Record a status by hand (resolves manual criteria)
    SetStatus {
        criterion: i64,
        /// pending, pass or fail
        status: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// List built-in templates, or apply one to a task
    Template {
        name: Option<String>,
        #[arg(long, requires = "name")]
        task: Option<i64>,
        /// Replace the task's criteria instead of appending
        #[arg(long)]
        replace: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write a default .autoloop/autoloop.toml
    Init {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    autoloop::logging::init(cli.verbose);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init { name } => cmd::cmd_init(&project_dir, name.as_deref())?,
        Commands::Project { command } => cmd::cmd_project(&project_dir, command.clone())?,
        Commands::Task { command } => cmd::cmd_task(&project_dir, command.clone())?,
        Commands::Criteria { command } => cmd::cmd_criteria(&project_dir, command.clone())?,
        Commands::Verify { task } => cmd::cmd_verify(&project_dir, *task).await?,
        Commands::Run {
            task,
            prompt,
            model,
        } => cmd::cmd_run(&project_dir, *task, prompt.clone(), model.clone()).await?,
        Commands::OnExit {
            task,
            exit_code,
            session_id,
            model,
        } => {
            cmd::cmd_on_exit(
                &project_dir,
                *task,
                *exit_code,
                session_id.clone(),
                model.clone(),
            )
            .await?
        }
        Commands::Approve { task } => cmd::cmd_approve(&project_dir, *task, cli.yes)?,
        Commands::Iterations { task, detail } => cmd::cmd_iterations(&project_dir, *task, *detail)?,
        Commands::Stats { task } => cmd::cmd_stats(&project_dir, *task)?,
        Commands::Patterns { project, limit } => cmd::cmd_patterns(&project_dir, *project, *limit)?,
        Commands::Suggest {
            project,
            title,
            description,
            limit,
            apply,
        } => cmd::cmd_suggest(&project_dir, *project, title, description, *limit, *apply, cli.yes)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
