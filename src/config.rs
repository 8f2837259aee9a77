//! Layered configuration for autoloop.
//!
//! Settings are read from `.autoloop/autoloop.toml` in the project, layered
//! over `~/.autoloop/autoloop.toml`, then environment variables, then CLI
//! flags. Every field has a default so a missing file is not an error.
//!
//! # Configuration File Format
//!
//! ```toml
//! [iteration]
//! auto_iterate = true
//! max_iterations = 5
//! require_approval_after = 3
//! pause_between_iterations_ms = 2000
//!
//! [verifier]
//! command_timeout_secs = 300
//! max_output_chars = 10000
//!
//! [agent]
//! cmd = "claude"
//! model = "sonnet"
//! skip_permissions = true
//!
//! [database]
//! path = ".autoloop/autoloop.db"
//! ```

use anyhow::{Context, Result};
use autoloop_common::IterationSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory holding project-local state and configuration.
pub const AUTOLOOP_DIR: &str = ".autoloop";

/// Configuration file name inside [`AUTOLOOP_DIR`].
pub const CONFIG_FILE: &str = "autoloop.toml";

/// Verifier engine limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerifierSection {
    /// Hard wall-clock limit for one command verifier.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Cap on captured stdout+stderr, in characters.
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

fn default_command_timeout_secs() -> u64 {
    300
}

fn default_max_output_chars() -> usize {
    10_000
}

impl Default for VerifierSection {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            max_output_chars: default_max_output_chars(),
        }
    }
}

impl VerifierSection {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Coding-agent CLI settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    #[serde(default = "default_agent_cmd")]
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_skip_permissions")]
    pub skip_permissions: bool,
}

fn default_agent_cmd() -> String {
    "claude".to_string()
}

fn default_skip_permissions() -> bool {
    true
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            cmd: default_agent_cmd(),
            model: None,
            skip_permissions: default_skip_permissions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseSection {
    /// Database file, relative to the project directory unless absolute.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    format!("{}/autoloop.db", AUTOLOOP_DIR)
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// The complete autoloop.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AutoloopToml {
    /// Default iteration bounds for tasks without their own override
    #[serde(default)]
    pub iteration: IterationSettings,
    #[serde(default)]
    pub verifier: VerifierSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub database: DatabaseSection,
}

impl AutoloopToml {
    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse autoloop.toml")
    }

    /// Load and merge the given files in order; later files win per key.
    /// Files that do not exist are skipped.
    pub fn load_layers(paths: &[PathBuf]) -> Result<Self> {
        let mut merged = toml::Table::new();
        for path in paths {
            if !path.exists() {
                continue;
            }
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let layer: toml::Table = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            merge_tables(&mut merged, layer);
        }
        toml::Value::Table(merged)
            .try_into()
            .context("Invalid autoloop configuration")
    }

    /// Apply environment overrides through `lookup` (normally `std::env::var`).
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(cmd) = lookup("AUTOLOOP_AGENT_CMD") {
            self.agent.cmd = cmd;
        }
        if let Some(model) = lookup("AUTOLOOP_MODEL") {
            self.agent.model = Some(model);
        }
        if let Some(path) = lookup("AUTOLOOP_DB") {
            self.database.path = path;
        }
        if let Some(flag) = lookup("AUTOLOOP_AUTO_ITERATE") {
            self.iteration.auto_iterate = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        if let Some(max) = lookup("AUTOLOOP_MAX_ITERATIONS").and_then(|v| v.parse().ok()) {
            self.iteration.max_iterations = max;
        }
    }

    /// Serialize to pretty TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize autoloop.toml")
    }
}

/// Recursively merge `overlay` into `base`; nested tables merge key by key.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Global configuration file (`~/.autoloop/autoloop.toml`), if a home
/// directory can be determined.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(AUTOLOOP_DIR).join(CONFIG_FILE))
}

/// Runtime configuration resolved for one project directory.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub autoloop_dir: PathBuf,
    pub settings: AutoloopToml,
}

impl Config {
    /// Resolve all layers for `project_dir`.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let mut layers = Vec::new();
        if let Some(global) = global_config_path() {
            layers.push(global);
        }
        let autoloop_dir = project_dir.join(AUTOLOOP_DIR);
        layers.push(autoloop_dir.join(CONFIG_FILE));

        let mut settings = AutoloopToml::load_layers(&layers)?;
        settings.apply_env_with(|key| std::env::var(key).ok());

        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            autoloop_dir,
            settings,
        })
    }

    /// Config with defaults only, rooted at `project_dir`.
    pub fn with_defaults(project_dir: &Path) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            autoloop_dir: project_dir.join(AUTOLOOP_DIR),
            settings: AutoloopToml::default(),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.autoloop_dir.join(CONFIG_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        let path = Path::new(&self.settings.database.path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.autoloop_dir)
            .context("Failed to create .autoloop directory")?;
        if let Some(parent) = self.db_path().parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        Ok(())
    }
}
