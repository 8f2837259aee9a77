//! Agent spawn collaborator.
//!
//! The orchestrator only talks to [`AgentSpawner`]. The real implementation
//! is [`ClaudeSpawner`]; tests substitute a recording double.

pub mod claude;

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use claude::{AgentExit, ClaudeSpawner};

/// Everything needed to start (or resume) one agent session for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub task_id: i64,
    pub project_id: i64,
    pub cwd: PathBuf,
    pub prompt: String,
    pub model: Option<String>,
    pub previous_session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SpawnOutcome {
    pub fn started(session_id: impl Into<String>) -> Self {
        Self {
            success: true,
            session_id: Some(session_id.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            session_id: None,
            error: Some(error.into()),
        }
    }
}

/// Starts agent sessions. Implementations guarantee at most one live
/// session per task and report a refused or failed start as
/// `success = false` rather than an error.
#[async_trait]
pub trait AgentSpawner: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnOutcome>;
}
