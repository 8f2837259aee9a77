use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot, watch};
use tracing::{debug, info, warn};

use super::{AgentSpawner, SpawnOutcome, SpawnRequest};
use crate::config::AgentSection;

/// How an agent session ended.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentExit {
    /// Process exit code, `-1` when killed by a signal.
    pub exit_code: i32,
    /// Session id to resume from. Taken from the agent's own stream when it
    /// reports one, else the id the session was started with.
    pub session_id: Option<String>,
}

/// Handle for a running agent process
struct AgentHandle {
    session_id: String,
    exit: watch::Receiver<Option<AgentExit>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl AgentHandle {
    fn is_live(&self) -> bool {
        self.exit.borrow().is_none()
    }
}

/// Spawns the coding-agent CLI, one process per task.
pub struct ClaudeSpawner {
    settings: AgentSection,
    running: Arc<Mutex<HashMap<i64, AgentHandle>>>,
}

impl ClaudeSpawner {
    pub fn new(settings: AgentSection) -> Self {
        Self {
            settings,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Command-line arguments for one session. A previous session is resumed,
    /// otherwise `new_session_id` names a fresh one.
    pub fn build_args(&self, request: &SpawnRequest, new_session_id: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--print".into(),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
        ];
        if self.settings.skip_permissions {
            args.push("--dangerously-skip-permissions".into());
        }
        if let Some(model) = request.model.as_ref().or(self.settings.model.as_ref()) {
            args.push("--model".into());
            args.push(model.clone());
        }
        match &request.previous_session_id {
            Some(prev) => {
                args.push("--resume".into());
                args.push(prev.clone());
            }
            None => {
                args.push("--session-id".into());
                args.push(new_session_id.to_string());
            }
        }
        args
    }

    pub async fn is_running(&self, task_id: i64) -> bool {
        let running = self.running.lock().await;
        running.get(&task_id).is_some_and(AgentHandle::is_live)
    }

    /// Wait for the task's current session to end. `None` if no session was
    /// ever started for the task.
    pub async fn wait_for_exit(&self, task_id: i64) -> Option<AgentExit> {
        let (mut exit_rx, session_id) = {
            let running = self.running.lock().await;
            let handle = running.get(&task_id)?;
            (handle.exit.clone(), handle.session_id.clone())
        };
        let exit = match exit_rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            // Monitor dropped without reporting: treat as abnormal exit.
            Err(_) => Some(AgentExit {
                exit_code: -1,
                session_id: Some(session_id.clone()),
            }),
        };

        let mut running = self.running.lock().await;
        if running
            .get(&task_id)
            .is_some_and(|h| h.session_id == session_id && !h.is_live())
        {
            running.remove(&task_id);
        }
        exit
    }

    /// Kill the task's live session, if any. Returns whether one was signalled.
    pub async fn kill(&self, task_id: i64) -> bool {
        let mut running = self.running.lock().await;
        match running.get_mut(&task_id).and_then(|h| h.kill_tx.take()) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    async fn start(&self, request: SpawnRequest) -> Result<SpawnOutcome> {
        let mut running = self.running.lock().await;
        if running.get(&request.task_id).is_some_and(AgentHandle::is_live) {
            warn!(task_id = request.task_id, "agent session already running");
            return Ok(SpawnOutcome::failed(format!(
                "Task {} already has a live agent session",
                request.task_id
            )));
        }

        let new_session_id = uuid::Uuid::new_v4().to_string();
        let session_id = request
            .previous_session_id
            .clone()
            .unwrap_or_else(|| new_session_id.clone());
        let args = self.build_args(&request, &new_session_id);

        let spawned = Command::new(&self.settings.cmd)
            .args(&args)
            .current_dir(&request.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return Ok(SpawnOutcome::failed(format!(
                    "Failed to spawn {}: {}",
                    self.settings.cmd, e
                )));
            }
        };

        // Write prompt to stdin and close it. An agent that exits without
        // reading it is reported through its exit code.
        if let Some(mut stdin) = child.stdin.take() {
            let written = async {
                stdin
                    .write_all(request.prompt.as_bytes())
                    .await
                    .context("Failed to write prompt to agent stdin")?;
                stdin.shutdown().await.context("Failed to close stdin")
            };
            if let Err(e) = written.await {
                warn!(task_id = request.task_id, "{:#}", e);
            }
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        let stdout = child.stdout.take();
        tokio::spawn(monitor(
            request.task_id,
            child,
            stdout,
            session_id.clone(),
            exit_tx,
            kill_rx,
        ));

        info!(
            task_id = request.task_id,
            session_id = %session_id,
            resumed = request.previous_session_id.is_some(),
            "agent session started"
        );
        running.insert(
            request.task_id,
            AgentHandle {
                session_id: session_id.clone(),
                exit: exit_rx,
                kill_tx: Some(kill_tx),
            },
        );
        Ok(SpawnOutcome::started(session_id))
    }
}

#[async_trait]
impl AgentSpawner for ClaudeSpawner {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnOutcome> {
        self.start(request).await
    }
}

/// Own the child until it exits: drain stdout, honour kill requests, then
/// publish the exit.
async fn monitor(
    task_id: i64,
    mut child: Child,
    stdout: Option<ChildStdout>,
    session_id: String,
    exit_tx: watch::Sender<Option<AgentExit>>,
    kill_rx: oneshot::Receiver<()>,
) {
    let reader = tokio::spawn(async move {
        let mut reported: Option<String> = None;
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(id) = stream_session_id(&line) {
                    reported = Some(id);
                }
                debug!(task_id, line = %line, "agent output");
            }
        }
        reported
    });

    let (status, killed) = tokio::select! {
        status = child.wait() => (status, false),
        _ = kill_rx => {
            if let Err(e) = child.kill().await {
                warn!(task_id, "Failed to kill agent process: {}", e);
            }
            (child.wait().await, true)
        }
    };
    // Orphaned grandchildren may keep stdout open after a kill.
    if killed {
        reader.abort();
    }
    let exit_code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            warn!(task_id, "Failed to wait for agent process: {}", e);
            -1
        }
    };
    let reported = reader.await.ok().flatten();

    info!(task_id, exit_code, "agent session exited");
    let _ = exit_tx.send(Some(AgentExit {
        exit_code,
        session_id: reported.or(Some(session_id)),
    }));
}

/// Session id from a stream-json line such as `{"type":"system","session_id":"..."}`.
fn stream_session_id(line: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    value
        .get("session_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}
