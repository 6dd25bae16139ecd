//! The Agent Runner effect (spec §6): a single opaque call per agent
//! invocation. Unlike the teacher's streaming [`crate::harness::Harness`]
//! trait, the runner used here has no `events()`/`send()` surface — the
//! worker, judge and planner each need exactly one prompt-in,
//! response-out round trip per invocation, with the transcript persisted
//! to disk for later inspection rather than streamed to the caller.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Which part of the pipeline is invoking the agent. Used to select the
/// configured agent type/model (spec §6 `agents.{role}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Worker,
    Judge,
    Planner,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Worker => "worker",
            Self::Judge => "judge",
            Self::Planner => "planner",
        };
        f.write_str(s)
    }
}

/// A single agent invocation request.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub role: AgentRole,
    pub agent_type: String,
    pub model: String,
    pub prompt: String,
    pub working_dir: PathBuf,
    pub session_id: Option<String>,
    pub log_path: PathBuf,
    pub metadata_path: PathBuf,
    pub timeout: Duration,
    pub env_vars: HashMap<String, String>,
}

/// The result of a completed agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRunResult {
    pub final_response: String,
    pub session_id: String,
    pub log_path: PathBuf,
    pub metadata_path: PathBuf,
}

/// Metadata persisted alongside the raw transcript at `metadata_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub role: AgentRole,
    pub agent_type: String,
    pub model: String,
    pub session_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to spawn agent binary '{binary}': {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("agent invocation exceeded timeout of {0:?}")]
    Timeout(Duration),

    #[error("agent exited with non-zero status {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("failed to write agent transcript to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize run metadata: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A single opaque call per agent invocation: prompt in, final response
/// out, with session id and on-disk artefacts for later inspection.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run_agent(&self, request: AgentRequest) -> Result<AgentRunResult, AgentError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn AgentRunner) {}
};

/// Spawns the configured agent binary as a subprocess, writes the prompt
/// to stdin, and collects all of stdout as the final response. Mirrors
/// the teacher's Claude Code process-harness idiom (piped stdio,
/// SIGTERM-then-SIGKILL on timeout) but collects to completion instead of
/// streaming.
#[derive(Debug, Clone)]
pub struct ProcessAgentRunner {
    binary_path: String,
}

impl ProcessAgentRunner {
    pub fn new() -> Self {
        Self {
            binary_path: "claude".to_string(),
        }
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary_path: path.into(),
        }
    }
}

impl Default for ProcessAgentRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRunner for ProcessAgentRunner {
    async fn run_agent(&self, request: AgentRequest) -> Result<AgentRunResult, AgentError> {
        let started_at = chrono::Utc::now();

        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("text")
            .arg("--model")
            .arg(&request.model);

        if let Some(ref session_id) = request.session_id {
            cmd.arg("--resume").arg(session_id);
        }

        cmd.current_dir(&request.working_dir);
        for (key, value) in &request.env_vars {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| AgentError::Spawn {
            binary: self.binary_path.clone(),
            source: e,
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(request.prompt.as_bytes()).await;
            drop(stdin);
        }

        let run = async {
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            if let Some(mut stdout) = child.stdout.take() {
                let _ = stdout.read_to_end(&mut stdout_buf).await;
            }
            if let Some(mut stderr) = child.stderr.take() {
                let _ = stderr.read_to_end(&mut stderr_buf).await;
            }
            let status = child.wait().await;
            (status, stdout_buf, stderr_buf)
        };

        let (timed_out, status, stdout_buf, stderr_buf) =
            match tokio::time::timeout(request.timeout, run).await {
                Ok((status, out, err)) => (false, status, out, err),
                Err(_) => {
                    warn!(binary = %self.binary_path, "agent invocation timed out, terminating");
                    terminate_child(&mut child).await;
                    (true, child.wait().await, Vec::new(), Vec::new())
                }
            };

        let finished_at = chrono::Utc::now();
        let exit_code = status.as_ref().ok().and_then(|s| s.code());
        let stdout_text = String::from_utf8_lossy(&stdout_buf).to_string();
        let stderr_text = String::from_utf8_lossy(&stderr_buf).to_string();

        write_file(&request.log_path, &format!("{stdout_text}\n--- stderr ---\n{stderr_text}")).await?;

        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| format!("session-{}", uuid::Uuid::new_v4().simple()));

        let metadata = RunMetadata {
            role: request.role,
            agent_type: request.agent_type.clone(),
            model: request.model.clone(),
            session_id: session_id.clone(),
            started_at,
            finished_at,
            exit_code,
            timed_out,
        };
        write_file(&request.metadata_path, &serde_json::to_string_pretty(&metadata)?).await?;

        if timed_out {
            return Err(AgentError::Timeout(request.timeout));
        }

        if let Some(code) = exit_code {
            if code != 0 {
                return Err(AgentError::NonZeroExit {
                    code,
                    stderr: stderr_text,
                });
            }
        }

        debug!(role = %request.role, session_id = %session_id, "agent invocation completed");

        Ok(AgentRunResult {
            final_response: stdout_text,
            session_id,
            log_path: request.log_path,
            metadata_path: request.metadata_path,
        })
    }
}

async fn terminate_child(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        #[cfg(unix)]
        {
            // SAFETY: pid is a valid child we spawned and have not yet reaped.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        let exited = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
        if exited.is_err() {
            let _ = child.kill().await;
        }
    } else {
        let _ = child.kill().await;
    }
}

async fn write_file(path: &Path, contents: &str) -> Result<(), AgentError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AgentError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
    }
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| AgentError::Io {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Test double that returns a canned response without spawning a process.
/// Used throughout the worker/judge/planner test suites so they do not
/// depend on a real agent binary.
#[derive(Debug, Clone)]
pub struct FakeAgentRunner {
    pub response: String,
}

impl FakeAgentRunner {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
        }
    }
}

#[async_trait]
impl AgentRunner for FakeAgentRunner {
    async fn run_agent(&self, request: AgentRequest) -> Result<AgentRunResult, AgentError> {
        write_file(&request.log_path, &self.response).await?;
        let session_id = request
            .session_id
            .unwrap_or_else(|| format!("session-{}", uuid::Uuid::new_v4().simple()));
        let metadata = RunMetadata {
            role: request.role,
            agent_type: request.agent_type,
            model: request.model,
            session_id: session_id.clone(),
            started_at: chrono::Utc::now(),
            finished_at: chrono::Utc::now(),
            exit_code: Some(0),
            timed_out: false,
        };
        write_file(&request.metadata_path, &serde_json::to_string_pretty(&metadata)?).await?;
        Ok(AgentRunResult {
            final_response: self.response.clone(),
            session_id,
            log_path: request.log_path,
            metadata_path: request.metadata_path,
        })
    }
}
