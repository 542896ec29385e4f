//! ACP agent process spawner.
//!
//! Spawns the agent executable with piped stdio and `kill_on_drop(true)`.
//! The child inherits the host environment plus any per-agent variables
//! from config, and starts in the session working directory. ACP agents
//! emit nothing until `initialize` is sent, so there is no ready-line wait.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{AppError, Result};

// ── Configuration ────────────────────────────────────────────────────────────

/// Configuration for spawning an ACP agent process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Agent name, used in log fields.
    pub agent: String,
    /// Resolved executable path.
    pub command: PathBuf,
    /// Launch arguments.
    pub args: Vec<String>,
    /// Working directory of the child.
    pub cwd: PathBuf,
    /// Extra environment variables layered over the inherited environment.
    pub env: BTreeMap<String, String>,
}

// ── Connection handle ────────────────────────────────────────────────────────

/// Stdio handles of a spawned agent process.
#[derive(Debug)]
pub struct AcpConnection {
    /// Child process handle; dropping it kills the agent.
    pub child: Child,
    /// Agent stdin (host → agent frames).
    pub stdin: ChildStdin,
    /// Agent stdout (agent → host frames).
    pub stdout: ChildStdout,
    /// Agent stderr, free-form diagnostics.
    pub stderr: Option<ChildStderr>,
}

// ── Spawner ──────────────────────────────────────────────────────────────────

/// Spawn the agent process described by `config`.
///
/// # Errors
///
/// - `AppError::Acp("failed to spawn agent: …")` on OS spawn failure.
/// - `AppError::Acp("failed to capture agent …")` if a pipe is missing.
pub fn spawn_agent(config: &SpawnConfig) -> Result<AcpConnection> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .envs(&config.env)
        .current_dir(&config.cwd)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Acp(format!("failed to spawn agent: {err}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Acp("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Acp("failed to capture agent stdout".into()))?;
    let stderr = child.stderr.take();

    info!(
        agent = config.agent,
        command = %config.command.display(),
        pid = child.id(),
        "agent process spawned"
    );

    Ok(AcpConnection {
        child,
        stdin,
        stdout,
        stderr,
    })
}

/// Forward each stderr line of the agent to `DEBUG` logs until EOF.
#[must_use]
pub fn drain_stderr(agent: String, stderr: ChildStderr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!(agent, line, "agent stderr"),
                Ok(None) => break,
                Err(err) => {
                    debug!(agent, %err, "agent stderr read failed");
                    break;
                }
            }
        }
    })
}
