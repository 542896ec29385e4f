//! Transport-agnostic agent driver abstraction.
//!
//! The [`AgentDriver`] trait decouples the session engine from the process
//! and wire details of talking to an agent. Every protocol call the engine
//! makes routes through this trait; everything the agent pushes back arrives
//! as [`AgentEvent`]s on the channel handed to [`AgentLauncher::launch`].

pub mod acp_driver;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::acp::protocol::{
    InitializeResponse, NewSessionResponse, PermissionOutcome, PermissionRequestParams,
    PromptResponse,
};
use crate::models::mcp::McpServerConfig;
use crate::models::message::ContentBlock;
use crate::models::update::SessionUpdate;
use crate::Result;

/// Boxed future returned by collaborator trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Events delivered into the engine's single ordered event channel.
#[derive(Debug)]
pub enum AgentEvent {
    /// A decoded `session/update` notification.
    SessionUpdate {
        /// Session the update belongs to.
        session_id: String,
        /// The update.
        update: Box<SessionUpdate>,
    },
    /// The agent asks the user to approve a tool call.
    PermissionRequested {
        /// JSON-RPC id to answer.
        request_id: serde_json::Value,
        /// Request payload.
        request: Box<PermissionRequestParams>,
    },
    /// The agent's output stream ended.
    StreamClosed {
        /// Human-readable reason.
        reason: String,
    },
    /// Engine-internal marker: acknowledged once every earlier event is applied.
    Barrier(oneshot::Sender<()>),
}

/// Everything needed to start one agent process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Agent name.
    pub agent: String,
    /// Resolved executable.
    pub command: PathBuf,
    /// Launch arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Extra environment.
    pub env: BTreeMap<String, String>,
    /// Deadline for short control requests (`authenticate`, `set_mode`, ...).
    pub request_timeout: Duration,
    /// How long [`AgentDriver::terminate`] waits before killing the process.
    pub terminate_grace: Duration,
}

/// Starts agent processes.
pub trait AgentLauncher: Send + Sync {
    /// Spawn the agent and connect its streams, delivering events to `events`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Acp`](crate::AppError::Acp) if the process cannot
    /// be spawned.
    fn launch<'a>(
        &'a self,
        spec: &'a LaunchSpec,
        events: mpsc::Sender<AgentEvent>,
    ) -> BoxFuture<'a, Arc<dyn AgentDriver>>;
}

/// Protocol calls the engine issues against one connected agent.
pub trait AgentDriver: Send + Sync {
    /// Exchange capabilities.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Timeout`](crate::AppError::Timeout) when the agent
    /// does not answer within `timeout`, or the agent's error.
    fn initialize(&self, timeout: Duration) -> BoxFuture<'_, InitializeResponse>;

    /// Run an authentication method, optionally carrying a stored credential.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Rpc`](crate::AppError::Rpc) when the agent rejects it.
    fn authenticate<'a>(
        &'a self,
        method_id: &'a str,
        credential: Option<String>,
    ) -> BoxFuture<'a, ()>;

    /// Create a session in `cwd` with the given MCP servers.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Timeout`](crate::AppError::Timeout) after `timeout`,
    /// or the agent's error (often auth-required).
    fn new_session<'a>(
        &'a self,
        cwd: &'a Path,
        servers: &'a [McpServerConfig],
        timeout: Duration,
    ) -> BoxFuture<'a, NewSessionResponse>;

    /// Switch the session mode.
    ///
    /// # Errors
    ///
    /// Returns the agent's error.
    fn set_mode<'a>(&'a self, session_id: &'a str, mode_id: &'a str) -> BoxFuture<'a, ()>;

    /// Switch the session model.
    ///
    /// # Errors
    ///
    /// Returns the agent's error.
    fn set_model<'a>(&'a self, session_id: &'a str, model_id: &'a str) -> BoxFuture<'a, ()>;

    /// Submit a prompt and wait for the turn to end.
    ///
    /// # Errors
    ///
    /// Returns the agent's error or [`AppError::Acp`](crate::AppError::Acp)
    /// when the stream closes mid-turn.
    fn send_prompt<'a>(
        &'a self,
        session_id: &'a str,
        blocks: Vec<ContentBlock>,
    ) -> BoxFuture<'a, PromptResponse>;

    /// Send the `session/cancel` notification.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Acp`](crate::AppError::Acp) if the write fails.
    fn send_cancel<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, ()>;

    /// Answer a pending permission request.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Acp`](crate::AppError::Acp) if the write fails.
    fn respond_permission(
        &self,
        request_id: serde_json::Value,
        outcome: PermissionOutcome,
    ) -> BoxFuture<'_, ()>;

    /// Stop the agent process. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`](crate::AppError::Io) if the process cannot be killed.
    fn terminate(&self) -> BoxFuture<'_, ()>;
}
