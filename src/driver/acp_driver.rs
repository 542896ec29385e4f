//! Stdio ACP implementation of [`AgentDriver`] and [`AgentLauncher`].
//!
//! # Connection lifecycle
//!
//! 1. [`AcpLauncher::launch`] spawns the process and starts the reader,
//!    writer, and stderr tasks.
//! 2. The engine issues calls through [`AcpDriver`]; responses are
//!    correlated by [`AcpClient`].
//! 3. [`AgentDriver::terminate`] cancels the tasks, waits out the grace
//!    period, then kills the process.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::acp::client::{AcpClient, PendingRequests};
use crate::acp::handshake;
use crate::acp::protocol::{
    self, InitializeResponse, NewSessionResponse, PermissionOutcome, PromptResponse,
    METHOD_AUTHENTICATE, METHOD_CANCEL, METHOD_PROMPT, METHOD_SESSION_NEW, METHOD_SET_MODE,
    METHOD_SET_MODEL,
};
use crate::acp::reader::{run_reader, ReaderRoutes};
use crate::acp::spawner::{drain_stderr, spawn_agent, SpawnConfig};
use crate::acp::writer::run_writer;
use crate::driver::{AgentDriver, AgentEvent, AgentLauncher, BoxFuture, LaunchSpec};
use crate::models::mcp::McpServerConfig;
use crate::models::message::ContentBlock;
use crate::{AppError, Result};

/// Capacity of the outbound frame channel.
const OUTBOUND_CAPACITY: usize = 64;

// ── AcpDriver ─────────────────────────────────────────────────────────────────

/// One connected ACP agent process.
#[derive(Debug)]
pub struct AcpDriver {
    agent: String,
    client: AcpClient,
    child: Mutex<Option<Child>>,
    cancel: CancellationToken,
    request_timeout: Duration,
    terminate_grace: Duration,
}

impl AcpDriver {
    /// Wrap an already-connected client. `child` is `None` for in-process pipes.
    #[must_use]
    pub fn new(
        agent: String,
        client: AcpClient,
        child: Option<Child>,
        cancel: CancellationToken,
        request_timeout: Duration,
        terminate_grace: Duration,
    ) -> Self {
        Self {
            agent,
            client,
            child: Mutex::new(child),
            cancel,
            request_timeout,
            terminate_grace,
        }
    }

    /// Connect to an agent over arbitrary byte streams.
    ///
    /// Spawns the reader and writer tasks; used by [`AcpLauncher`] for child
    /// stdio and by tests for in-memory pipes.
    #[must_use]
    pub fn connect<R, W>(
        spec: &LaunchSpec,
        stdout: R,
        stdin: W,
        child: Option<Child>,
        events: mpsc::Sender<AgentEvent>,
    ) -> Self
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let pending = Arc::new(PendingRequests::new());
        let (outbound_tx, outbound_rx) = mpsc::channel::<Value>(OUTBOUND_CAPACITY);

        let span = tracing::info_span!("acp", agent = spec.agent.as_str());

        let routes = ReaderRoutes {
            pending: Arc::clone(&pending),
            events,
            outbound: outbound_tx.clone(),
        };
        tokio::spawn(
            run_reader(spec.agent.clone(), stdout, routes, cancel.clone()).instrument(span.clone()),
        );

        let writer_agent = spec.agent.clone();
        let writer_cancel = cancel.clone();
        tokio::spawn(
            async move {
                if let Err(e) = run_writer(writer_agent, stdin, outbound_rx, writer_cancel).await {
                    warn!(error = %e, "acp writer exited with error");
                }
            }
            .instrument(span),
        );

        Self::new(
            spec.agent.clone(),
            AcpClient::new(outbound_tx, pending),
            child,
            cancel,
            spec.request_timeout,
            spec.terminate_grace,
        )
    }

    async fn call_unit(&self, method: &str, params: Value) -> Result<()> {
        self.client
            .request(method, params, Some(self.request_timeout))
            .await
            .map(|_| ())
    }
}

impl AgentDriver for AcpDriver {
    fn initialize(&self, timeout: Duration) -> BoxFuture<'_, InitializeResponse> {
        Box::pin(handshake::initialize(&self.client, timeout))
    }

    fn authenticate<'a>(
        &'a self,
        method_id: &'a str,
        credential: Option<String>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let params = protocol::authenticate_params(method_id, credential.as_deref());
            self.call_unit(METHOD_AUTHENTICATE, params).await?;
            info!(agent = self.agent, method_id, "agent authentication succeeded");
            Ok(())
        })
    }

    fn new_session<'a>(
        &'a self,
        cwd: &'a Path,
        servers: &'a [McpServerConfig],
        timeout: Duration,
    ) -> BoxFuture<'a, NewSessionResponse> {
        Box::pin(async move {
            let params = protocol::new_session_params(&cwd.to_string_lossy(), servers);
            self.client
                .request_as(METHOD_SESSION_NEW, params, Some(timeout))
                .await
        })
    }

    fn set_mode<'a>(&'a self, session_id: &'a str, mode_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.call_unit(
            METHOD_SET_MODE,
            json!({ "sessionId": session_id, "modeId": mode_id }),
        ))
    }

    fn set_model<'a>(&'a self, session_id: &'a str, model_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.call_unit(
            METHOD_SET_MODEL,
            json!({ "sessionId": session_id, "modelId": model_id }),
        ))
    }

    fn send_prompt<'a>(
        &'a self,
        session_id: &'a str,
        blocks: Vec<ContentBlock>,
    ) -> BoxFuture<'a, PromptResponse> {
        Box::pin(async move {
            let params = protocol::prompt_params(session_id, &blocks);
            // A turn runs as long as the agent needs; only stream end aborts it.
            self.client.request_as(METHOD_PROMPT, params, None).await
        })
    }

    fn send_cancel<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(
            self.client
                .notify(METHOD_CANCEL, json!({ "sessionId": session_id })),
        )
    }

    fn respond_permission(
        &self,
        request_id: Value,
        outcome: PermissionOutcome,
    ) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.client.respond(request_id, outcome.to_result()).await })
    }

    fn terminate(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.cancel.cancel();

            let Some(mut child) = self.child.lock().await.take() else {
                debug!(agent = self.agent, "acp driver: terminate on detached agent, no-op");
                return Ok(());
            };

            match tokio::time::timeout(self.terminate_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(agent = self.agent, %status, "agent process exited");
                    Ok(())
                }
                Ok(Err(err)) => Err(AppError::Io(format!("failed to wait for agent: {err}"))),
                Err(_elapsed) => {
                    warn!(
                        agent = self.agent,
                        grace = ?self.terminate_grace,
                        "agent did not exit in time, killing"
                    );
                    child
                        .kill()
                        .await
                        .map_err(|err| AppError::Io(format!("failed to kill agent: {err}")))
                }
            }
        })
    }
}

// ── AcpLauncher ───────────────────────────────────────────────────────────────

/// Launches agents as child processes speaking ACP on stdio.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcpLauncher;

impl AgentLauncher for AcpLauncher {
    fn launch<'a>(
        &'a self,
        spec: &'a LaunchSpec,
        events: mpsc::Sender<AgentEvent>,
    ) -> BoxFuture<'a, Arc<dyn AgentDriver>> {
        Box::pin(async move {
            let connection = spawn_agent(&SpawnConfig {
                agent: spec.agent.clone(),
                command: spec.command.clone(),
                args: spec.args.clone(),
                cwd: spec.cwd.clone(),
                env: spec.env.clone(),
            })?;

            if let Some(stderr) = connection.stderr {
                // Ends on its own once the child closes stderr.
                drop(drain_stderr(spec.agent.clone(), stderr));
            }

            let driver = AcpDriver::connect(
                spec,
                connection.stdout,
                connection.stdin,
                Some(connection.child),
                events,
            );
            Ok(Arc::new(driver) as Arc<dyn AgentDriver>)
        })
    }
}
