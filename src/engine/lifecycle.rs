//! The session engine: lifecycle operations exposed to the UI or CLI.
//!
//! A [`SessionEngine`] owns at most one agent session. `start` resolves the
//! agent, launches it, starts the notification loop, performs the handshake,
//! and negotiates authentication. Protocol calls are made without holding
//! the core lock so the notification loop keeps draining while they wait.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::acp::protocol::{NewSessionResponse, PermissionOutcome, StopReason};
use crate::config::{StreamingConfig, TimeoutConfig};
use crate::driver::{AgentDriver, AgentEvent, AgentLauncher, BoxFuture, LaunchSpec};
use crate::engine::auth::{AuthNegotiator, AuthOutcome, SessionOpener};
use crate::engine::core::{SessionCore, SessionSnapshot};
use crate::engine::processor::run_notification_loop;
use crate::mcp::{resolve_servers, McpCatalog};
use crate::models::mcp::McpCapabilities;
use crate::models::message::{ContentBlock, MessageItem};
use crate::models::session::SessionState;
use crate::registry::AgentRegistry;
use crate::telemetry::{UsageEvent, UsageRecorder};
use crate::{AppError, Result};

/// Capacity of the agent event channel.
const EVENT_CAPACITY: usize = 256;

/// Reason recorded when the registry cannot resolve the agent.
pub const AGENT_NOT_CONFIGURED: &str = "Agent not configured";

/// Error returned by work that outlived its session.
const SESSION_CLOSED: &str = "the session was closed";

/// Notice appended when the user cancels a turn.
pub const STOPPED_BY_USER: &str = "Agent stopped by user";

/// Collaborators the engine depends on.
#[derive(Clone)]
pub struct EngineDeps {
    /// Agent executables, auth preferences, and credentials.
    pub registry: Arc<dyn AgentRegistry>,
    /// Process launcher.
    pub launcher: Arc<dyn AgentLauncher>,
    /// Configured MCP servers.
    pub mcp: Arc<dyn McpCatalog>,
    /// Usage counters.
    pub usage: Arc<dyn UsageRecorder>,
}

/// How a completed `send_message` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptOutcome {
    /// The agent ended the turn.
    Completed(StopReason),
    /// The agent wants the user to authenticate first.
    NeedsAuthentication,
}

struct Connection {
    epoch: u64,
    driver: Arc<dyn AgentDriver>,
    events: mpsc::Sender<AgentEvent>,
    cancel: CancellationToken,
    processor: JoinHandle<()>,
}

/// Single-session engine.
pub struct SessionEngine {
    deps: EngineDeps,
    timeouts: TimeoutConfig,
    core: Arc<Mutex<SessionCore>>,
    connection: Mutex<Option<Connection>>,
    mode_change_in_flight: AtomicBool,
    revisions: watch::Receiver<u64>,
}

impl SessionEngine {
    /// Create an idle engine.
    #[must_use]
    pub fn new(deps: EngineDeps, timeouts: TimeoutConfig, streaming: StreamingConfig) -> Self {
        let core = SessionCore::new(streaming, Arc::clone(&deps.usage));
        let revisions = core.subscribe();
        Self {
            deps,
            timeouts,
            core: Arc::new(Mutex::new(core)),
            connection: Mutex::new(None),
            mode_change_in_flight: AtomicBool::new(false),
            revisions,
        }
    }

    // ── Observation ──────────────────────────────────────────────────────────

    /// Clone the observable state.
    pub async fn snapshot(&self) -> SessionSnapshot {
        self.core.lock().await.snapshot()
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> SessionState {
        self.core.lock().await.state().clone()
    }

    /// Change counter, bumped on every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revisions.clone()
    }

    // ── Start ────────────────────────────────────────────────────────────────

    /// Launch `agent` in `working_dir` and establish a session.
    ///
    /// Returns `Ok` once the session is `Ready`, or while it waits for the
    /// user to authenticate (`needs_authentication` in the snapshot).
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidState` if a session is already active.
    /// - `AppError::Config` if the agent is not configured; state becomes
    ///   `Failed("Agent not configured")`.
    /// - Launch, handshake, or session-creation errors; state becomes
    ///   `Failed(reason)`.
    pub async fn start(&self, agent: &str, working_dir: &Path) -> Result<()> {
        let span = info_span!("session_start", agent, dir = %working_dir.display());
        self.start_inner(agent, working_dir).instrument(span).await
    }

    /// Re-run the start sequence for the last agent and directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` unless the session is `Failed`, and
    /// otherwise the same errors as [`start`](Self::start).
    pub async fn retry_start(&self) -> Result<()> {
        let (agent, dir) = {
            let core = self.core.lock().await;
            if !matches!(core.state, SessionState::Failed(_)) {
                return Err(AppError::InvalidState(
                    "retry is only possible after a failed start".into(),
                ));
            }
            match (core.agent.clone(), core.working_dir.clone()) {
                (Some(agent), Some(dir)) => (agent, dir),
                _ => return Err(AppError::InvalidState("no previous start to retry".into())),
            }
        };
        info!(agent, "retrying session start");
        self.release_connection().await;
        self.start(&agent, &dir).await
    }

    async fn start_inner(&self, agent: &str, working_dir: &Path) -> Result<()> {
        let (ticks_tx, ticks_rx) = mpsc::unbounded_channel();
        let epoch = {
            let mut core = self.core.lock().await;
            if core.state.is_active() {
                return Err(AppError::InvalidState(format!(
                    "a session is already {}",
                    state_label(&core.state)
                )));
            }
            core.begin_session(agent, working_dir.to_path_buf(), &ticks_tx);
            core.transition(SessionState::Initializing);
            core.epoch
        };
        drop(ticks_tx);

        let Some(resolved) = self.deps.registry.resolve(agent) else {
            info!(agent, "agent is not configured");
            self.fail_start(epoch, AGENT_NOT_CONFIGURED.to_owned()).await;
            return Err(AppError::Config(format!(
                "agent '{agent}' is not configured or its command is not executable"
            )));
        };

        // The loop runs before any protocol call so no early event is lost.
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        let processor = tokio::spawn(
            run_notification_loop(Arc::clone(&self.core), events_rx, ticks_rx, cancel.clone())
                .instrument(info_span!("notifications", agent)),
        );

        let spec = LaunchSpec {
            agent: agent.to_owned(),
            command: resolved.command,
            args: resolved.args,
            cwd: working_dir.to_path_buf(),
            env: resolved.env,
            request_timeout: self.timeouts.session(),
            terminate_grace: self.timeouts.terminate_grace(),
        };
        let driver = match self.deps.launcher.launch(&spec, events_tx.clone()).await {
            Ok(driver) => driver,
            Err(err) => {
                warn!(agent, error = %err, "failed to launch agent");
                cancel.cancel();
                self.fail_start(epoch, format!("Failed to launch agent: {err}")).await;
                return Err(err);
            }
        };
        {
            let core = self.core.lock().await;
            if !core.is_live(epoch) {
                drop(core);
                info!(agent, "session closed while the agent was launching");
                cancel.cancel();
                if let Err(err) = driver.terminate().await {
                    warn!(agent, error = %err, "failed to terminate agent");
                }
                if let Err(err) = processor.await {
                    debug!(error = %err, "notification loop ended abnormally");
                }
                return Err(AppError::InvalidState(SESSION_CLOSED.into()));
            }
            *self.connection.lock().await = Some(Connection {
                epoch,
                driver: Arc::clone(&driver),
                events: events_tx,
                cancel,
                processor,
            });
        }

        let init = match driver.initialize(self.timeouts.handshake()).await {
            Ok(init) => init,
            Err(err) => {
                warn!(agent, error = %err, "agent handshake failed");
                self.release_connection_of(epoch).await;
                self.fail_start(epoch, format!("Handshake failed: {err}")).await;
                return Err(err);
            }
        };
        info!(
            agent,
            auth_methods = init.auth_methods.len(),
            "agent handshake complete"
        );

        if let Err(err) = self
            .deps
            .registry
            .record_capabilities(agent, init.agent_capabilities, init.auth_methods.clone())
            .await
        {
            warn!(agent, error = %err, "failed to record agent capabilities");
        }
        {
            let Some(mut core) = self.live_core(epoch).await else {
                return Err(AppError::InvalidState(SESSION_CLOSED.into()));
            };
            core.capabilities = init.agent_capabilities;
            core.auth_methods.clone_from(&init.auth_methods);
            core.bump();
        }

        let attempt = self.attempt(&driver, agent, working_dir, epoch).await;
        let outcome = if init.auth_methods.is_empty() {
            attempt.open_session().await.map(AuthOutcome::Established)
        } else {
            let mut notices = Vec::new();
            let outcome = AuthNegotiator::new(self.deps.registry.as_ref(), agent)
                .negotiate(&attempt, &mut notices)
                .instrument(info_span!("auth", agent))
                .await;
            if let Some(mut core) = self.live_core(epoch).await {
                for notice in notices {
                    core.push_system(notice);
                }
            }
            outcome
        };

        match outcome {
            Ok(AuthOutcome::Established(session)) => self.finish_session(epoch, session).await,
            Ok(AuthOutcome::NeedsAuthentication) => {
                let Some(mut core) = self.live_core(epoch).await else {
                    return Err(AppError::InvalidState(SESSION_CLOSED.into()));
                };
                core.needs_authentication = true;
                core.bump();
                info!(agent, "waiting for the user to authenticate");
                Ok(())
            }
            Err(err) => {
                warn!(agent, error = %err, "session creation failed");
                self.release_connection_of(epoch).await;
                self.fail_start(epoch, format!("Failed to create session: {err}"))
                    .await;
                Err(err)
            }
        }
    }

    async fn fail_start(&self, epoch: u64, reason: String) {
        let Some(mut core) = self.live_core(epoch).await else {
            debug!(reason, "session closed before the start failed");
            return;
        };
        core.buffers.cancel_all();
        core.needs_authentication = false;
        core.transition(SessionState::Failed(reason));
    }

    async fn finish_session(&self, epoch: u64, session: NewSessionResponse) -> Result<()> {
        let Some(mut core) = self.live_core(epoch).await else {
            debug!(session_id = session.session_id, "session closed before it was established");
            return Err(AppError::InvalidState(SESSION_CLOSED.into()));
        };
        info!(session_id = session.session_id, "session established");
        core.session_id = Some(session.session_id);
        if let Some(modes) = session.modes {
            core.current_mode_id = Some(modes.current_mode_id);
            core.modes = modes.available_modes;
        }
        if let Some(models) = session.models {
            core.current_model_id = Some(models.current_model_id);
            core.models = models.available_models;
        }
        core.needs_authentication = false;
        core.transition(SessionState::Ready);

        let agent = core.agent.clone().unwrap_or_default();
        let dir = core
            .working_dir
            .as_deref()
            .map(|d| d.display().to_string())
            .unwrap_or_default();
        self.deps.usage.record(&agent, UsageEvent::SessionStarted);
        core.push_system(format!("Session started with {agent} in {dir}"));
        Ok(())
    }

    /// Lock the core only while `epoch` is still the live session.
    async fn live_core(&self, epoch: u64) -> Option<MutexGuard<'_, SessionCore>> {
        let core = self.core.lock().await;
        core.is_live(epoch).then_some(core)
    }

    async fn attempt(
        &self,
        driver: &Arc<dyn AgentDriver>,
        agent: &str,
        working_dir: &Path,
        epoch: u64,
    ) -> SessionAttempt {
        let capabilities = self.core.lock().await.capabilities;
        SessionAttempt {
            driver: Arc::clone(driver),
            registry: Arc::clone(&self.deps.registry),
            mcp: Arc::clone(&self.deps.mcp),
            core: Arc::clone(&self.core),
            agent: agent.to_owned(),
            working_dir: working_dir.to_path_buf(),
            epoch,
            mcp_capabilities: capabilities.mcp_capabilities,
            timeouts: self.timeouts.clone(),
        }
    }

    // ── Authentication ───────────────────────────────────────────────────────

    /// Authenticate with `method_id`, then create the session.
    ///
    /// On a `Ready` session that hit an auth-required prompt error this only
    /// re-runs the method. The method is remembered for the agent once the
    /// agent accepts it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` unless the session is waiting for
    /// authentication, or the agent's authentication or session error.
    pub async fn authenticate(&self, method_id: &str) -> Result<()> {
        if let Some(AuthTarget { driver, agent, dir, epoch }) = self.ready_needing_auth().await {
            let span = info_span!("reauthenticate", agent, method_id);
            return async {
                let attempt = self.attempt(&driver, &agent, &dir, epoch).await;
                let result = AuthNegotiator::new(self.deps.registry.as_ref(), &agent)
                    .reauthenticate(&attempt, method_id)
                    .await;
                let Some(mut core) = self.live_core(epoch).await else {
                    return Err(AppError::InvalidState(SESSION_CLOSED.into()));
                };
                match result {
                    Ok(()) => {
                        core.needs_authentication = false;
                        core.push_system(format!("Authenticated with {method_id}"));
                        Ok(())
                    }
                    Err(err) => {
                        warn!(error = %err, "re-authentication failed");
                        core.push_system(format!("Authentication failed: {err}"));
                        Err(err)
                    }
                }
            }
            .instrument(span)
            .await;
        }

        let AuthTarget { driver, agent, dir, epoch } = self.awaiting_auth().await?;
        let span = info_span!("authenticate", agent, method_id);
        async {
            let attempt = self.attempt(&driver, &agent, &dir, epoch).await;
            let result = AuthNegotiator::new(self.deps.registry.as_ref(), &agent)
                .authenticate_explicit(&attempt, method_id)
                .await;
            self.settle_auth(epoch, result).await
        }
        .instrument(span)
        .await
    }

    async fn ready_needing_auth(&self) -> Option<AuthTarget> {
        let (agent, dir, epoch) = {
            let core = self.core.lock().await;
            if core.state != SessionState::Ready || !core.needs_authentication {
                return None;
            }
            (core.agent.clone()?, core.working_dir.clone()?, core.epoch)
        };
        let driver = self.driver().await.ok()?;
        Some(AuthTarget { driver, agent, dir, epoch })
    }

    /// Create the session without authenticating.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` unless the session is waiting for
    /// authentication, or the agent's session-creation error.
    pub async fn create_session_without_auth(&self) -> Result<()> {
        let AuthTarget { driver, agent, dir, epoch } = self.awaiting_auth().await?;
        let span = info_span!("create_session_without_auth", agent);
        async {
            let attempt = self.attempt(&driver, &agent, &dir, epoch).await;
            let result = AuthNegotiator::new(self.deps.registry.as_ref(), &agent)
                .open_without_auth(&attempt)
                .await;
            self.settle_auth(epoch, result).await
        }
        .instrument(span)
        .await
    }

    async fn awaiting_auth(&self) -> Result<AuthTarget> {
        let (agent, dir, epoch) = {
            let core = self.core.lock().await;
            if core.state != SessionState::Initializing || !core.needs_authentication {
                return Err(AppError::InvalidState(
                    "the session is not waiting for authentication".into(),
                ));
            }
            match (core.agent.clone(), core.working_dir.clone()) {
                (Some(agent), Some(dir)) => (agent, dir, core.epoch),
                _ => return Err(AppError::InvalidState("no agent session is starting".into())),
            }
        };
        let driver = self.driver().await?;
        Ok(AuthTarget { driver, agent, dir, epoch })
    }

    async fn settle_auth(&self, epoch: u64, result: Result<NewSessionResponse>) -> Result<()> {
        match result {
            Ok(session) => self.finish_session(epoch, session).await,
            Err(err) => {
                warn!(error = %err, "authentication did not establish a session");
                let Some(mut core) = self.live_core(epoch).await else {
                    return Err(err);
                };
                core.push_system(format!("Authentication failed: {err}"));
                Err(err)
            }
        }
    }

    // ── Prompt turns ─────────────────────────────────────────────────────────

    /// Submit a prompt and wait for the turn to finish.
    ///
    /// Returns after every notification that preceded the prompt response
    /// has been applied and the agent message has been completed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` outside `Ready`, or the agent's
    /// error (also appended to the timeline as "Agent error: ...").
    pub async fn send_message(
        &self,
        content: &str,
        attachments: Vec<ContentBlock>,
    ) -> Result<PromptOutcome> {
        let mut blocks = Vec::with_capacity(attachments.len() + 1);
        if !content.is_empty() || attachments.is_empty() {
            blocks.push(ContentBlock::text(content));
        }
        blocks.extend(attachments);

        let (session_id, epoch) = {
            let mut core = self.core.lock().await;
            if !core.state.accepts_prompts() {
                return Err(AppError::InvalidState(format!(
                    "cannot send a message while the session is {}",
                    state_label(&core.state)
                )));
            }
            let Some(session_id) = core.session_id.clone() else {
                return Err(AppError::InvalidState("no session established".into()));
            };
            core.complete_agent_message();
            core.messages.push(MessageItem::user(blocks.clone()));
            core.iteration_id = Some(Uuid::new_v4().to_string());
            core.is_streaming = true;
            core.bump();
            if let Some(agent) = core.agent.as_deref() {
                self.deps.usage.record(agent, UsageEvent::PromptSent);
            }
            (session_id, core.epoch)
        };

        let (driver, events) = {
            let connection = self.connection.lock().await;
            let Some(connection) = connection.as_ref() else {
                return Err(AppError::InvalidState("agent is not connected".into()));
            };
            (Arc::clone(&connection.driver), connection.events.clone())
        };

        debug!(session_id, "prompt submitted");
        let result = driver.send_prompt(&session_id, blocks).await;

        // Let the loop apply everything the agent sent before its response.
        let (ack_tx, ack_rx) = oneshot::channel();
        if events.send(AgentEvent::Barrier(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
        drop(events);

        let Some(mut core) = self.live_core(epoch).await else {
            debug!(session_id, "session closed while the prompt was running");
            return Err(AppError::InvalidState(SESSION_CLOSED.into()));
        };
        core.end_turn();
        match result {
            Ok(response) => {
                debug!(session_id, stop_reason = ?response.stop_reason, "prompt turn ended");
                if let Some(notice) = stop_notice(response.stop_reason) {
                    core.push_system(notice);
                }
                Ok(PromptOutcome::Completed(response.stop_reason))
            }
            Err(err) if err.is_auth_required() => {
                info!(session_id, "agent requires authentication for this prompt");
                core.needs_authentication = true;
                core.push_system("Authentication required, please re-authenticate");
                Ok(PromptOutcome::NeedsAuthentication)
            }
            Err(err) => {
                warn!(session_id, error = %err, "prompt failed");
                core.push_system(format!("Agent error: {err}"));
                Err(err)
            }
        }
    }

    /// Stop the current turn.
    ///
    /// Local streaming state is reset and "Agent stopped by user" appended
    /// even when the cancel notification cannot be delivered.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` when no session exists.
    pub async fn cancel_current_prompt(&self) -> Result<()> {
        let (session_id, epoch) = {
            let core = self.core.lock().await;
            match &core.session_id {
                Some(id) if core.state == SessionState::Ready => (id.clone(), core.epoch),
                _ => return Err(AppError::InvalidState("no active session to cancel".into())),
            }
        };

        if let Ok(driver) = self.driver().await {
            if let Err(err) = driver.send_cancel(&session_id).await {
                warn!(session_id, error = %err, "failed to send cancel notification");
            }
        }
        self.cancel_permissions().await;

        let Some(mut core) = self.live_core(epoch).await else {
            return Err(AppError::InvalidState(SESSION_CLOSED.into()));
        };
        core.end_turn();
        core.push_system(STOPPED_BY_USER);
        info!(session_id, "prompt cancelled by user");
        Ok(())
    }

    // ── Permissions ──────────────────────────────────────────────────────────

    /// Answer a pending permission request with one of its options.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown request or option, or the
    /// transport error.
    pub async fn respond_permission(&self, request_key: &str, option_id: &str) -> Result<()> {
        let request_id = {
            let mut core = self.core.lock().await;
            let Some(index) = core.permissions.iter().position(|p| p.key == request_key) else {
                return Err(AppError::NotFound(format!(
                    "no pending permission request '{request_key}'"
                )));
            };
            if !core.permissions[index]
                .options
                .iter()
                .any(|o| o.option_id == option_id)
            {
                return Err(AppError::NotFound(format!(
                    "permission request '{request_key}' has no option '{option_id}'"
                )));
            }
            let pending = core.permissions.remove(index);
            core.bump();
            pending.request_id
        };
        info!(request_key, option_id, "answering permission request");
        self.driver()
            .await?
            .respond_permission(request_id, PermissionOutcome::Selected(option_id.to_owned()))
            .await
    }

    async fn cancel_permissions(&self) {
        let pending = {
            let mut core = self.core.lock().await;
            let pending = std::mem::take(&mut core.permissions);
            core.bump();
            pending
        };
        if pending.is_empty() {
            return;
        }
        let Ok(driver) = self.driver().await else {
            return;
        };
        for permission in pending {
            if let Err(err) = driver
                .respond_permission(permission.request_id, PermissionOutcome::Cancelled)
                .await
            {
                debug!(key = permission.key, error = %err, "failed to cancel permission request");
            }
        }
    }

    // ── Mode and model ───────────────────────────────────────────────────────

    /// Switch to mode `mode_id`. Selecting the current mode is a no-op.
    ///
    /// # Errors
    ///
    /// `AppError::InvalidState` if another change is in flight or no session
    /// exists, `AppError::NotFound` for an unadvertised mode, or the agent's
    /// error (the current mode is then left unchanged).
    pub async fn set_mode_by_id(&self, mode_id: &str) -> Result<()> {
        let _guard = InFlight::acquire(&self.mode_change_in_flight)?;
        let (session_id, epoch) = {
            let core = self.core.lock().await;
            let session_id = ready_session(&core)?;
            if core.current_mode_id.as_deref() == Some(mode_id) {
                debug!(mode_id, "mode already active");
                return Ok(());
            }
            if !core.modes.iter().any(|m| m.id == mode_id) {
                return Err(AppError::NotFound(format!("unknown mode '{mode_id}'")));
            }
            (session_id, core.epoch)
        };
        self.driver().await?.set_mode(&session_id, mode_id).await?;
        let Some(mut core) = self.live_core(epoch).await else {
            return Err(AppError::InvalidState(SESSION_CLOSED.into()));
        };
        core.current_mode_id = Some(mode_id.to_owned());
        core.bump();
        info!(session_id, mode_id, "session mode changed");
        Ok(())
    }

    /// Switch to model `model_id`. Selecting the current model is a no-op.
    ///
    /// # Errors
    ///
    /// Same as [`set_mode_by_id`](Self::set_mode_by_id).
    pub async fn set_model(&self, model_id: &str) -> Result<()> {
        let _guard = InFlight::acquire(&self.mode_change_in_flight)?;
        let (session_id, epoch) = {
            let core = self.core.lock().await;
            let session_id = ready_session(&core)?;
            if core.current_model_id.as_deref() == Some(model_id) {
                debug!(model_id, "model already active");
                return Ok(());
            }
            if !core.models.iter().any(|m| m.model_id == model_id) {
                return Err(AppError::NotFound(format!("unknown model '{model_id}'")));
            }
            (session_id, core.epoch)
        };
        self.driver().await?.set_model(&session_id, model_id).await?;
        let Some(mut core) = self.live_core(epoch).await else {
            return Err(AppError::InvalidState(SESSION_CLOSED.into()));
        };
        core.current_model_id = Some(model_id.to_owned());
        core.bump();
        info!(session_id, model_id, "session model changed");
        Ok(())
    }

    // ── Close ────────────────────────────────────────────────────────────────

    /// Tear the session down and return to `Idle`.
    ///
    /// # Errors
    ///
    /// Never fails today; termination errors are logged.
    pub async fn close(&self) -> Result<()> {
        async {
            {
                let mut core = self.core.lock().await;
                if core.state == SessionState::Idle {
                    return Ok(());
                }
                core.transition(SessionState::Closing);
            }
            self.cancel_permissions().await;
            self.release_connection().await;

            let mut core = self.core.lock().await;
            core.discard_session_data();
            core.transition(SessionState::Idle);
            info!("session closed");
            Ok(())
        }
        .instrument(info_span!("session_close"))
        .await
    }

    async fn release_connection(&self) {
        let Some(connection) = self.connection.lock().await.take() else {
            return;
        };
        self.shut_down(connection).await;
    }

    /// Release the connection only if it still belongs to `epoch`.
    async fn release_connection_of(&self, epoch: u64) {
        let connection = {
            let mut slot = self.connection.lock().await;
            if slot.as_ref().map(|c| c.epoch) != Some(epoch) {
                return;
            }
            slot.take()
        };
        if let Some(connection) = connection {
            self.shut_down(connection).await;
        }
    }

    async fn shut_down(&self, connection: Connection) {
        connection.cancel.cancel();
        self.core.lock().await.buffers.cancel_all();
        if let Err(err) = connection.driver.terminate().await {
            warn!(error = %err, "failed to terminate agent");
        }
        drop(connection.events);
        if let Err(err) = connection.processor.await {
            debug!(error = %err, "notification loop ended abnormally");
        }
    }

    async fn driver(&self) -> Result<Arc<dyn AgentDriver>> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|c| Arc::clone(&c.driver))
            .ok_or_else(|| AppError::InvalidState("agent is not connected".into()))
    }
}

/// The connection an authentication call runs against.
struct AuthTarget {
    driver: Arc<dyn AgentDriver>,
    agent: String,
    dir: PathBuf,
    epoch: u64,
}

// ── Session creation attempts ─────────────────────────────────────────────────

/// One agent connection as seen by [`AuthNegotiator`].
struct SessionAttempt {
    driver: Arc<dyn AgentDriver>,
    registry: Arc<dyn AgentRegistry>,
    mcp: Arc<dyn McpCatalog>,
    core: Arc<Mutex<SessionCore>>,
    agent: String,
    working_dir: PathBuf,
    epoch: u64,
    mcp_capabilities: McpCapabilities,
    timeouts: TimeoutConfig,
}

impl SessionOpener for SessionAttempt {
    fn open_session(&self) -> BoxFuture<'_, NewSessionResponse> {
        Box::pin(async move {
            let configured = self.mcp.servers_for(&self.agent);
            let resolved = resolve_servers(&configured, self.mcp_capabilities);
            if !resolved.notices.is_empty() {
                let mut core = self.core.lock().await;
                if core.is_live(self.epoch) {
                    for notice in &resolved.notices {
                        core.push_system(notice.clone());
                    }
                }
            }
            let timeout = resolved.session_timeout(
                self.timeouts.session(),
                self.timeouts.remote_session_floor(),
            );
            debug!(
                agent = self.agent,
                servers = resolved.servers.len(),
                timeout_secs = timeout.as_secs(),
                "creating session"
            );
            self.driver
                .new_session(&self.working_dir, &resolved.servers, timeout)
                .await
        })
    }

    fn authenticate<'a>(&'a self, method_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let credential = match self.registry.credential(&self.agent, method_id).await {
                Ok(credential) => credential,
                Err(err) => {
                    warn!(agent = self.agent, method_id, error = %err, "credential lookup failed");
                    None
                }
            };
            self.driver.authenticate(method_id, credential).await
        })
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Clears the in-flight flag on drop.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            return Err(AppError::InvalidState(
                "a mode or model change is already in progress".into(),
            ));
        }
        Ok(Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn ready_session(core: &SessionCore) -> Result<String> {
    match (&core.state, &core.session_id) {
        (SessionState::Ready, Some(id)) => Ok(id.clone()),
        _ => Err(AppError::InvalidState("no ready session".into())),
    }
}

fn state_label(state: &SessionState) -> &'static str {
    match state {
        SessionState::Idle => "idle",
        SessionState::Initializing => "initializing",
        SessionState::Ready => "ready",
        SessionState::Closing => "closing",
        SessionState::Failed(_) => "failed",
    }
}

fn stop_notice(reason: StopReason) -> Option<&'static str> {
    match reason {
        StopReason::EndTurn | StopReason::Cancelled => None,
        StopReason::MaxTokens => Some("Agent stopped: token limit reached"),
        StopReason::MaxTurnRequests => Some("Agent stopped: request limit for this turn reached"),
        StopReason::Refusal => Some("Agent refused to continue"),
        StopReason::Other => Some("Agent stopped for an unknown reason"),
    }
}
