//! The single serialized owner of all session state.
//!
//! Everything here is mutated only while holding the engine's
//! `Mutex<SessionCore>`: the lifecycle state, the message timeline, the
//! tool call store, the debounce buffers, the open-subagent set, and the
//! out-of-order update buffers. Observers get cloned [`SessionSnapshot`]s
//! and a `watch` revision counter bumped on every change.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::acp::protocol::{AgentCapabilities, PermissionOption};
use crate::config::StreamingConfig;
use crate::engine::coalescer::{FlushKey, FlushTick, StreamingCoalescer};
use crate::engine::subagent::SubagentGrouper;
use crate::engine::tool_call_store::ToolCallStore;
use crate::models::auth::AuthMethod;
use crate::models::message::{ContentBlock, MessageItem};
use crate::models::session::{AvailableCommand, ModelInfo, PlanEntry, SessionMode, SessionState};
use crate::models::tool_call::{ToolCall, ToolCallContent, ToolCallUpdate};
use crate::models::update::ConfigOption;
use crate::telemetry::UsageRecorder;

/// A permission request awaiting the user's choice.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPermission {
    /// Display key used to answer it (`respond_permission`).
    pub key: String,
    /// Raw JSON-RPC id.
    pub request_id: Value,
    /// Tool call awaiting approval.
    pub tool_call: ToolCallUpdate,
    /// Offered choices.
    pub options: Vec<PermissionOption>,
}

/// Read-only copy of the observable session state.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    /// Lifecycle state.
    pub state: SessionState,
    /// Agent of the current or last start.
    pub agent: Option<String>,
    /// Working directory of the current or last start.
    pub working_dir: Option<PathBuf>,
    /// Agent-assigned session id once established.
    pub session_id: Option<String>,
    /// Message timeline.
    pub messages: Vec<MessageItem>,
    /// Tool calls in creation order.
    pub tool_calls: Vec<ToolCall>,
    /// Thought text of the current turn.
    pub thought: Option<String>,
    /// Execution plan.
    pub plan: Vec<PlanEntry>,
    /// Selectable modes.
    pub modes: Vec<SessionMode>,
    /// Active mode.
    pub current_mode_id: Option<String>,
    /// Selectable models.
    pub models: Vec<ModelInfo>,
    /// Active model.
    pub current_model_id: Option<String>,
    /// Slash commands the agent accepts.
    pub commands: Vec<AvailableCommand>,
    /// Session config options.
    pub config_options: Vec<ConfigOption>,
    /// Auth methods advertised at handshake.
    pub auth_methods: Vec<AuthMethod>,
    /// The user must pick an auth method before the session can proceed.
    pub needs_authentication: bool,
    /// A prompt turn is in progress.
    pub is_streaming: bool,
    /// Unanswered permission requests.
    pub permissions: Vec<PendingPermission>,
}

impl SessionSnapshot {
    /// Look up a tool call by id.
    #[must_use]
    pub fn tool_call(&self, id: &str) -> Option<&ToolCall> {
        self.tool_calls.iter().find(|c| c.tool_call_id == id)
    }

    /// The streaming agent message, if any.
    #[must_use]
    pub fn open_agent_message(&self) -> Option<&MessageItem> {
        self.messages.iter().find(|m| m.is_open_agent_message())
    }
}

/// The three debounce buffers of a session.
#[derive(Debug)]
pub(crate) struct Buffers {
    pub(crate) thought: StreamingCoalescer<FlushKey, String>,
    pub(crate) message: StreamingCoalescer<FlushKey, ContentBlock>,
    pub(crate) tool_content: StreamingCoalescer<FlushKey, ToolCallContent>,
}

impl Buffers {
    pub(crate) fn new(
        streaming: &StreamingConfig,
        ticks: &mpsc::UnboundedSender<FlushTick<FlushKey>>,
    ) -> Self {
        Self {
            thought: StreamingCoalescer::new(
                Duration::from_millis(streaming.thought_flush_ms),
                ticks.clone(),
            ),
            message: StreamingCoalescer::new(
                Duration::from_millis(streaming.message_flush_ms),
                ticks.clone(),
            ),
            tool_content: StreamingCoalescer::new(
                Duration::from_millis(streaming.tool_content_flush_ms),
                ticks.clone(),
            ),
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        self.thought.cancel_all();
        self.message.cancel_all();
        self.tool_content.cancel_all();
    }
}

/// Mutable session state. See the module docs for the locking discipline.
pub struct SessionCore {
    pub(crate) state: SessionState,
    pub(crate) agent: Option<String>,
    pub(crate) working_dir: Option<PathBuf>,
    pub(crate) session_id: Option<String>,
    pub(crate) messages: Vec<MessageItem>,
    pub(crate) tool_calls: ToolCallStore,
    pub(crate) thought: Option<String>,
    pub(crate) plan: Vec<PlanEntry>,
    pub(crate) modes: Vec<SessionMode>,
    pub(crate) current_mode_id: Option<String>,
    pub(crate) models: Vec<ModelInfo>,
    pub(crate) current_model_id: Option<String>,
    pub(crate) commands: Vec<AvailableCommand>,
    pub(crate) config_options: Vec<ConfigOption>,
    pub(crate) auth_methods: Vec<AuthMethod>,
    pub(crate) capabilities: AgentCapabilities,
    pub(crate) needs_authentication: bool,
    pub(crate) is_streaming: bool,
    pub(crate) iteration_id: Option<String>,
    pub(crate) permissions: Vec<PendingPermission>,
    pub(crate) subagents: SubagentGrouper,
    pub(crate) pending_updates: HashMap<String, VecDeque<ToolCallUpdate>>,
    pub(crate) buffers: Buffers,
    pub(crate) streaming: StreamingConfig,
    pub(crate) usage: Arc<dyn UsageRecorder>,
    /// Incremented whenever session data is discarded, so continuations of
    /// an earlier session can tell they are stale.
    pub(crate) epoch: u64,
    revision: watch::Sender<u64>,
}

impl SessionCore {
    /// Create an idle core.
    #[must_use]
    pub fn new(streaming: StreamingConfig, usage: Arc<dyn UsageRecorder>) -> Self {
        // Detached until the first session installs a live tick channel.
        let (ticks, _) = mpsc::unbounded_channel();
        let (revision, _) = watch::channel(0);
        Self {
            state: SessionState::Idle,
            agent: None,
            working_dir: None,
            session_id: None,
            messages: Vec::new(),
            tool_calls: ToolCallStore::new(streaming.tool_call_retention),
            thought: None,
            plan: Vec::new(),
            modes: Vec::new(),
            current_mode_id: None,
            models: Vec::new(),
            current_model_id: None,
            commands: Vec::new(),
            config_options: Vec::new(),
            auth_methods: Vec::new(),
            capabilities: AgentCapabilities::default(),
            needs_authentication: false,
            is_streaming: false,
            iteration_id: None,
            permissions: Vec::new(),
            subagents: SubagentGrouper::new(),
            pending_updates: HashMap::new(),
            buffers: Buffers::new(&streaming, &ticks),
            streaming,
            usage,
            epoch: 0,
            revision,
        }
    }

    /// Reset per-session state for a fresh start and install the tick channel
    /// of the new notification loop.
    pub fn begin_session(
        &mut self,
        agent: &str,
        working_dir: PathBuf,
        ticks: &mpsc::UnboundedSender<FlushTick<FlushKey>>,
    ) {
        self.discard_session_data();
        self.buffers = Buffers::new(&self.streaming, ticks);
        self.agent = Some(agent.to_owned());
        self.working_dir = Some(working_dir);
        self.bump();
    }

    /// Cancel every timer, then drop buffers and per-session collections.
    pub(crate) fn discard_session_data(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        self.buffers.cancel_all();
        self.session_id = None;
        self.messages.clear();
        self.tool_calls.clear();
        self.thought = None;
        self.plan.clear();
        self.modes.clear();
        self.current_mode_id = None;
        self.models.clear();
        self.current_model_id = None;
        self.commands.clear();
        self.config_options.clear();
        self.auth_methods.clear();
        self.capabilities = AgentCapabilities::default();
        self.needs_authentication = false;
        self.is_streaming = false;
        self.iteration_id = None;
        self.permissions.clear();
        self.subagents.clear();
        self.pending_updates.clear();
    }

    /// Whether `epoch` is still the running session and no close has begun.
    pub(crate) fn is_live(&self, epoch: u64) -> bool {
        self.epoch == epoch && !matches!(self.state, SessionState::Idle | SessionState::Closing)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Move to `next`, logging transitions the state machine does not expect.
    pub(crate) fn transition(&mut self, next: SessionState) {
        if !self.state.can_transition_to(&next) {
            tracing::warn!(from = ?self.state, to = ?next, "unexpected session state transition");
        }
        tracing::debug!(from = ?self.state, to = ?next, "session state transition");
        self.state = next;
        self.bump();
    }

    /// Append a system notice to the timeline.
    pub(crate) fn push_system(&mut self, text: impl Into<String>) {
        self.messages.push(MessageItem::system(text));
        self.bump();
    }

    /// Subscribe to the change counter.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Signal observers that state changed.
    pub(crate) fn bump(&self) {
        self.revision.send_modify(|r| *r = r.wrapping_add(1));
    }

    /// Clone the observable state.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state.clone(),
            agent: self.agent.clone(),
            working_dir: self.working_dir.clone(),
            session_id: self.session_id.clone(),
            messages: self.messages.clone(),
            tool_calls: self.tool_calls.iter().cloned().collect(),
            thought: self.thought.clone(),
            plan: self.plan.clone(),
            modes: self.modes.clone(),
            current_mode_id: self.current_mode_id.clone(),
            models: self.models.clone(),
            current_model_id: self.current_model_id.clone(),
            commands: self.commands.clone(),
            config_options: self.config_options.clone(),
            auth_methods: self.auth_methods.clone(),
            needs_authentication: self.needs_authentication,
            is_streaming: self.is_streaming,
            permissions: self.permissions.clone(),
        }
    }
}
