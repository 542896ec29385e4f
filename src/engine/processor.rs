//! Applies agent events to [`SessionCore`] in arrival order.
//!
//! [`run_notification_loop`] is the only consumer of the event channel and
//! the flush-tick channel. Each event is applied to completion under the
//! core lock before the next is read, so the order the agent emitted is the
//! order the timeline sees.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::AgentEvent;
use crate::engine::coalescer::{FlushKey, FlushTick};
use crate::engine::core::{PendingPermission, SessionCore};
use crate::engine::subagent::is_task_call;
use crate::models::message::{ContentBlock, MessageItem, MessageRole};
use crate::models::session::SessionState;
use crate::models::tool_call::{ToolCall, ToolCallUpdate};
use crate::models::update::SessionUpdate;
use crate::telemetry::UsageEvent;

/// Drain agent events and flush ticks into `core` until cancelled or until
/// every event sender is gone.
pub async fn run_notification_loop(
    core: Arc<Mutex<SessionCore>>,
    mut events: mpsc::Receiver<AgentEvent>,
    mut ticks: mpsc::UnboundedReceiver<FlushTick<FlushKey>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("notification loop cancelled");
                break;
            }
            Some(tick) = ticks.recv() => {
                core.lock().await.on_flush_tick(&tick);
            }
            event = events.recv() => {
                let Some(event) = event else {
                    debug!("event channel closed, notification loop exiting");
                    break;
                };
                core.lock().await.apply_event(event);
            }
        }
    }
}

impl SessionCore {
    // ── Event dispatch ───────────────────────────────────────────────────────

    /// Apply one agent event.
    pub fn apply_event(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::SessionUpdate { session_id, update } => {
                if self
                    .session_id
                    .as_deref()
                    .is_some_and(|current| current != session_id)
                {
                    debug!(session_id, "dropping update for a different session");
                    return;
                }
                self.apply_update(*update);
            }
            AgentEvent::PermissionRequested {
                request_id,
                request,
            } => {
                let request = *request;
                let key = match &request_id {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                info!(
                    key,
                    tool_call_id = request.tool_call.tool_call_id,
                    "permission requested"
                );
                self.permissions.push(PendingPermission {
                    key,
                    request_id,
                    tool_call: request.tool_call,
                    options: request.options,
                });
                self.bump();
            }
            AgentEvent::StreamClosed { reason } => self.handle_stream_end(&reason),
            AgentEvent::Barrier(ack) => {
                // The waiter may have given up.
                let _ = ack.send(());
            }
        }
    }

    /// Apply one decoded `session/update`.
    pub fn apply_update(&mut self, update: SessionUpdate) {
        debug!(kind = update.kind(), "applying session update");
        match update {
            SessionUpdate::AgentMessageChunk(block) => self.on_agent_chunk(block),
            SessionUpdate::AgentThoughtChunk(block) => match block {
                ContentBlock::Text { text } => self.buffers.thought.push(FlushKey::Thought, text),
                other => debug!(?other, "ignoring non-text thought chunk"),
            },
            SessionUpdate::UserMessageChunk(block) => self.on_user_chunk(block),
            SessionUpdate::ToolCall { call, meta } => self.on_tool_call(call, meta.as_ref()),
            SessionUpdate::ToolCallUpdate(update) => self.on_tool_call_update(update),
            SessionUpdate::Plan(entries) => {
                if entries != self.plan {
                    self.plan = entries;
                }
            }
            SessionUpdate::AvailableCommands(commands) => self.commands = commands,
            SessionUpdate::CurrentMode(mode_id) => self.current_mode_id = Some(mode_id),
            SessionUpdate::ConfigOptions(options) => self.config_options = options,
        }
        self.bump();
    }

    // ── Messages ─────────────────────────────────────────────────────────────

    fn on_agent_chunk(&mut self, block: ContentBlock) {
        // Response text supersedes the thought of the same turn.
        self.buffers.thought.discard(&FlushKey::Thought);
        self.thought = None;

        if !self.messages.iter().any(MessageItem::is_open_agent_message) {
            self.messages.push(MessageItem::agent_streaming());
        }
        self.buffers.message.push(FlushKey::Message, block);
    }

    fn on_user_chunk(&mut self, block: ContentBlock) {
        match self.messages.last_mut() {
            Some(last) if last.role == MessageRole::User => last.append_blocks(vec![block]),
            _ => self.messages.push(MessageItem::user(vec![block])),
        }
    }

    fn open_agent_message_mut(&mut self) -> Option<&mut MessageItem> {
        self.messages
            .iter_mut()
            .rev()
            .find(|m| m.is_open_agent_message())
    }

    fn append_to_agent_message(&mut self, blocks: Vec<ContentBlock>) {
        if blocks.is_empty() {
            return;
        }
        if let Some(message) = self.open_agent_message_mut() {
            message.append_blocks(blocks);
        } else {
            let mut message = MessageItem::agent_streaming();
            message.append_blocks(blocks);
            self.messages.push(message);
        }
    }

    /// Flush buffered agent text and mark the open agent message complete.
    pub(crate) fn complete_agent_message(&mut self) {
        let blocks = self.buffers.message.force_flush(&FlushKey::Message);
        self.append_to_agent_message(blocks);
        let Some(message) = self.open_agent_message_mut() else {
            return;
        };
        message.complete();
        if let Some(agent) = self.agent.as_deref() {
            self.usage.record(agent, UsageEvent::AgentMessage);
        }
        self.bump();
    }

    // ── Tool calls ───────────────────────────────────────────────────────────

    fn on_tool_call(&mut self, mut call: ToolCall, meta: Option<&serde_json::Value>) {
        self.complete_agent_message();

        let id = call.tool_call_id.clone();
        let is_task = is_task_call(meta);
        let terminal = call.status.is_terminal();

        let parent = self.subagents.parent_for(is_task);
        if is_task && !terminal {
            self.subagents.open(&id);
        }
        call.parent_tool_call_id = parent;
        call.iteration_id.clone_from(&self.iteration_id);

        let outcome = self.tool_calls.upsert(call);
        if outcome.inserted {
            if let Some(agent) = self.agent.as_deref() {
                self.usage.record(agent, UsageEvent::ToolCall);
            }
        }
        for evicted in &outcome.evicted {
            debug!(tool_call_id = evicted, "tool call evicted from store");
            self.forget_tool_call(evicted);
        }

        if let Some(queued) = self.pending_updates.remove(&id) {
            debug!(tool_call_id = id, count = queued.len(), "replaying buffered tool call updates");
            for update in queued {
                self.apply_known_update(update);
            }
        }

        if terminal {
            self.flush_tool_content(&id);
            self.subagents.close(&id);
        }
    }

    fn on_tool_call_update(&mut self, update: ToolCallUpdate) {
        let id = update.tool_call_id.clone();
        if !self.tool_calls.contains(&id) {
            let Some(mut placeholder) = ToolCall::placeholder_from(&update) else {
                self.buffer_update(update);
                return;
            };
            debug!(tool_call_id = id, "creating tool call from update");
            let is_task = is_task_call(update.meta.as_ref());
            placeholder.parent_tool_call_id = self.subagents.parent_for(is_task);
            if is_task && !placeholder.status.is_terminal() {
                self.subagents.open(&id);
            }
            placeholder
                .iteration_id
                .clone_from(&self.iteration_id);
            let outcome = self.tool_calls.upsert(placeholder);
            for evicted in &outcome.evicted {
                self.forget_tool_call(evicted);
            }
        }
        self.apply_known_update(update);
    }

    fn buffer_update(&mut self, update: ToolCallUpdate) {
        let limit = self.streaming.pending_update_limit.max(1);
        let queue = self
            .pending_updates
            .entry(update.tool_call_id.clone())
            .or_insert_with(VecDeque::new);
        if queue.len() >= limit {
            queue.pop_front();
            warn!(
                tool_call_id = update.tool_call_id,
                limit, "pending update buffer full, dropping oldest update"
            );
        }
        debug!(tool_call_id = update.tool_call_id, "buffering update for unknown tool call");
        queue.push_back(update);
    }

    fn apply_known_update(&mut self, mut update: ToolCallUpdate) {
        let id = update.tool_call_id.clone();
        let Some(call) = self.tool_calls.get_mut(&id) else {
            return;
        };
        call.apply_fields(&update);
        let terminal = call.status.is_terminal();

        if let Some(content) = update.content.take() {
            let key = FlushKey::ToolContent(id.clone());
            for fragment in content {
                self.buffers.tool_content.push(key.clone(), fragment);
            }
        }

        if terminal {
            self.flush_tool_content(&id);
            if self.subagents.close(&id) {
                debug!(tool_call_id = id, "subagent task finished");
            }
        }
    }

    fn flush_tool_content(&mut self, id: &str) {
        let fragments = self
            .buffers
            .tool_content
            .force_flush(&FlushKey::ToolContent(id.to_owned()));
        if !fragments.is_empty() {
            self.tool_calls.append_content(id, fragments);
        }
    }

    fn flush_all_tool_content(&mut self) {
        let keys: Vec<FlushKey> = self.buffers.tool_content.pending_keys().cloned().collect();
        for key in keys {
            if let FlushKey::ToolContent(id) = key {
                self.flush_tool_content(&id);
            }
        }
    }

    fn forget_tool_call(&mut self, id: &str) {
        self.buffers
            .tool_content
            .discard(&FlushKey::ToolContent(id.to_owned()));
        self.pending_updates.remove(id);
        self.subagents.close(id);
    }

    // ── Flush ticks ──────────────────────────────────────────────────────────

    /// Drain the buffer whose debounce timer fired. Stale ticks are ignored.
    pub fn on_flush_tick(&mut self, tick: &FlushTick<FlushKey>) {
        match &tick.key {
            FlushKey::Thought => {
                let Some(parts) = self.buffers.thought.on_tick(tick) else {
                    return;
                };
                self.thought
                    .get_or_insert_with(String::new)
                    .push_str(&parts.concat());
            }
            FlushKey::Message => {
                let Some(blocks) = self.buffers.message.on_tick(tick) else {
                    return;
                };
                self.append_to_agent_message(blocks);
            }
            FlushKey::ToolContent(id) => {
                let Some(fragments) = self.buffers.tool_content.on_tick(tick) else {
                    return;
                };
                if !self.tool_calls.append_content(id, fragments) {
                    debug!(tool_call_id = id, "dropping content for evicted tool call");
                }
            }
        }
        self.bump();
    }

    // ── Turn boundaries ──────────────────────────────────────────────────────

    /// End the current turn: flush pending output, complete the agent
    /// message, and clear the thought.
    pub fn end_turn(&mut self) {
        self.complete_agent_message();
        self.flush_all_tool_content();
        self.buffers.thought.discard(&FlushKey::Thought);
        self.thought = None;
        self.is_streaming = false;
        self.bump();
    }

    /// The agent's output stream ended.
    pub fn handle_stream_end(&mut self, reason: &str) {
        info!(reason, "agent stream ended");
        self.end_turn();
        self.permissions.clear();
        // No call is in flight to fail a start that waits for the user.
        let awaiting_auth = self.state == SessionState::Initializing && self.needs_authentication;
        if self.state == SessionState::Ready || awaiting_auth {
            self.needs_authentication = false;
            self.transition(SessionState::Failed(format!(
                "Agent connection closed: {reason}"
            )));
            self.push_system(format!("Agent connection closed ({reason})"));
        }
    }

    /// Fragments buffered for a tool call but not flushed yet.
    #[must_use]
    pub fn has_pending_tool_content(&self, id: &str) -> bool {
        self.buffers
            .tool_content
            .has_pending(&FlushKey::ToolContent(id.to_owned()))
    }

    /// Updates waiting for their tool call's defining event.
    #[must_use]
    pub fn buffered_update_count(&self, id: &str) -> usize {
        self.pending_updates.get(id).map_or(0, VecDeque::len)
    }
}

