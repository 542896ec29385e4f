//! Fire-and-forget usage counters.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

/// One countable engine event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageEvent {
    /// A session reached `Ready`.
    SessionStarted,
    /// A prompt was submitted.
    PromptSent,
    /// An agent message completed.
    AgentMessage,
    /// A new tool call was registered.
    ToolCall,
}

/// Sink for usage events. Implementations must not block or fail.
pub trait UsageRecorder: Send + Sync {
    /// Count one event.
    fn record(&self, agent: &str, event: UsageEvent);
}

/// Point-in-time copy of [`UsageCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    /// Sessions started.
    pub session_starts: u64,
    /// Prompts sent.
    pub prompts: u64,
    /// Agent messages completed.
    pub agent_messages: u64,
    /// Tool calls registered.
    pub tool_calls: u64,
}

/// In-process atomic counters.
#[derive(Debug, Default)]
pub struct UsageCounters {
    session_starts: AtomicU64,
    prompts: AtomicU64,
    agent_messages: AtomicU64,
    tool_calls: AtomicU64,
}

impl UsageCounters {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read all counters.
    #[must_use]
    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            session_starts: self.session_starts.load(Ordering::Relaxed),
            prompts: self.prompts.load(Ordering::Relaxed),
            agent_messages: self.agent_messages.load(Ordering::Relaxed),
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
        }
    }
}

impl UsageRecorder for UsageCounters {
    fn record(&self, agent: &str, event: UsageEvent) {
        let counter = match event {
            UsageEvent::SessionStarted => &self.session_starts,
            UsageEvent::PromptSent => &self.prompts,
            UsageEvent::AgentMessage => &self.agent_messages,
            UsageEvent::ToolCall => &self.tool_calls,
        };
        let total = counter.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(agent, ?event, total, "usage recorded");
    }
}
