//! Session state machine and negotiated session metadata.

use serde::{Deserialize, Serialize};

/// Lifecycle state of the single engine-owned session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum SessionState {
    /// No agent process, no session.
    #[default]
    Idle,
    /// Launch, handshake, authentication, or session creation in progress.
    Initializing,
    /// Session established; prompts may be submitted.
    Ready,
    /// Teardown in progress.
    Closing,
    /// Start sequence failed; recoverable through an explicit retry.
    Failed(String),
}

impl SessionState {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: &Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle | Self::Failed(_), Self::Initializing)
                | (
                    Self::Initializing,
                    Self::Ready | Self::Failed(_) | Self::Closing
                )
                | (Self::Ready, Self::Closing | Self::Failed(_))
                | (Self::Failed(_), Self::Closing | Self::Idle)
                | (Self::Closing, Self::Idle)
        )
    }

    /// Whether a start request must be rejected in this state.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Initializing | Self::Ready | Self::Closing)
    }

    /// Whether prompt submission is valid.
    #[must_use]
    pub fn accepts_prompts(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// A session mode advertised by the agent (e.g. `default`, `plan`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMode {
    /// Mode identifier used with `session/set_mode`.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A model advertised by the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    /// Model identifier used with `session/set_model`.
    pub model_id: String,
    /// Display name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A slash command the agent currently accepts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AvailableCommand {
    /// Command name without the leading slash.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Hint for the free-form argument, if the command takes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_hint: Option<String>,
}

/// Status of a single plan entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanEntryStatus {
    /// Not started.
    Pending,
    /// Being worked on.
    InProgress,
    /// Done.
    Completed,
}

/// One step of the agent's execution plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanEntry {
    /// Step description.
    pub content: String,
    /// Priority as reported by the agent (`high`, `medium`, `low`).
    #[serde(default)]
    pub priority: String,
    /// Current status.
    pub status: PlanEntryStatus,
}
