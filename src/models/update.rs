//! Decoded `session/update` payloads.

use serde::{Deserialize, Serialize};

use super::message::ContentBlock;
use super::session::{AvailableCommand, PlanEntry};
use super::tool_call::{ToolCall, ToolCallUpdate};

/// A selectable session configuration option advertised by the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOption {
    /// Option identifier.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Currently selected value, kept opaque.
    #[serde(default)]
    pub current_value: serde_json::Value,
    /// Remaining option fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One session update, in the order it arrived on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// Streamed agent response text or other content.
    AgentMessageChunk(ContentBlock),
    /// Streamed agent reasoning.
    AgentThoughtChunk(ContentBlock),
    /// Replayed user content.
    UserMessageChunk(ContentBlock),
    /// A new tool call; `meta` carries vendor metadata used for Task detection.
    ToolCall {
        /// The announced call.
        call: ToolCall,
        /// Raw `_meta` object, if any.
        meta: Option<serde_json::Value>,
    },
    /// Partial update of a tool call.
    ToolCallUpdate(ToolCallUpdate),
    /// Full replacement of the execution plan.
    Plan(Vec<PlanEntry>),
    /// Replacement list of slash commands.
    AvailableCommands(Vec<AvailableCommand>),
    /// The agent switched mode.
    CurrentMode(String),
    /// Replacement list of config options.
    ConfigOptions(Vec<ConfigOption>),
}

impl SessionUpdate {
    /// Wire discriminator of this update, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AgentMessageChunk(_) => "agent_message_chunk",
            Self::AgentThoughtChunk(_) => "agent_thought_chunk",
            Self::UserMessageChunk(_) => "user_message_chunk",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolCallUpdate(_) => "tool_call_update",
            Self::Plan(_) => "plan",
            Self::AvailableCommands(_) => "available_commands_update",
            Self::CurrentMode(_) => "current_mode_update",
            Self::ConfigOptions(_) => "config_option_update",
        }
    }
}
