//! ACP wire types and `session/update` decoding.
//!
//! Only the subset of the Agent Client Protocol this host speaks is modelled.
//! Outbound params are built with [`serde_json::json!`]; inbound payloads
//! are deserialised into the structs below and mapped onto
//! [`crate::models`] types.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::models::auth::AuthMethod;
use crate::models::mcp::{McpCapabilities, McpServerConfig};
use crate::models::message::ContentBlock;
use crate::models::session::{AvailableCommand, ModelInfo, PlanEntry, SessionMode};
use crate::models::tool_call::{
    ToolCall, ToolCallContent, ToolCallLocation, ToolCallStatus, ToolCallUpdate, ToolKind,
};
use crate::models::update::{ConfigOption, SessionUpdate};
use crate::{AppError, Result};

/// ACP protocol version this host implements.
pub const PROTOCOL_VERSION: u64 = 1;

// ── Method names ──────────────────────────────────────────────────────────────

/// `initialize` request.
pub const METHOD_INITIALIZE: &str = "initialize";
/// `authenticate` request.
pub const METHOD_AUTHENTICATE: &str = "authenticate";
/// `session/new` request.
pub const METHOD_SESSION_NEW: &str = "session/new";
/// `session/set_mode` request.
pub const METHOD_SET_MODE: &str = "session/set_mode";
/// `session/set_model` request.
pub const METHOD_SET_MODEL: &str = "session/set_model";
/// `session/prompt` request.
pub const METHOD_PROMPT: &str = "session/prompt";
/// `session/cancel` notification.
pub const METHOD_CANCEL: &str = "session/cancel";
/// `session/update` notification (agent → client).
pub const METHOD_SESSION_UPDATE: &str = "session/update";
/// `session/request_permission` request (agent → client).
pub const METHOD_REQUEST_PERMISSION: &str = "session/request_permission";

/// JSON-RPC "method not found" error code.
pub const METHOD_NOT_FOUND_CODE: i64 = -32601;

// ── Initialize ────────────────────────────────────────────────────────────────

/// Prompt content types the agent accepts beyond plain text.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PromptCapabilities {
    /// Image blocks.
    #[serde(default)]
    pub image: bool,
    /// Audio blocks.
    #[serde(default)]
    pub audio: bool,
    /// Embedded resource blocks.
    #[serde(default)]
    pub embedded_context: bool,
}

/// Capabilities advertised by the agent in its `initialize` response.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    /// Agent supports `session/load`.
    #[serde(default)]
    pub load_session: bool,
    /// Accepted prompt content.
    #[serde(default)]
    pub prompt_capabilities: PromptCapabilities,
    /// Accepted MCP transports.
    #[serde(default)]
    pub mcp_capabilities: McpCapabilities,
}

/// Result of `initialize`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    /// Version the agent settled on.
    pub protocol_version: u64,
    /// Advertised capabilities.
    #[serde(default)]
    pub agent_capabilities: AgentCapabilities,
    /// Authentication methods; empty when none are needed.
    #[serde(default)]
    pub auth_methods: Vec<AuthMethod>,
}

// ── Session creation ──────────────────────────────────────────────────────────

/// Mode list returned by `session/new`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionModeState {
    /// Active mode.
    pub current_mode_id: String,
    /// Selectable modes.
    #[serde(default)]
    pub available_modes: Vec<SessionMode>,
}

/// Model list returned by `session/new`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionModelState {
    /// Active model.
    pub current_model_id: String,
    /// Selectable models.
    #[serde(default)]
    pub available_models: Vec<ModelInfo>,
}

/// Result of `session/new`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResponse {
    /// Agent-assigned session identifier.
    pub session_id: String,
    /// Modes, if the agent supports them.
    #[serde(default)]
    pub modes: Option<SessionModeState>,
    /// Models, if the agent supports selecting one.
    #[serde(default)]
    pub models: Option<SessionModelState>,
}

// ── Prompt turn ───────────────────────────────────────────────────────────────

/// Why the agent ended a prompt turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Turn finished normally.
    EndTurn,
    /// Token limit reached.
    MaxTokens,
    /// Model request limit for the turn reached.
    MaxTurnRequests,
    /// The agent refused to continue.
    Refusal,
    /// The turn was cancelled by the client.
    Cancelled,
    /// A reason this host does not know.
    #[serde(other)]
    Other,
}

/// Result of `session/prompt`.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PromptResponse {
    /// Why the turn ended.
    pub stop_reason: StopReason,
}

// ── Permission requests ───────────────────────────────────────────────────────

/// One choice offered in a permission request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    /// Identifier returned in the outcome.
    pub option_id: String,
    /// Display label.
    pub name: String,
    /// `allow_once`, `allow_always`, `reject_once` or `reject_always`.
    pub kind: String,
}

/// Params of an inbound `session/request_permission` request.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequestParams {
    /// Session the request belongs to.
    pub session_id: String,
    /// The tool call awaiting approval.
    pub tool_call: ToolCallUpdate,
    /// Offered choices.
    #[serde(default)]
    pub options: Vec<PermissionOption>,
}

/// Answer to a permission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionOutcome {
    /// The prompt turn was cancelled before a choice was made.
    Cancelled,
    /// The user picked an option.
    Selected(String),
}

impl PermissionOutcome {
    /// JSON-RPC result body.
    #[must_use]
    pub fn to_result(&self) -> Value {
        match self {
            Self::Cancelled => json!({ "outcome": { "outcome": "cancelled" } }),
            Self::Selected(option_id) => {
                json!({ "outcome": { "outcome": "selected", "optionId": option_id } })
            }
        }
    }
}

// ── JSON-RPC errors ───────────────────────────────────────────────────────────

/// JSON-RPC error object.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RpcErrorObject {
    /// Error code.
    pub code: i64,
    /// Short message.
    #[serde(default)]
    pub message: String,
    /// Optional details.
    #[serde(default)]
    pub data: Option<Value>,
}

impl From<RpcErrorObject> for AppError {
    fn from(err: RpcErrorObject) -> Self {
        let message = match err.data {
            Some(Value::String(detail)) if !detail.is_empty() => detail,
            _ => err.message,
        };
        AppError::Rpc {
            code: err.code,
            message,
        }
    }
}

// ── Outbound params ───────────────────────────────────────────────────────────

/// Params for `initialize`. The host offers no file-system or terminal backend.
#[must_use]
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientCapabilities": {
            "fs": { "readTextFile": false, "writeTextFile": false },
            "terminal": false
        },
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

/// Params for `authenticate`.
#[must_use]
pub fn authenticate_params(method_id: &str, credential: Option<&str>) -> Value {
    let mut params = json!({ "methodId": method_id });
    if let Some(credential) = credential {
        params["_meta"] = json!({ "credential": credential });
    }
    params
}

/// Params for `session/new`.
#[must_use]
pub fn new_session_params(cwd: &str, servers: &[McpServerConfig]) -> Value {
    let servers: Vec<Value> = servers.iter().map(mcp_server_to_wire).collect();
    json!({ "cwd": cwd, "mcpServers": servers })
}

/// Params for `session/prompt`.
#[must_use]
pub fn prompt_params(session_id: &str, blocks: &[ContentBlock]) -> Value {
    json!({ "sessionId": session_id, "prompt": blocks })
}

/// Encode one MCP server the way `session/new` expects it.
///
/// Stdio servers carry no `type` field; env and headers are name/value lists.
#[must_use]
pub fn mcp_server_to_wire(server: &McpServerConfig) -> Value {
    fn pairs(map: &std::collections::BTreeMap<String, String>) -> Vec<Value> {
        map.iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect()
    }

    match server {
        McpServerConfig::Stdio {
            name,
            command,
            args,
            env,
        } => json!({ "name": name, "command": command, "args": args, "env": pairs(env) }),
        McpServerConfig::Http { name, url, headers } => {
            json!({ "type": "http", "name": name, "url": url, "headers": pairs(headers) })
        }
        McpServerConfig::Sse { name, url, headers } => {
            json!({ "type": "sse", "name": name, "url": url, "headers": pairs(headers) })
        }
    }
}

// ── session/update decoding ───────────────────────────────────────────────────

/// A decoded `session/update` notification.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionNotification {
    /// Session the update belongs to.
    pub session_id: String,
    /// The update itself.
    pub update: SessionUpdate,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionNotificationWire {
    session_id: String,
    update: UpdateWire,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallWire {
    tool_call_id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    kind: Option<ToolKind>,
    #[serde(default)]
    status: ToolCallStatus,
    #[serde(default)]
    content: Vec<ToolCallContent>,
    #[serde(default)]
    locations: Vec<ToolCallLocation>,
    #[serde(default)]
    raw_input: Option<Value>,
    #[serde(default)]
    raw_output: Option<Value>,
    #[serde(default, rename = "_meta")]
    meta: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
enum UpdateWire {
    AgentMessageChunk {
        content: ContentBlock,
    },
    AgentThoughtChunk {
        content: ContentBlock,
    },
    UserMessageChunk {
        content: ContentBlock,
    },
    ToolCall(ToolCallWire),
    ToolCallUpdate(ToolCallUpdate),
    Plan {
        entries: Vec<PlanEntry>,
    },
    AvailableCommandsUpdate {
        #[serde(rename = "availableCommands")]
        available_commands: Vec<AvailableCommand>,
    },
    CurrentModeUpdate {
        #[serde(rename = "currentModeId")]
        current_mode_id: String,
    },
    ConfigOptionUpdate {
        #[serde(rename = "configOptions")]
        config_options: Vec<ConfigOption>,
    },
}

impl From<UpdateWire> for SessionUpdate {
    fn from(wire: UpdateWire) -> Self {
        match wire {
            UpdateWire::AgentMessageChunk { content } => Self::AgentMessageChunk(content),
            UpdateWire::AgentThoughtChunk { content } => Self::AgentThoughtChunk(content),
            UpdateWire::UserMessageChunk { content } => Self::UserMessageChunk(content),
            UpdateWire::ToolCall(wire) => {
                let mut call = ToolCall::new(wire.tool_call_id, wire.title);
                call.kind = wire.kind;
                call.status = wire.status;
                call.content = wire.content;
                call.locations = wire.locations;
                call.raw_input = wire.raw_input;
                call.raw_output = wire.raw_output;
                Self::ToolCall {
                    call,
                    meta: wire.meta,
                }
            }
            UpdateWire::ToolCallUpdate(update) => Self::ToolCallUpdate(update),
            UpdateWire::Plan { entries } => Self::Plan(entries),
            UpdateWire::AvailableCommandsUpdate { available_commands } => {
                Self::AvailableCommands(available_commands)
            }
            UpdateWire::CurrentModeUpdate { current_mode_id } => Self::CurrentMode(current_mode_id),
            UpdateWire::ConfigOptionUpdate { config_options } => {
                Self::ConfigOptions(config_options)
            }
        }
    }
}

/// Decode the params of a `session/update` notification.
///
/// # Errors
///
/// Returns [`AppError::Acp`] when the payload is malformed or carries an
/// unknown update kind.
pub fn decode_session_update(params: Value) -> Result<SessionNotification> {
    let wire: SessionNotificationWire = serde_json::from_value(params)
        .map_err(|e| AppError::Acp(format!("invalid session/update: {e}")))?;
    Ok(SessionNotification {
        session_id: wire.session_id,
        update: wire.update.into(),
    })
}

/// Decode the params of a `session/request_permission` request.
///
/// # Errors
///
/// Returns [`AppError::Acp`] when the payload is malformed.
pub fn decode_permission_request(params: Value) -> Result<PermissionRequestParams> {
    serde_json::from_value(params)
        .map_err(|e| AppError::Acp(format!("invalid session/request_permission: {e}")))
}
