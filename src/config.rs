//! Global configuration parsing, validation, and credential loading.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::models::mcp::McpServerConfig;
use crate::{AppError, Result};

/// Keychain service under which auth credentials are stored.
pub const KEYRING_SERVICE: &str = "acp-host";

/// Protocol deadlines, in seconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// `initialize` deadline.
    #[serde(default = "default_handshake_seconds")]
    pub handshake_seconds: u64,
    /// Base `session/new` deadline; also used for short control requests.
    #[serde(default = "default_session_seconds")]
    pub session_seconds: u64,
    /// Minimum `session/new` deadline when a remote MCP server is attached.
    #[serde(default = "default_remote_session_floor_seconds")]
    pub remote_session_floor_seconds: u64,
    /// Wait for a graceful agent exit before killing it.
    #[serde(default = "default_terminate_grace_seconds")]
    pub terminate_grace_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_seconds: default_handshake_seconds(),
            session_seconds: default_session_seconds(),
            remote_session_floor_seconds: default_remote_session_floor_seconds(),
            terminate_grace_seconds: default_terminate_grace_seconds(),
        }
    }
}

impl TimeoutConfig {
    /// `initialize` deadline.
    #[must_use]
    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_seconds)
    }

    /// Base session-creation deadline.
    #[must_use]
    pub fn session(&self) -> Duration {
        Duration::from_secs(self.session_seconds)
    }

    /// Remote MCP session-creation floor.
    #[must_use]
    pub fn remote_session_floor(&self) -> Duration {
        Duration::from_secs(self.remote_session_floor_seconds)
    }

    /// Terminate grace period.
    #[must_use]
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_seconds)
    }
}

fn default_handshake_seconds() -> u64 {
    30
}

fn default_session_seconds() -> u64 {
    60
}

fn default_remote_session_floor_seconds() -> u64 {
    180
}

fn default_terminate_grace_seconds() -> u64 {
    5
}

/// Debounce windows and retention bounds for notification processing.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StreamingConfig {
    /// Idle window before buffered thought text is published.
    #[serde(default = "default_thought_flush_ms")]
    pub thought_flush_ms: u64,
    /// Idle window before buffered agent message text is published.
    #[serde(default = "default_message_flush_ms")]
    pub message_flush_ms: u64,
    /// Idle window before buffered tool-call content is merged.
    #[serde(default = "default_tool_content_flush_ms")]
    pub tool_content_flush_ms: u64,
    /// Maximum tool calls kept; the oldest are evicted past this.
    #[serde(default = "default_tool_call_retention")]
    pub tool_call_retention: usize,
    /// Maximum buffered updates per not-yet-defined tool call id.
    #[serde(default = "default_pending_update_limit")]
    pub pending_update_limit: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            thought_flush_ms: default_thought_flush_ms(),
            message_flush_ms: default_message_flush_ms(),
            tool_content_flush_ms: default_tool_content_flush_ms(),
            tool_call_retention: default_tool_call_retention(),
            pending_update_limit: default_pending_update_limit(),
        }
    }
}

fn default_thought_flush_ms() -> u64 {
    100
}

fn default_message_flush_ms() -> u64 {
    50
}

fn default_tool_content_flush_ms() -> u64 {
    100
}

fn default_tool_call_retention() -> usize {
    500
}

fn default_pending_update_limit() -> usize {
    64
}

/// One registered agent executable.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Executable name (resolved via `PATH`) or path.
    pub command: String,
    /// Launch arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the agent process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Auth method id → environment variable holding its credential.
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
    /// MCP servers offered to the agent on every session.
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// `SQLite` file with auth preferences and capabilities.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// Agent started when the CLI is given none.
    #[serde(default)]
    pub default_agent: Option<String>,
    /// Protocol deadlines.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Notification processing tunables.
    #[serde(default)]
    pub streaming: StreamingConfig,
    /// Registered agents by name.
    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Database file, defaulting to `.acp-host/state.db` under the current directory.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(".acp-host").join("state.db"))
    }

    /// Look up a registered agent.
    #[must_use]
    pub fn agent(&self, name: &str) -> Option<&AgentConfig> {
        self.agents.get(name)
    }

    fn validate(&self) -> Result<()> {
        let timeouts = &self.timeouts;
        for (field, value) in [
            ("handshake_seconds", timeouts.handshake_seconds),
            ("session_seconds", timeouts.session_seconds),
            ("remote_session_floor_seconds", timeouts.remote_session_floor_seconds),
        ] {
            if value == 0 {
                return Err(AppError::Config(format!(
                    "timeouts.{field} must be greater than zero"
                )));
            }
        }

        if self.streaming.tool_call_retention == 0 {
            return Err(AppError::Config(
                "streaming.tool_call_retention must be greater than zero".into(),
            ));
        }

        for (name, agent) in &self.agents {
            if agent.command.trim().is_empty() {
                return Err(AppError::Config(format!(
                    "agents.{name}.command must not be empty"
                )));
            }
            if let Some(server) = agent.mcp_servers.iter().find(|s| s.name().trim().is_empty()) {
                return Err(AppError::Config(format!(
                    "agents.{name} has an unnamed {} mcp server",
                    server.transport()
                )));
            }
        }

        if let Some(default_agent) = &self.default_agent {
            if !self.agents.contains_key(default_agent) {
                return Err(AppError::Config(format!(
                    "default_agent '{default_agent}' is not a registered agent"
                )));
            }
        }

        Ok(())
    }
}

/// Load an auth credential from OS keychain with env-var fallback.
///
/// Looks up service [`KEYRING_SERVICE`], user `<agent>/<method>` first, then
/// the environment variable `env_key` when one is configured. A missing
/// credential is not an error: many auth methods need none.
///
/// # Errors
///
/// Returns `AppError::Config` if the keychain task panics.
pub async fn load_credential(
    agent: &str,
    method_id: &str,
    env_key: Option<&str>,
) -> Result<Option<String>> {
    let user = format!("{agent}/{method_id}");
    let lookup_user = user.clone();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &lookup_user).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(Some(value)),
        Ok(_) => warn!(user, "keychain entry is empty, trying env var"),
        Err(keyring::Error::NoEntry) => debug!(user, "no keychain entry"),
        Err(err) => warn!(user, ?err, "keychain lookup failed, trying env var"),
    }

    Ok(env_key.and_then(|key| env::var(key).ok()).filter(|v| !v.is_empty()))
}
