//! Error types shared across the engine, transport, and persistence layers.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// JSON-RPC error code ACP agents use to signal that authentication is required.
pub const AUTH_REQUIRED_CODE: i64 = -32000;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure, or an unconfigured agent.
    Config(String),
    /// ACP transport failure: spawn, framing, stream closed, write failed.
    Acp(String),
    /// The agent answered a request with a JSON-RPC error object.
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Human-readable error message (prefers the `data` string when present).
        message: String,
    },
    /// Authentication negotiation failure.
    Auth(String),
    /// A protocol call did not complete within its deadline.
    Timeout(String),
    /// Operation rejected in the current session state.
    InvalidState(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether this error means the agent wants the user to authenticate.
    ///
    /// Matches the ACP auth-required error code, or any message containing
    /// `auth` together with `required`, `not authenticated`, `unauthorized`,
    /// or `401`.
    #[must_use]
    pub fn is_auth_required(&self) -> bool {
        let message = match self {
            Self::Rpc { code, message } => {
                if *code == AUTH_REQUIRED_CODE {
                    return true;
                }
                message
            }
            Self::Config(msg)
            | Self::Acp(msg)
            | Self::Auth(msg)
            | Self::Timeout(msg)
            | Self::InvalidState(msg)
            | Self::NotFound(msg)
            | Self::Db(msg)
            | Self::Io(msg) => msg,
        };
        message_signals_auth(message)
    }
}

fn message_signals_auth(message: &str) -> bool {
    let lower = message.to_lowercase();
    (lower.contains("auth") && lower.contains("required"))
        || lower.contains("not authenticated")
        || lower.contains("unauthorized")
        || lower.contains("401")
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Acp(msg) => write!(f, "acp: {msg}"),
            Self::Rpc { code, message } => write!(f, "rpc {code}: {message}"),
            Self::Auth(msg) => write!(f, "auth: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Acp(format!("malformed json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
