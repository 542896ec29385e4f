//! Authentication methods and persisted per-agent auth preferences.

use serde::{Deserialize, Serialize};

/// Sentinel stored in place of a method id meaning "create the session directly".
pub const SKIP_SENTINEL: &str = "skip";

/// An authentication method advertised during `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthMethod {
    /// Identifier passed to `authenticate`.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Optional explanation shown to the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Remembered outcome of a previous authentication negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthPreference {
    /// Direct session creation worked last time.
    Skip,
    /// This method worked last time.
    Method(String),
}

impl AuthPreference {
    /// Parse the stored column value.
    #[must_use]
    pub fn from_stored(value: &str) -> Self {
        if value == SKIP_SENTINEL {
            Self::Skip
        } else {
            Self::Method(value.to_owned())
        }
    }

    /// Value persisted in storage.
    #[must_use]
    pub fn as_stored(&self) -> &str {
        match self {
            Self::Skip => SKIP_SENTINEL,
            Self::Method(id) => id,
        }
    }
}
