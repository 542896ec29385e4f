//! MCP server entries handed to the agent on `session/new`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One configured MCP server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum McpServerConfig {
    /// Local process speaking MCP over stdio.
    Stdio {
        /// Server name shown to the agent.
        name: String,
        /// Executable path.
        command: String,
        /// Command-line arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment variables.
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// Remote server over streamable HTTP.
    Http {
        /// Server name shown to the agent.
        name: String,
        /// Endpoint URL.
        url: String,
        /// Extra request headers.
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Remote server over server-sent events.
    Sse {
        /// Server name shown to the agent.
        name: String,
        /// Endpoint URL.
        url: String,
        /// Extra request headers.
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

impl McpServerConfig {
    /// Server name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Stdio { name, .. } | Self::Http { name, .. } | Self::Sse { name, .. } => name,
        }
    }

    /// Transport label as written in config.
    #[must_use]
    pub fn transport(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http { .. } => "http",
            Self::Sse { .. } => "sse",
        }
    }

    /// Whether the agent must reach this server over the network.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        !matches!(self, Self::Stdio { .. })
    }
}

/// MCP transports the agent advertised support for. Stdio is always supported.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct McpCapabilities {
    /// Agent accepts HTTP servers.
    #[serde(default)]
    pub http: bool,
    /// Agent accepts SSE servers.
    #[serde(default)]
    pub sse: bool,
}
