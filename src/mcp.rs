//! MCP server selection for `session/new`.
//!
//! Configured servers are filtered against the transports the agent
//! advertised. Unsupported servers are skipped with a user-visible notice
//! instead of failing the session. Selection runs fresh before every
//! session-creation attempt, and the session timeout is derived from it.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::GlobalConfig;
use crate::models::mcp::{McpCapabilities, McpServerConfig};

/// Source of configured MCP servers per agent.
pub trait McpCatalog: Send + Sync {
    /// All servers configured for `agent`, before capability filtering.
    fn servers_for(&self, agent: &str) -> Vec<McpServerConfig>;
}

/// [`McpCatalog`] backed by the `[agents.<name>]` config sections.
#[derive(Debug, Clone)]
pub struct ConfigMcpCatalog {
    config: Arc<GlobalConfig>,
}

impl ConfigMcpCatalog {
    /// Create a catalog over `config`.
    #[must_use]
    pub fn new(config: Arc<GlobalConfig>) -> Self {
        Self { config }
    }
}

impl McpCatalog for ConfigMcpCatalog {
    fn servers_for(&self, agent: &str) -> Vec<McpServerConfig> {
        self.config
            .agent(agent)
            .map(|a| a.mcp_servers.clone())
            .unwrap_or_default()
    }
}

/// Outcome of filtering configured servers against agent capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedServers {
    /// Servers to pass to `session/new`.
    pub servers: Vec<McpServerConfig>,
    /// One notice per skipped server.
    pub notices: Vec<String>,
}

impl ResolvedServers {
    /// Whether any selected server is reached over the network.
    #[must_use]
    pub fn has_remote(&self) -> bool {
        self.servers.iter().any(McpServerConfig::is_remote)
    }

    /// Session-creation deadline: `base`, raised to `remote_floor` when a
    /// remote server is attached.
    #[must_use]
    pub fn session_timeout(&self, base: Duration, remote_floor: Duration) -> Duration {
        if self.has_remote() {
            base.max(remote_floor)
        } else {
            base
        }
    }
}

/// Keep the servers whose transport the agent supports.
#[must_use]
pub fn resolve_servers(configured: &[McpServerConfig], caps: McpCapabilities) -> ResolvedServers {
    let mut resolved = ResolvedServers::default();
    for server in configured {
        let supported = match server {
            McpServerConfig::Stdio { .. } => true,
            McpServerConfig::Http { .. } => caps.http,
            McpServerConfig::Sse { .. } => caps.sse,
        };
        if supported {
            resolved.servers.push(server.clone());
        } else {
            info!(
                server = server.name(),
                transport = server.transport(),
                "skipping mcp server with unsupported transport"
            );
            resolved.notices.push(format!(
                "MCP server '{}' skipped: agent does not support {} servers",
                server.name(),
                server.transport()
            ));
        }
    }
    resolved
}
