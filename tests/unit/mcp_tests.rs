//! Unit tests for MCP server selection.

use std::collections::BTreeMap;
use std::time::Duration;

use acp_host::mcp::resolve_servers;
use acp_host::models::mcp::{McpCapabilities, McpServerConfig};

fn stdio(name: &str) -> McpServerConfig {
    McpServerConfig::Stdio {
        name: name.into(),
        command: "/usr/bin/server".into(),
        args: Vec::new(),
        env: BTreeMap::new(),
    }
}

fn http(name: &str) -> McpServerConfig {
    McpServerConfig::Http {
        name: name.into(),
        url: "https://mcp.example.com".into(),
        headers: BTreeMap::new(),
    }
}

fn sse(name: &str) -> McpServerConfig {
    McpServerConfig::Sse {
        name: name.into(),
        url: "https://mcp.example.com/sse".into(),
        headers: BTreeMap::new(),
    }
}

/// Stdio is always kept; remote transports need the capability.
#[test]
fn unsupported_transports_are_skipped_with_notice() {
    let configured = vec![stdio("fs"), http("search"), sse("events")];

    let resolved = resolve_servers(&configured, McpCapabilities::default());

    assert_eq!(resolved.servers, vec![stdio("fs")]);
    assert_eq!(
        resolved.notices,
        vec![
            "MCP server 'search' skipped: agent does not support http servers".to_owned(),
            "MCP server 'events' skipped: agent does not support sse servers".to_owned(),
        ]
    );
    assert!(!resolved.has_remote());
}

#[test]
fn supported_remote_servers_are_kept_in_order() {
    let configured = vec![http("search"), stdio("fs"), sse("events")];
    let caps = McpCapabilities { http: true, sse: true };

    let resolved = resolve_servers(&configured, caps);

    assert_eq!(resolved.servers, configured);
    assert!(resolved.notices.is_empty());
    assert!(resolved.has_remote());
}

/// The remote floor only applies when a remote server survives selection.
#[test]
fn session_timeout_uses_floor_only_for_remote_servers() {
    let base = Duration::from_secs(60);
    let floor = Duration::from_secs(180);

    let local = resolve_servers(&[stdio("fs"), http("search")], McpCapabilities::default());
    assert_eq!(local.session_timeout(base, floor), base);

    let remote = resolve_servers(&[http("search")], McpCapabilities { http: true, sse: false });
    assert_eq!(remote.session_timeout(base, floor), floor);

    let generous = Duration::from_secs(600);
    assert_eq!(remote.session_timeout(generous, floor), generous);
}

#[test]
fn no_servers_resolves_empty() {
    let resolved = resolve_servers(&[], McpCapabilities::default());
    assert!(resolved.servers.is_empty());
    assert!(resolved.notices.is_empty());
}
