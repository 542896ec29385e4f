//! Integration tests for session start, retry, mode changes, and close.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use acp_host::driver::AgentEvent;
use acp_host::engine::lifecycle::AGENT_NOT_CONFIGURED;
use acp_host::models::mcp::McpServerConfig;
use acp_host::models::session::SessionState;
use acp_host::AppError;

use super::test_helpers::{
    system_notices, text_chunk, Builder, MemoryCatalog, MemoryRegistry, PromptTurn, Script, AGENT,
    SESSION_ID,
};

// ── Start ────────────────────────────────────────────────────────────────────

/// An agent without auth methods goes straight to a ready session.
#[tokio::test]
async fn start_without_auth_reaches_ready() {
    let t = Builder::new().build();

    t.start().await.expect("start");

    let snapshot = t.engine.snapshot().await;
    assert_eq!(snapshot.state, SessionState::Ready);
    assert_eq!(snapshot.session_id.as_deref(), Some(SESSION_ID));
    assert_eq!(snapshot.current_mode_id.as_deref(), Some("default"));
    assert_eq!(snapshot.modes.len(), 2);
    assert_eq!(snapshot.current_model_id.as_deref(), Some("sonnet"));
    assert!(!snapshot.needs_authentication);
    assert_eq!(
        system_notices(&snapshot),
        vec!["Session started with claude in /work".to_owned()]
    );
    assert_eq!(t.driver.calls(), vec!["initialize", "new_session"]);
    assert_eq!(t.registry.recorded_capabilities(), vec![AGENT.to_owned()]);
    assert_eq!(t.usage.snapshot().session_starts, 1);
}

/// An unknown agent fails without launching anything.
#[tokio::test]
async fn unconfigured_agent_fails_start() {
    let t = Builder::new().registry(MemoryRegistry::default()).build();

    let err = t.start().await.expect_err("start must fail");

    assert!(matches!(err, AppError::Config(_)), "{err:?}");
    assert_eq!(
        t.engine.state().await,
        SessionState::Failed(AGENT_NOT_CONFIGURED.to_owned())
    );
    assert_eq!(t.launcher.launches(), 0);
}

/// A launch error is recorded as the failure reason.
#[tokio::test]
async fn launch_failure_is_reported() {
    let t = Builder::new().launch_failures(1).build();

    t.start().await.expect_err("start must fail");

    let SessionState::Failed(reason) = t.engine.state().await else {
        panic!("expected failed state");
    };
    assert!(reason.starts_with("Failed to launch agent: "), "{reason}");
}

/// A failed handshake terminates the agent.
#[tokio::test]
async fn handshake_failure_terminates_agent() {
    let t = Builder::new()
        .script(Script {
            init: Err(AppError::Timeout("initialize did not complete".into())),
            ..Script::default()
        })
        .build();

    t.start().await.expect_err("start must fail");

    let SessionState::Failed(reason) = t.engine.state().await else {
        panic!("expected failed state");
    };
    assert!(reason.starts_with("Handshake failed: "), "{reason}");
    assert!(t.driver.called("terminate"));
    assert!(!t.driver.called("new_session"));
}

/// A second start while one is active is rejected.
#[tokio::test]
async fn start_while_active_is_rejected() {
    let t = Builder::new().build();
    t.start_ready().await;

    let err = t.start().await.expect_err("second start must fail");

    assert!(matches!(err, AppError::InvalidState(_)), "{err:?}");
    assert_eq!(t.launcher.launches(), 1);
}

/// Retry re-runs the start sequence after a failure.
#[tokio::test]
async fn retry_after_failure_reaches_ready() {
    let t = Builder::new().launch_failures(1).build();
    t.start().await.expect_err("first start fails");

    t.engine.retry_start().await.expect("retry");

    assert_eq!(t.engine.state().await, SessionState::Ready);
    assert_eq!(t.launcher.launches(), 2);
}

/// Retry is only for failed sessions.
#[tokio::test]
async fn retry_requires_failed_state() {
    let t = Builder::new().build();
    assert!(matches!(
        t.engine.retry_start().await,
        Err(AppError::InvalidState(_))
    ));

    t.start_ready().await;
    assert!(matches!(
        t.engine.retry_start().await,
        Err(AppError::InvalidState(_))
    ));
}

// ── MCP servers ──────────────────────────────────────────────────────────────

fn servers() -> Vec<McpServerConfig> {
    vec![
        McpServerConfig::Stdio {
            name: "fs".into(),
            command: "/usr/bin/mcp-fs".into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        },
        McpServerConfig::Http {
            name: "search".into(),
            url: "https://mcp.example.com".into(),
            headers: BTreeMap::new(),
        },
    ]
}

/// Unsupported servers are dropped with a notice; the base timeout applies.
#[tokio::test]
async fn unsupported_mcp_servers_are_skipped_with_notice() {
    let t = Builder::new().catalog(MemoryCatalog::new(servers())).build();

    t.start_ready().await;

    let calls = t.driver.session_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].servers.len(), 1);
    assert_eq!(calls[0].servers[0].name(), "fs");
    assert_eq!(calls[0].timeout, Duration::from_secs(60));
    let notices = system_notices(&t.engine.snapshot().await);
    assert!(notices.contains(
        &"MCP server 'search' skipped: agent does not support http servers".to_owned()
    ));
}

// ── Mode and model ───────────────────────────────────────────────────────────

/// Selecting the active mode does not reach the agent.
#[tokio::test]
async fn selecting_current_mode_is_a_no_op() {
    let t = Builder::new().build();
    t.start_ready().await;

    t.engine.set_mode_by_id("default").await.expect("no-op");

    assert!(!t.driver.calls().iter().any(|c| c.starts_with("set_mode")));
}

#[tokio::test]
async fn mode_and_model_changes_are_applied() {
    let t = Builder::new().build();
    t.start_ready().await;

    t.engine.set_mode_by_id("plan").await.expect("set mode");
    t.engine.set_model("opus").await.expect("set model");

    let snapshot = t.engine.snapshot().await;
    assert_eq!(snapshot.current_mode_id.as_deref(), Some("plan"));
    assert_eq!(snapshot.current_model_id.as_deref(), Some("opus"));
    assert!(t.driver.called("set_mode:plan"));
    assert!(t.driver.called("set_model:opus"));
}

#[tokio::test]
async fn unknown_mode_is_not_found() {
    let t = Builder::new().build();
    t.start_ready().await;

    assert!(matches!(
        t.engine.set_mode_by_id("yolo").await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        t.engine.set_model("gpt").await,
        Err(AppError::NotFound(_))
    ));
}

/// Only one mode or model change runs at a time.
#[tokio::test]
async fn concurrent_mode_change_is_rejected() {
    let gate = Arc::new(Notify::new());
    let t = Builder::new()
        .script(Script {
            mode_gate: Some(Arc::clone(&gate)),
            ..Script::default()
        })
        .build();
    t.start_ready().await;

    let engine = Arc::clone(&t.engine);
    let first = tokio::spawn(async move { engine.set_mode_by_id("plan").await });
    while !t.driver.called("set_mode:plan") {
        tokio::task::yield_now().await;
    }

    let second = t.engine.set_model("opus").await;
    assert!(matches!(second, Err(AppError::InvalidState(_))), "{second:?}");

    gate.notify_one();
    first.await.expect("join").expect("first change succeeds");
    assert_eq!(
        t.engine.snapshot().await.current_mode_id.as_deref(),
        Some("plan")
    );
    t.engine.set_model("opus").await.expect("flag released");
}

#[tokio::test]
async fn mode_change_requires_ready_session() {
    let t = Builder::new().build();
    assert!(matches!(
        t.engine.set_mode_by_id("plan").await,
        Err(AppError::InvalidState(_))
    ));
}

// ── Agent-driven state ───────────────────────────────────────────────────────

/// The agent can switch modes on its own.
#[tokio::test]
async fn agent_mode_update_is_applied() {
    let t = Builder::new().build();
    t.start_ready().await;

    t.driver
        .emit(AgentEvent::SessionUpdate {
            session_id: SESSION_ID.into(),
            update: Box::new(acp_host::models::update::SessionUpdate::CurrentMode(
                "plan".into(),
            )),
        })
        .await;

    t.wait_for(|s| s.current_mode_id.as_deref() == Some("plan"))
        .await;
}

/// Updates addressed to another session are dropped.
#[tokio::test]
async fn updates_for_other_sessions_are_ignored() {
    let t = Builder::new().build();
    t.start_ready().await;

    t.driver
        .emit(AgentEvent::SessionUpdate {
            session_id: "other".into(),
            update: Box::new(text_chunk("not for us")),
        })
        .await;
    t.driver
        .emit(AgentEvent::SessionUpdate {
            session_id: SESSION_ID.into(),
            update: Box::new(text_chunk("for us")),
        })
        .await;

    let snapshot = t.wait_for(|s| s.open_agent_message().is_some()).await;
    assert_eq!(
        snapshot
            .messages
            .iter()
            .filter(|m| m.is_open_agent_message())
            .count(),
        1
    );
}

/// Losing the agent stream fails a ready session.
#[tokio::test]
async fn stream_close_fails_ready_session() {
    let t = Builder::new().build();
    t.start_ready().await;

    t.driver
        .emit(AgentEvent::StreamClosed {
            reason: "stream closed".into(),
        })
        .await;

    let snapshot = t
        .wait_for(|s| matches!(s.state, SessionState::Failed(_)))
        .await;
    assert_eq!(
        snapshot.state,
        SessionState::Failed("Agent connection closed: stream closed".into())
    );
    assert_eq!(
        system_notices(&snapshot).last().map(String::as_str),
        Some("Agent connection closed (stream closed)")
    );

    t.engine.retry_start().await.expect("retry after disconnect");
    assert_eq!(t.engine.state().await, SessionState::Ready);
}

// ── Close ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn close_returns_to_idle_and_clears_timeline() {
    let t = Builder::new().build();
    t.start_ready().await;

    t.engine.close().await.expect("close");

    let snapshot = t.engine.snapshot().await;
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(snapshot.messages.is_empty());
    assert!(snapshot.session_id.is_none());
    assert!(t.driver.called("terminate"));

    t.engine
        .start(AGENT, Path::new("/other"))
        .await
        .expect("restart after close");
    assert_eq!(
        system_notices(&t.engine.snapshot().await),
        vec!["Session started with claude in /other".to_owned()]
    );
}

/// A prompt still waiting on the agent does not touch a closed session.
#[tokio::test]
async fn prompt_finishing_after_close_leaves_timeline_empty() {
    let gate = Arc::new(Notify::new());
    let t = Builder::new()
        .script(Script {
            prompt_gate: Some(Arc::clone(&gate)),
            ..Script::default()
        })
        .build();
    t.start_ready().await;
    t.driver
        .push_prompt(PromptTurn::fails(AppError::Acp("connection terminated".into())));

    let engine = Arc::clone(&t.engine);
    let prompt = tokio::spawn(async move { engine.send_message("hi", Vec::new()).await });
    while !t.driver.called("prompt:hi") {
        tokio::task::yield_now().await;
    }

    t.engine.close().await.expect("close");
    gate.notify_one();
    let result = prompt.await.expect("join");

    assert!(matches!(result, Err(AppError::InvalidState(_))), "{result:?}");
    let snapshot = t.engine.snapshot().await;
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(snapshot.messages.is_empty(), "{:?}", snapshot.messages);
    assert!(!snapshot.is_streaming);
}

/// A start still negotiating when the session is closed stays closed.
#[tokio::test]
async fn start_finishing_after_close_stays_idle() {
    let gate = Arc::new(Notify::new());
    let t = Builder::new()
        .script(Script {
            session_gate: Some(Arc::clone(&gate)),
            ..Script::default()
        })
        .build();

    let engine = Arc::clone(&t.engine);
    let start = tokio::spawn(async move { engine.start(AGENT, Path::new("/work")).await });
    while !t.driver.called("new_session") {
        tokio::task::yield_now().await;
    }

    t.engine.close().await.expect("close");
    gate.notify_one();
    let result = start.await.expect("join");

    assert!(matches!(result, Err(AppError::InvalidState(_))), "{result:?}");
    let snapshot = t.engine.snapshot().await;
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(snapshot.session_id.is_none());
    assert!(snapshot.messages.is_empty(), "{:?}", snapshot.messages);
}

#[tokio::test]
async fn close_when_idle_is_a_no_op() {
    let t = Builder::new().build();
    t.engine.close().await.expect("idle close");
    assert_eq!(t.engine.state().await, SessionState::Idle);
    assert!(t.driver.calls().is_empty());
}
