//! Integration tests for prompt turns, cancellation, and permission requests.

use std::collections::HashSet;

use serde_json::json;

use acp_host::acp::protocol::{PermissionOption, PermissionRequestParams, StopReason};
use acp_host::driver::AgentEvent;
use acp_host::engine::lifecycle::{PromptOutcome, STOPPED_BY_USER};
use acp_host::models::message::{ContentBlock, MessageRole};
use acp_host::models::tool_call::{ToolCall, ToolCallUpdate};
use acp_host::models::update::SessionUpdate;
use acp_host::AppError;

use super::test_helpers::{
    auth_required, init_response, oauth_method, system_notices, text_chunk, Builder, PromptTurn,
    Script, TestEngine, SESSION_ID,
};

async fn ready_engine() -> TestEngine {
    let t = Builder::new().build();
    t.start_ready().await;
    t
}

fn permission_request(id: i64) -> AgentEvent {
    AgentEvent::PermissionRequested {
        request_id: json!(id),
        request: Box::new(PermissionRequestParams {
            session_id: SESSION_ID.into(),
            tool_call: ToolCallUpdate {
                tool_call_id: "tc-1".into(),
                title: Some("Edit main.rs".into()),
                ..ToolCallUpdate::default()
            },
            options: vec![
                PermissionOption {
                    option_id: "allow".into(),
                    name: "Allow".into(),
                    kind: "allow_once".into(),
                },
                PermissionOption {
                    option_id: "reject".into(),
                    name: "Reject".into(),
                    kind: "reject_once".into(),
                },
            ],
        }),
    }
}

// ── Prompt turns ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn prompt_before_start_is_rejected() {
    let t = Builder::new().build();

    let err = t
        .engine
        .send_message("hi", Vec::new())
        .await
        .expect_err("no session yet");

    assert!(matches!(err, AppError::InvalidState(_)), "{err:?}");
    assert!(t.driver.calls().is_empty());
}

/// Streamed chunks become one complete agent message after the user message.
#[tokio::test]
async fn streamed_chunks_form_one_agent_message() {
    let t = ready_engine().await;
    t.driver.push_prompt(PromptTurn::ends_with(
        StopReason::EndTurn,
        vec![text_chunk("Hel"), text_chunk("lo")],
    ));

    let outcome = t
        .engine
        .send_message("hi", Vec::new())
        .await
        .expect("prompt");

    assert_eq!(outcome, PromptOutcome::Completed(StopReason::EndTurn));
    let snapshot = t.engine.snapshot().await;
    assert!(!snapshot.is_streaming);
    let conversation: Vec<_> = snapshot
        .messages
        .iter()
        .filter(|m| m.role != MessageRole::System)
        .collect();
    assert_eq!(conversation.len(), 2);
    assert_eq!(conversation[0].role, MessageRole::User);
    assert_eq!(conversation[0].content, "hi");
    assert_eq!(conversation[1].role, MessageRole::Agent);
    assert_eq!(conversation[1].content, "Hello");
    assert!(conversation[1].is_complete);
    assert!(conversation[1].execution_time.is_some());
    assert!(t.driver.called("prompt:hi"));

    let usage = t.usage.snapshot();
    assert_eq!(usage.prompts, 1);
    assert_eq!(usage.agent_messages, 1);
}

/// Each turn gets its own agent message.
#[tokio::test]
async fn consecutive_turns_produce_separate_messages() {
    let t = ready_engine().await;
    t.driver.push_prompt(PromptTurn::ends_with(
        StopReason::EndTurn,
        vec![text_chunk("first")],
    ));
    t.driver.push_prompt(PromptTurn::ends_with(
        StopReason::EndTurn,
        vec![text_chunk("second")],
    ));

    t.engine.send_message("one", Vec::new()).await.expect("turn 1");
    t.engine.send_message("two", Vec::new()).await.expect("turn 2");

    let agent_texts: Vec<String> = t
        .engine
        .snapshot()
        .await
        .messages
        .iter()
        .filter(|m| m.role == MessageRole::Agent)
        .map(|m| m.content.clone())
        .collect();
    assert_eq!(agent_texts, vec!["first".to_owned(), "second".to_owned()]);
}

/// Attachments follow the text block in the prompt.
#[tokio::test]
async fn attachments_are_sent_with_the_prompt() {
    let t = ready_engine().await;
    let attachment = ContentBlock::ResourceLink {
        uri: "file:///work/main.rs".into(),
        name: "main.rs".into(),
    };

    t.engine
        .send_message("look at this", vec![attachment.clone()])
        .await
        .expect("prompt");

    let snapshot = t.engine.snapshot().await;
    let user = snapshot
        .messages
        .iter()
        .find(|m| m.role == MessageRole::User)
        .expect("user message");
    assert_eq!(
        user.content_blocks,
        vec![ContentBlock::text("look at this"), attachment]
    );
}

/// Non-normal stop reasons leave a notice.
#[tokio::test]
async fn token_limit_stop_adds_notice() {
    let t = ready_engine().await;
    t.driver.push_prompt(PromptTurn::ends_with(
        StopReason::MaxTokens,
        vec![text_chunk("partial")],
    ));

    let outcome = t.engine.send_message("hi", Vec::new()).await.expect("prompt");

    assert_eq!(outcome, PromptOutcome::Completed(StopReason::MaxTokens));
    assert_eq!(
        system_notices(&t.engine.snapshot().await).last().map(String::as_str),
        Some("Agent stopped: token limit reached")
    );
}

/// Tool calls of a turn carry that turn's iteration id.
#[tokio::test]
async fn tool_calls_are_tagged_with_the_turn() {
    let t = ready_engine().await;
    t.driver.push_prompt(PromptTurn::ends_with(
        StopReason::EndTurn,
        vec![SessionUpdate::ToolCall {
            call: ToolCall::new("tc-1", "Read main.rs"),
            meta: None,
        }],
    ));
    t.driver.push_prompt(PromptTurn::ends_with(
        StopReason::EndTurn,
        vec![SessionUpdate::ToolCall {
            call: ToolCall::new("tc-2", "Read lib.rs"),
            meta: None,
        }],
    ));

    t.engine.send_message("one", Vec::new()).await.expect("turn 1");
    t.engine.send_message("two", Vec::new()).await.expect("turn 2");

    let snapshot = t.engine.snapshot().await;
    let first = snapshot.tool_call("tc-1").expect("tc-1");
    let second = snapshot.tool_call("tc-2").expect("tc-2");
    assert!(first.iteration_id.is_some());
    assert!(second.iteration_id.is_some());
    assert_ne!(first.iteration_id, second.iteration_id);
    assert_eq!(t.usage.snapshot().tool_calls, 2);
}

// ── Prompt errors ────────────────────────────────────────────────────────────

/// An auth-required prompt error asks the user to authenticate again.
#[tokio::test]
async fn auth_required_prompt_error_requests_reauthentication() {
    let t = Builder::new()
        .script(Script {
            init: Ok(init_response(vec![oauth_method()])),
            ..Script::default()
        })
        .build();
    t.start_ready().await;
    t.driver.push_prompt(PromptTurn::fails(auth_required()));

    let outcome = t.engine.send_message("hi", Vec::new()).await.expect("prompt");

    assert_eq!(outcome, PromptOutcome::NeedsAuthentication);
    let snapshot = t.engine.snapshot().await;
    assert!(snapshot.needs_authentication);
    assert!(!snapshot.is_streaming);
    assert_eq!(
        system_notices(&snapshot).last().map(String::as_str),
        Some("Authentication required, please re-authenticate")
    );

    t.engine.authenticate("oauth").await.expect("reauthenticate");

    let snapshot = t.engine.snapshot().await;
    assert!(!snapshot.needs_authentication);
    assert_eq!(
        system_notices(&snapshot).last().map(String::as_str),
        Some("Authenticated with oauth")
    );
    assert_eq!(
        t.driver
            .calls()
            .iter()
            .filter(|c| c.as_str() == "new_session")
            .count(),
        1,
        "re-authentication keeps the existing session"
    );
}

/// Other prompt errors are reported on the timeline and returned.
#[tokio::test]
async fn agent_error_is_reported() {
    let t = ready_engine().await;
    t.driver.push_prompt(PromptTurn::fails(AppError::Rpc {
        code: -32603,
        message: "internal error".into(),
    }));

    let err = t
        .engine
        .send_message("hi", Vec::new())
        .await
        .expect_err("prompt must fail");

    assert!(matches!(err, AppError::Rpc { code: -32603, .. }));
    let snapshot = t.engine.snapshot().await;
    assert_eq!(
        system_notices(&snapshot).last().map(String::as_str),
        Some("Agent error: rpc -32603: internal error")
    );
    assert!(!snapshot.is_streaming);
    assert_eq!(snapshot.state, acp_host::models::session::SessionState::Ready);
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_notifies_agent_and_appends_notice() {
    let t = ready_engine().await;

    t.engine.cancel_current_prompt().await.expect("cancel");

    assert!(t.driver.called("cancel"));
    assert_eq!(
        system_notices(&t.engine.snapshot().await).last().map(String::as_str),
        Some(STOPPED_BY_USER)
    );
}

/// Local state is reset even when the agent cannot be told.
#[tokio::test]
async fn cancel_succeeds_when_notification_fails() {
    let t = Builder::new()
        .script(Script {
            cancel_fails: true,
            ..Script::default()
        })
        .build();
    t.start_ready().await;

    t.engine.cancel_current_prompt().await.expect("cancel");

    let snapshot = t.engine.snapshot().await;
    assert!(!snapshot.is_streaming);
    assert_eq!(
        system_notices(&snapshot).last().map(String::as_str),
        Some(STOPPED_BY_USER)
    );
}

#[tokio::test]
async fn cancel_without_session_is_rejected() {
    let t = Builder::new().build();
    assert!(matches!(
        t.engine.cancel_current_prompt().await,
        Err(AppError::InvalidState(_))
    ));
}

// ── Permissions ──────────────────────────────────────────────────────────────

/// Pending permission requests are answered "cancelled" when the turn stops.
#[tokio::test]
async fn cancel_answers_pending_permissions() {
    let t = ready_engine().await;
    t.driver.emit(permission_request(4)).await;
    t.wait_for(|s| !s.permissions.is_empty()).await;

    t.engine.cancel_current_prompt().await.expect("cancel");

    assert!(t.driver.called("permission:4:cancelled"));
    assert!(t.engine.snapshot().await.permissions.is_empty());
}

#[tokio::test]
async fn permission_choice_is_forwarded() {
    let t = ready_engine().await;
    t.driver.emit(permission_request(7)).await;
    let snapshot = t.wait_for(|s| !s.permissions.is_empty()).await;
    assert_eq!(snapshot.permissions[0].key, "7");
    assert_eq!(snapshot.permissions[0].tool_call.tool_call_id, "tc-1");

    t.engine
        .respond_permission("7", "allow")
        .await
        .expect("respond");

    assert!(t.driver.called("permission:7:allow"));
    assert!(t.engine.snapshot().await.permissions.is_empty());
}

/// Unknown requests and options leave the request pending.
#[tokio::test]
async fn unknown_permission_or_option_is_not_found() {
    let t = ready_engine().await;
    t.driver.emit(permission_request(7)).await;
    t.wait_for(|s| !s.permissions.is_empty()).await;

    assert!(matches!(
        t.engine.respond_permission("8", "allow").await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        t.engine.respond_permission("7", "maybe").await,
        Err(AppError::NotFound(_))
    ));

    assert_eq!(t.engine.snapshot().await.permissions.len(), 1);
    let answered: HashSet<String> = t
        .driver
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("permission:"))
        .collect();
    assert!(answered.is_empty());
}
