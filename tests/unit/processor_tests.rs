//! Unit tests for applying agent events to the session core.
//!
//! Each test installs a live tick channel so debounce timers deliver
//! [`FlushTick`]s the test feeds back through `on_flush_tick`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use acp_host::acp::protocol::{PermissionOption, PermissionRequestParams};
use acp_host::config::StreamingConfig;
use acp_host::driver::AgentEvent;
use acp_host::engine::coalescer::{FlushKey, FlushTick};
use acp_host::engine::processor::run_notification_loop;
use acp_host::engine::SessionCore;
use acp_host::models::message::{ContentBlock, MessageRole};
use acp_host::models::session::{PlanEntry, PlanEntryStatus, SessionState};
use acp_host::models::tool_call::{ToolCall, ToolCallContent, ToolCallStatus, ToolCallUpdate};
use acp_host::models::update::SessionUpdate;
use acp_host::telemetry::{UsageCounters, UsageRecorder};

struct Harness {
    core: SessionCore,
    ticks: mpsc::UnboundedReceiver<FlushTick<FlushKey>>,
    usage: Arc<UsageCounters>,
}

impl Harness {
    fn new() -> Self {
        Self::with_streaming(StreamingConfig::default())
    }

    fn with_streaming(streaming: StreamingConfig) -> Self {
        let usage = Arc::new(UsageCounters::new());
        let sink: Arc<dyn UsageRecorder> = Arc::clone(&usage) as Arc<dyn UsageRecorder>;
        let mut core = SessionCore::new(streaming, sink);
        let (tx, rx) = mpsc::unbounded_channel();
        core.begin_session("claude", PathBuf::from("/work"), &tx);
        Self {
            core,
            ticks: rx,
            usage,
        }
    }

    fn apply(&mut self, update: SessionUpdate) {
        self.core.apply_event(AgentEvent::SessionUpdate {
            session_id: "s1".into(),
            update: Box::new(update),
        });
    }

    /// Wait for the next timer and apply it.
    async fn flush_next(&mut self) -> FlushKey {
        let tick = self.ticks.recv().await.expect("a timer must fire");
        let key = tick.key.clone();
        self.core.on_flush_tick(&tick);
        key
    }
}

fn agent_chunk(text: &str) -> SessionUpdate {
    SessionUpdate::AgentMessageChunk(ContentBlock::text(text))
}

fn tool_call(id: &str, title: &str, status: ToolCallStatus, meta: Option<Value>) -> SessionUpdate {
    let mut call = ToolCall::new(id, title);
    call.status = status;
    SessionUpdate::ToolCall { call, meta }
}

fn task_meta() -> Option<Value> {
    Some(json!({ "claudeCode": { "toolName": "Task" } }))
}

fn status_update(id: &str, status: ToolCallStatus) -> SessionUpdate {
    SessionUpdate::ToolCallUpdate(ToolCallUpdate {
        tool_call_id: id.into(),
        status: Some(status),
        ..ToolCallUpdate::default()
    })
}

// ── Agent messages ───────────────────────────────────────────────────────────

/// Chunks inside one window land in a single open message when the timer fires.
#[tokio::test(start_paused = true)]
async fn agent_chunks_coalesce_into_one_open_message() {
    let mut h = Harness::new();

    h.apply(agent_chunk("Hel"));
    h.apply(agent_chunk("lo"));

    let snapshot = h.core.snapshot();
    let open = snapshot.open_agent_message().expect("open message exists");
    assert!(open.content.is_empty(), "text is buffered until the window ends");

    assert_eq!(h.flush_next().await, FlushKey::Message);

    let snapshot = h.core.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(
        snapshot.open_agent_message().expect("still open").content,
        "Hello"
    );
}

/// A tool call completes the preceding message; later text opens a new one.
#[tokio::test(start_paused = true)]
async fn tool_call_completes_preceding_agent_message() {
    let mut h = Harness::new();

    h.apply(agent_chunk("Let me look."));
    h.apply(tool_call("tc-1", "Read main.rs", ToolCallStatus::Pending, None));
    h.apply(agent_chunk("Found it."));
    h.core.end_turn();

    let snapshot = h.core.snapshot();
    let agent: Vec<_> = snapshot
        .messages
        .iter()
        .filter(|m| m.role == MessageRole::Agent)
        .collect();
    assert_eq!(agent.len(), 2);
    assert_eq!(agent[0].content, "Let me look.");
    assert!(agent[0].is_complete);
    assert_eq!(agent[1].content, "Found it.");
    assert!(agent[1].is_complete);
    assert!(snapshot.open_agent_message().is_none());
    assert_eq!(h.usage.snapshot().agent_messages, 2);
}

/// There is never more than one streaming agent message.
#[tokio::test(start_paused = true)]
async fn at_most_one_open_agent_message() {
    let mut h = Harness::new();

    for i in 0..5 {
        h.apply(agent_chunk(&format!("part {i} ")));
        h.apply(SessionUpdate::AgentThoughtChunk(ContentBlock::text("hmm")));
    }
    h.flush_next().await;

    let snapshot = h.core.snapshot();
    let open = snapshot
        .messages
        .iter()
        .filter(|m| m.is_open_agent_message())
        .count();
    assert_eq!(open, 1);
}

/// User chunks extend a trailing user message.
#[tokio::test(start_paused = true)]
async fn user_chunks_extend_trailing_user_message() {
    let mut h = Harness::new();

    h.apply(SessionUpdate::UserMessageChunk(ContentBlock::text("fix ")));
    h.apply(SessionUpdate::UserMessageChunk(ContentBlock::text("the bug")));

    let snapshot = h.core.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].role, MessageRole::User);
    assert_eq!(snapshot.messages[0].content, "fix the bug");
}

// ── Thoughts ─────────────────────────────────────────────────────────────────

/// Thought text is published after its window and cleared by response text.
#[tokio::test(start_paused = true)]
async fn thought_is_published_then_superseded() {
    let mut h = Harness::new();

    h.apply(SessionUpdate::AgentThoughtChunk(ContentBlock::text("Thinking ")));
    h.apply(SessionUpdate::AgentThoughtChunk(ContentBlock::text("hard")));
    assert_eq!(h.core.snapshot().thought, None);

    assert_eq!(h.flush_next().await, FlushKey::Thought);
    assert_eq!(h.core.snapshot().thought.as_deref(), Some("Thinking hard"));

    h.apply(agent_chunk("Answer"));
    assert_eq!(h.core.snapshot().thought, None);
}

// ── Tool calls ───────────────────────────────────────────────────────────────

/// A tick that was already in flight when its buffer was force-flushed does
/// not drain the next buffer under the same key.
#[tokio::test(start_paused = true)]
async fn stale_tick_does_not_flush_newer_buffer() {
    let mut h = Harness::new();

    h.apply(agent_chunk("first"));
    let stale = h.ticks.recv().await.expect("timer fires");
    h.apply(tool_call("tc-1", "Read", ToolCallStatus::Pending, None));
    h.apply(agent_chunk("second"));

    h.core.on_flush_tick(&stale);

    let snapshot = h.core.snapshot();
    assert_eq!(snapshot.messages[0].content, "first");
    assert!(snapshot.messages[0].is_complete);
    let open = snapshot.open_agent_message().expect("second message open");
    assert!(open.content.is_empty(), "new text waits for its own timer");

    assert_eq!(h.flush_next().await, FlushKey::Message);
    assert_eq!(
        h.core.snapshot().open_agent_message().expect("still open").content,
        "second"
    );
}

/// A repeated defining event is merged and counted once.
#[tokio::test(start_paused = true)]
async fn duplicate_tool_call_is_deduplicated() {
    let mut h = Harness::new();

    h.apply(tool_call("tc-1", "Read", ToolCallStatus::Pending, None));
    h.apply(tool_call("tc-1", "Read src/lib.rs", ToolCallStatus::InProgress, None));

    let snapshot = h.core.snapshot();
    assert_eq!(snapshot.tool_calls.len(), 1);
    let call = snapshot.tool_call("tc-1").expect("tc-1");
    assert_eq!(call.title, "Read src/lib.rs");
    assert_eq!(call.status, ToolCallStatus::InProgress);
    assert_eq!(h.usage.snapshot().tool_calls, 1);
}

/// An untitled update for an unknown id waits for its defining event.
#[tokio::test(start_paused = true)]
async fn out_of_order_update_is_replayed_after_definition() {
    let mut h = Harness::new();

    h.apply(status_update("tc-9", ToolCallStatus::Completed));
    assert!(h.core.snapshot().tool_call("tc-9").is_none());
    assert_eq!(h.core.buffered_update_count("tc-9"), 1);

    h.apply(tool_call("tc-9", "Run tests", ToolCallStatus::Pending, None));

    let snapshot = h.core.snapshot();
    let call = snapshot.tool_call("tc-9").expect("defined");
    assert_eq!(call.status, ToolCallStatus::Completed);
    assert_eq!(h.core.buffered_update_count("tc-9"), 0);
}

/// A titled update for an unknown id creates the call immediately.
#[tokio::test(start_paused = true)]
async fn titled_update_creates_placeholder() {
    let mut h = Harness::new();

    h.apply(SessionUpdate::ToolCallUpdate(ToolCallUpdate {
        tool_call_id: "tc-2".into(),
        title: Some("Fetch docs".into()),
        status: Some(ToolCallStatus::InProgress),
        ..ToolCallUpdate::default()
    }));

    let snapshot = h.core.snapshot();
    let call = snapshot.tool_call("tc-2").expect("placeholder created");
    assert_eq!(call.title, "Fetch docs");
    assert_eq!(call.status, ToolCallStatus::InProgress);
}

/// The per-id buffer keeps only the newest updates.
#[tokio::test(start_paused = true)]
async fn pending_update_buffer_is_bounded() {
    let mut h = Harness::with_streaming(StreamingConfig {
        pending_update_limit: 2,
        ..StreamingConfig::default()
    });

    h.apply(status_update("tc-1", ToolCallStatus::InProgress));
    h.apply(status_update("tc-1", ToolCallStatus::InProgress));
    h.apply(status_update("tc-1", ToolCallStatus::Failed));

    assert_eq!(h.core.buffered_update_count("tc-1"), 2);

    h.apply(tool_call("tc-1", "Build", ToolCallStatus::Pending, None));
    assert_eq!(
        h.core.snapshot().tool_call("tc-1").expect("tc-1").status,
        ToolCallStatus::Failed
    );
}

/// Content fragments are debounced, then merged into one text fragment.
#[tokio::test(start_paused = true)]
async fn tool_content_is_debounced_and_merged() {
    let mut h = Harness::new();
    h.apply(tool_call("tc-1", "Run", ToolCallStatus::InProgress, None));

    for line in ["a\n", "b\n"] {
        h.apply(SessionUpdate::ToolCallUpdate(ToolCallUpdate {
            tool_call_id: "tc-1".into(),
            content: Some(vec![ToolCallContent::text(line)]),
            ..ToolCallUpdate::default()
        }));
    }
    assert!(h.core.has_pending_tool_content("tc-1"));
    assert!(h.core.snapshot().tool_call("tc-1").expect("tc-1").content.is_empty());

    assert_eq!(h.flush_next().await, FlushKey::ToolContent("tc-1".into()));

    let snapshot = h.core.snapshot();
    let content = &snapshot.tool_call("tc-1").expect("tc-1").content;
    assert_eq!(content.len(), 1);
    assert_eq!(content[0].as_text(), Some("a\nb\n"));
    assert!(!h.core.has_pending_tool_content("tc-1"));
}

/// A terminal status flushes buffered content at once.
#[tokio::test(start_paused = true)]
async fn terminal_status_flushes_content_immediately() {
    let mut h = Harness::new();
    h.apply(tool_call("tc-1", "Run", ToolCallStatus::InProgress, None));

    h.apply(SessionUpdate::ToolCallUpdate(ToolCallUpdate {
        tool_call_id: "tc-1".into(),
        status: Some(ToolCallStatus::Completed),
        content: Some(vec![ToolCallContent::text("done")]),
        ..ToolCallUpdate::default()
    }));

    assert!(!h.core.has_pending_tool_content("tc-1"));
    let snapshot = h.core.snapshot();
    assert_eq!(
        snapshot.tool_call("tc-1").expect("tc-1").content[0].as_text(),
        Some("done")
    );
}

/// Past the retention cap the oldest calls disappear.
#[tokio::test(start_paused = true)]
async fn oldest_tool_calls_are_evicted() {
    let mut h = Harness::with_streaming(StreamingConfig {
        tool_call_retention: 2,
        ..StreamingConfig::default()
    });

    for id in ["a", "b", "c"] {
        h.apply(tool_call(id, id, ToolCallStatus::Pending, None));
    }

    let snapshot = h.core.snapshot();
    let ids: Vec<&str> = snapshot
        .tool_calls
        .iter()
        .map(|c| c.tool_call_id.as_str())
        .collect();
    assert_eq!(ids, vec!["b", "c"]);
}

// ── Subagents ────────────────────────────────────────────────────────────────

/// Calls made while one Task is open are attributed to it.
#[tokio::test(start_paused = true)]
async fn calls_inside_a_task_get_its_parent() {
    let mut h = Harness::new();

    h.apply(tool_call("task-1", "Explore", ToolCallStatus::InProgress, task_meta()));
    h.apply(tool_call("read-1", "Read", ToolCallStatus::Pending, None));
    h.apply(status_update("task-1", ToolCallStatus::Completed));
    h.apply(tool_call("read-2", "Read", ToolCallStatus::Pending, None));

    let snapshot = h.core.snapshot();
    assert_eq!(snapshot.tool_call("task-1").expect("task").parent_tool_call_id, None);
    assert_eq!(
        snapshot
            .tool_call("read-1")
            .expect("read-1")
            .parent_tool_call_id
            .as_deref(),
        Some("task-1")
    );
    assert_eq!(
        snapshot.tool_call("read-2").expect("read-2").parent_tool_call_id,
        None
    );
}

/// A Task first seen through a titled update still groups the calls made inside it.
#[tokio::test(start_paused = true)]
async fn task_placeholder_from_update_opens_subagent() {
    let mut h = Harness::new();

    h.apply(SessionUpdate::ToolCallUpdate(ToolCallUpdate {
        tool_call_id: "task-1".into(),
        title: Some("Explore".into()),
        status: Some(ToolCallStatus::InProgress),
        meta: task_meta(),
        ..ToolCallUpdate::default()
    }));
    h.apply(tool_call("read-1", "Read", ToolCallStatus::Pending, None));
    h.apply(status_update("task-1", ToolCallStatus::Completed));
    h.apply(tool_call("read-2", "Read", ToolCallStatus::Pending, None));

    let snapshot = h.core.snapshot();
    assert_eq!(snapshot.tool_call("task-1").expect("task").parent_tool_call_id, None);
    assert_eq!(
        snapshot
            .tool_call("read-1")
            .expect("read-1")
            .parent_tool_call_id
            .as_deref(),
        Some("task-1")
    );
    assert_eq!(
        snapshot.tool_call("read-2").expect("read-2").parent_tool_call_id,
        None
    );
}

/// Two concurrent Tasks make attribution ambiguous.
#[tokio::test(start_paused = true)]
async fn concurrent_tasks_assign_no_parent() {
    let mut h = Harness::new();

    h.apply(tool_call("task-1", "A", ToolCallStatus::InProgress, task_meta()));
    h.apply(tool_call("task-2", "B", ToolCallStatus::Pending, task_meta()));
    h.apply(tool_call("read-1", "Read", ToolCallStatus::Pending, None));

    let snapshot = h.core.snapshot();
    assert_eq!(
        snapshot.tool_call("read-1").expect("read-1").parent_tool_call_id,
        None
    );
}

// ── Session metadata ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn plan_mode_and_commands_are_replaced() {
    let mut h = Harness::new();
    let mut revisions = h.core.subscribe();
    let _ = revisions.borrow_and_update();

    let entry = PlanEntry {
        content: "write tests".into(),
        priority: "high".into(),
        status: PlanEntryStatus::InProgress,
    };
    h.apply(SessionUpdate::Plan(vec![entry.clone()]));
    h.apply(SessionUpdate::CurrentMode("plan".into()));

    let snapshot = h.core.snapshot();
    assert_eq!(snapshot.plan, vec![entry]);
    assert_eq!(snapshot.current_mode_id.as_deref(), Some("plan"));
    assert!(revisions.has_changed().expect("sender alive"));
}

// ── Permissions and stream end ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn permission_request_is_queued_under_its_id() {
    let mut h = Harness::new();

    h.core.apply_event(AgentEvent::PermissionRequested {
        request_id: json!(4),
        request: Box::new(PermissionRequestParams {
            session_id: "s1".into(),
            tool_call: ToolCallUpdate {
                tool_call_id: "tc-1".into(),
                title: Some("Edit main.rs".into()),
                ..ToolCallUpdate::default()
            },
            options: vec![PermissionOption {
                option_id: "allow".into(),
                name: "Allow".into(),
                kind: "allow_once".into(),
            }],
        }),
    });

    let snapshot = h.core.snapshot();
    assert_eq!(snapshot.permissions.len(), 1);
    assert_eq!(snapshot.permissions[0].key, "4");
    assert_eq!(snapshot.permissions[0].request_id, json!(4));
}

/// Stream end outside a ready session only finishes the turn.
#[tokio::test(start_paused = true)]
async fn stream_end_completes_open_message() {
    let mut h = Harness::new();
    h.apply(agent_chunk("partial"));

    h.core.apply_event(AgentEvent::StreamClosed {
        reason: "stream closed".into(),
    });

    let snapshot = h.core.snapshot();
    assert!(snapshot.open_agent_message().is_none());
    assert_eq!(snapshot.messages[0].content, "partial");
    assert!(!snapshot.is_streaming);
    assert_eq!(snapshot.state, SessionState::Idle);
}

/// A barrier is acknowledged once reached.
#[tokio::test(start_paused = true)]
async fn barrier_is_acknowledged() {
    let mut h = Harness::new();
    let (tx, rx) = oneshot::channel();

    h.core.apply_event(AgentEvent::Barrier(tx));

    rx.await.expect("barrier acknowledged");
}

// ── Ordering ─────────────────────────────────────────────────────────────────

/// Observable result of a turn, without ids and timestamps.
#[derive(Debug, PartialEq)]
struct Outcome {
    messages: Vec<(MessageRole, String, bool)>,
    tool_calls: Vec<(String, String, ToolCallStatus, Option<String>, String)>,
    current_mode_id: Option<String>,
}

fn outcome(core: &SessionCore) -> Outcome {
    let snapshot = core.snapshot();
    Outcome {
        messages: snapshot
            .messages
            .iter()
            .map(|m| (m.role, m.content.clone(), m.is_complete))
            .collect(),
        tool_calls: snapshot
            .tool_calls
            .iter()
            .map(|c| {
                let text: String = c.content.iter().filter_map(|f| f.as_text()).collect();
                (
                    c.tool_call_id.clone(),
                    c.title.clone(),
                    c.status,
                    c.parent_tool_call_id.clone(),
                    text,
                )
            })
            .collect(),
        current_mode_id: snapshot.current_mode_id,
    }
}

fn content_update(id: &str, text: &str) -> SessionUpdate {
    SessionUpdate::ToolCallUpdate(ToolCallUpdate {
        tool_call_id: id.into(),
        content: Some(vec![ToolCallContent::text(text)]),
        ..ToolCallUpdate::default()
    })
}

fn turn() -> Vec<SessionUpdate> {
    vec![
        SessionUpdate::AgentThoughtChunk(ContentBlock::text("planning")),
        agent_chunk("Let me "),
        agent_chunk("check."),
        tool_call("task-1", "Explore", ToolCallStatus::InProgress, task_meta()),
        status_update("read-1", ToolCallStatus::InProgress),
        tool_call("read-1", "Read", ToolCallStatus::Pending, None),
        content_update("read-1", "line 1\n"),
        content_update("read-1", "line 2\n"),
        status_update("read-1", ToolCallStatus::Completed),
        SessionUpdate::CurrentMode("plan".into()),
        status_update("task-1", ToolCallStatus::Completed),
        agent_chunk("All "),
        agent_chunk("done."),
    ]
}

fn sequential_outcome() -> Outcome {
    let mut h = Harness::new();
    for update in turn() {
        h.apply(update);
    }
    h.core.end_turn();
    outcome(&h.core)
}

/// Run `turn()` through the notification loop, sleeping `delays[i]`
/// milliseconds before the i-th event.
async fn looped_outcome(delays: &[u64]) -> Outcome {
    let usage: Arc<dyn UsageRecorder> = Arc::new(UsageCounters::new());
    let mut core = SessionCore::new(StreamingConfig::default(), usage);
    let (ticks_tx, ticks_rx) = mpsc::unbounded_channel();
    core.begin_session("claude", PathBuf::from("/work"), &ticks_tx);
    drop(ticks_tx);
    let core = Arc::new(Mutex::new(core));
    let (events_tx, events_rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let processor = tokio::spawn(run_notification_loop(
        Arc::clone(&core),
        events_rx,
        ticks_rx,
        cancel.clone(),
    ));

    for (update, delay) in turn().into_iter().zip(delays.iter().cycle()) {
        tokio::time::sleep(Duration::from_millis(*delay)).await;
        events_tx
            .send(AgentEvent::SessionUpdate {
                session_id: "s1".into(),
                update: Box::new(update),
            })
            .await
            .expect("loop running");
    }
    let (ack_tx, ack_rx) = oneshot::channel();
    events_tx
        .send(AgentEvent::Barrier(ack_tx))
        .await
        .expect("loop running");
    ack_rx.await.expect("barrier acknowledged");
    cancel.cancel();
    processor.await.expect("loop exits");

    let mut core = core.lock().await;
    core.end_turn();
    outcome(&core)
}

/// However events are spaced in time, the loop ends where strictly
/// sequential application ends.
#[tokio::test(start_paused = true)]
async fn arrival_timing_does_not_change_outcome() {
    let expected = sequential_outcome();
    assert_eq!(expected.tool_calls[1].3.as_deref(), Some("task-1"));
    assert_eq!(expected.tool_calls[1].4, "line 1\nline 2\n");

    let patterns: [&[u64]; 4] = [
        &[0],
        &[1, 0, 250, 3],
        &[120, 5, 0, 0, 60, 400],
        &[30, 90, 15],
    ];
    for delays in patterns {
        assert_eq!(looped_outcome(delays).await, expected, "delays {delays:?}");
    }
}
