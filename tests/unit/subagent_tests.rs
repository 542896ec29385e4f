//! Unit tests for subagent parent assignment.

use serde_json::json;

use acp_host::engine::subagent::{is_task_call, vendor_tool_name, SubagentGrouper, TASK_TOOL_NAME};

// ── Marker detection ─────────────────────────────────────────────────────────

#[test]
fn task_marker_is_detected() {
    let meta = json!({ "claudeCode": { "toolName": TASK_TOOL_NAME } });
    assert!(is_task_call(Some(&meta)));
    assert_eq!(vendor_tool_name(Some(&meta)), Some("Task"));
}

#[test]
fn other_tool_names_and_missing_meta_are_not_tasks() {
    let meta = json!({ "claudeCode": { "toolName": "Bash" } });
    assert!(!is_task_call(Some(&meta)));
    assert!(!is_task_call(Some(&json!({ "other": true }))));
    assert!(!is_task_call(None));
}

// ── Parent assignment ────────────────────────────────────────────────────────

/// A single open Task becomes the parent of non-Task calls.
#[test]
fn single_open_task_is_parent() {
    let mut grouper = SubagentGrouper::new();
    grouper.open("task-1");

    assert_eq!(grouper.parent_for(false).as_deref(), Some("task-1"));
    assert_eq!(grouper.parent_for(true), None, "Tasks are never nested");
}

/// Zero or several open Tasks give no parent.
#[test]
fn ambiguous_or_empty_gives_no_parent() {
    let mut grouper = SubagentGrouper::new();
    assert_eq!(grouper.parent_for(false), None);

    grouper.open("task-1");
    grouper.open("task-2");
    assert_eq!(grouper.parent_for(false), None);

    assert!(grouper.close("task-2"));
    assert_eq!(grouper.parent_for(false).as_deref(), Some("task-1"));
}

#[test]
fn open_is_idempotent_and_close_reports_membership() {
    let mut grouper = SubagentGrouper::new();
    grouper.open("task-1");
    grouper.open("task-1");
    assert_eq!(grouper.open_count(), 1);

    assert!(grouper.close("task-1"));
    assert!(!grouper.close("task-1"));
    assert!(!grouper.is_open("task-1"));
}

#[test]
fn clear_forgets_all_tasks() {
    let mut grouper = SubagentGrouper::new();
    grouper.open("a");
    grouper.open("b");
    grouper.clear();
    assert_eq!(grouper.open_count(), 0);
}
