//! Parent assignment for tool calls made inside a subagent ("Task") call.
//!
//! The protocol does not nest tool calls. A vendor metadata marker
//! (`_meta.claudeCode.toolName == "Task"`) identifies calls that run a
//! subagent; while exactly one of them is open, every other new call is
//! attributed to it. With zero or several open there is no reliable signal,
//! so no parent is assigned. Agents without the marker simply get no
//! grouping.

use serde_json::Value;

/// Tool name the marker carries for subagent calls.
pub const TASK_TOOL_NAME: &str = "Task";

/// Vendor tool name from `_meta.claudeCode.toolName`, if present.
#[must_use]
pub fn vendor_tool_name(meta: Option<&Value>) -> Option<&str> {
    meta.and_then(|m| m.get("claudeCode"))
        .and_then(|v| v.get("toolName"))
        .and_then(Value::as_str)
}

/// Whether the metadata marks a subagent call.
#[must_use]
pub fn is_task_call(meta: Option<&Value>) -> bool {
    vendor_tool_name(meta) == Some(TASK_TOOL_NAME)
}

/// Set of currently open Task calls.
#[derive(Debug, Clone, Default)]
pub struct SubagentGrouper {
    open: Vec<String>,
}

impl SubagentGrouper {
    /// Create an empty grouper.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an open Task call. Re-opening is a no-op.
    pub fn open(&mut self, id: &str) {
        if !self.is_open(id) {
            self.open.push(id.to_owned());
        }
    }

    /// Close a Task call. Returns `true` if it was open.
    pub fn close(&mut self, id: &str) -> bool {
        let before = self.open.len();
        self.open.retain(|open| open != id);
        self.open.len() != before
    }

    /// Whether `id` is an open Task call.
    #[must_use]
    pub fn is_open(&self, id: &str) -> bool {
        self.open.iter().any(|open| open == id)
    }

    /// Number of open Task calls.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Parent for a new call: the single open Task, unless the call is a Task itself.
    #[must_use]
    pub fn parent_for(&self, is_task: bool) -> Option<String> {
        match self.open.as_slice() {
            [only] if !is_task => Some(only.clone()),
            _ => None,
        }
    }

    /// Forget every open Task call.
    pub fn clear(&mut self) {
        self.open.clear();
    }
}
