//! Tool call records and their partial updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::ContentBlock;

/// Category of action a tool call performs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Reads files or data.
    Read,
    /// Modifies files or content.
    Edit,
    /// Removes files or data.
    Delete,
    /// Moves or renames files.
    Move,
    /// Searches for information.
    Search,
    /// Pattern search over file contents.
    Grep,
    /// Runs commands or code.
    Execute,
    /// Internal reasoning.
    Think,
    /// Retrieves external data.
    Fetch,
    /// Switches the session mode.
    SwitchMode,
    /// Anything else.
    #[serde(other)]
    Other,
}

/// Execution status of a tool call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    /// Announced but not yet running.
    #[default]
    Pending,
    /// Running.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl ToolCallStatus {
    /// Whether no further status change is expected.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One fragment of tool call output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolCallContent {
    /// Regular content block.
    Content {
        /// The wrapped block.
        content: ContentBlock,
    },
    /// File modification shown as a diff.
    Diff {
        /// Absolute path of the file.
        path: String,
        /// Previous contents, absent for new files.
        #[serde(rename = "oldText", default, skip_serializing_if = "Option::is_none")]
        old_text: Option<String>,
        /// New contents.
        #[serde(rename = "newText")]
        new_text: String,
    },
    /// Embedded terminal output.
    Terminal {
        /// Terminal identifier.
        #[serde(rename = "terminalId")]
        terminal_id: String,
    },
}

impl ToolCallContent {
    /// Wrap text as a content fragment.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Content {
            content: ContentBlock::text(text),
        }
    }

    /// The text payload, if this fragment is plain text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Content { content } => content.as_text(),
            _ => None,
        }
    }
}

/// A file location affected by a tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCallLocation {
    /// Absolute file path.
    pub path: String,
    /// Optional 1-based line number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

/// A tool call as tracked on the timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Protocol-assigned identifier, unique within the session.
    pub tool_call_id: String,
    /// Display title; refined over time.
    pub title: String,
    /// Kind, if known yet.
    pub kind: Option<ToolKind>,
    /// Current status.
    pub status: ToolCallStatus,
    /// Accumulated output fragments.
    pub content: Vec<ToolCallContent>,
    /// Affected locations (last write wins).
    pub locations: Vec<ToolCallLocation>,
    /// Raw input parameters (last write wins).
    pub raw_input: Option<serde_json::Value>,
    /// Raw output (last write wins).
    pub raw_output: Option<serde_json::Value>,
    /// Creation time; never changes.
    pub timestamp: DateTime<Utc>,
    /// Conversational turn this call belongs to.
    pub iteration_id: Option<String>,
    /// Enclosing Task call, set at most once.
    pub parent_tool_call_id: Option<String>,
}

impl ToolCall {
    /// Create a pending call with the given id and title.
    #[must_use]
    pub fn new(tool_call_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            title: title.into(),
            kind: None,
            status: ToolCallStatus::Pending,
            content: Vec::new(),
            locations: Vec::new(),
            raw_input: None,
            raw_output: None,
            timestamp: Utc::now(),
            iteration_id: None,
            parent_tool_call_id: None,
        }
    }

    /// Build a placeholder for an update whose defining event has not arrived.
    ///
    /// Returns `None` unless the update carries a non-blank title.
    #[must_use]
    pub fn placeholder_from(update: &ToolCallUpdate) -> Option<Self> {
        let title = update.title.as_deref().map(str::trim).filter(|t| !t.is_empty())?;
        Some(Self::new(update.tool_call_id.clone(), title))
    }

    /// Apply the scalar fields of a partial update.
    ///
    /// Content fragments are handled by the caller so they can be coalesced.
    pub fn apply_fields(&mut self, update: &ToolCallUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(kind) = update.kind {
            self.kind = Some(kind);
        }
        if let Some(title) = update.title.as_deref() {
            if !title.trim().is_empty() {
                self.title = title.to_owned();
            }
        }
        if let Some(locations) = &update.locations {
            self.locations.clone_from(locations);
        }
        if let Some(raw_input) = &update.raw_input {
            self.raw_input = Some(raw_input.clone());
        }
        if let Some(raw_output) = &update.raw_output {
            self.raw_output = Some(raw_output.clone());
        }
    }
}

/// Partial update of an existing tool call. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallUpdate {
    /// Target call.
    pub tool_call_id: String,
    /// New status.
    #[serde(default)]
    pub status: Option<ToolCallStatus>,
    /// New kind.
    #[serde(default)]
    pub kind: Option<ToolKind>,
    /// New title; ignored when blank.
    #[serde(default)]
    pub title: Option<String>,
    /// Fragments to append.
    #[serde(default)]
    pub content: Option<Vec<ToolCallContent>>,
    /// Replacement locations.
    #[serde(default)]
    pub locations: Option<Vec<ToolCallLocation>>,
    /// Replacement raw input.
    #[serde(default)]
    pub raw_input: Option<serde_json::Value>,
    /// Replacement raw output.
    #[serde(default)]
    pub raw_output: Option<serde_json::Value>,
    /// Vendor metadata carried by the notification.
    #[serde(default, rename = "_meta")]
    pub meta: Option<serde_json::Value>,
}
