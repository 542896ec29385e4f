//! Bounded, insertion-ordered tool call registry.
//!
//! Calls are indexed by id and iterated in creation order. Upserts merge in
//! place without reordering. Past the retention cap the oldest ids are
//! evicted whole.

use std::collections::{HashMap, VecDeque};

use crate::models::message::ContentBlock;
use crate::models::tool_call::{ToolCall, ToolCallContent};

/// Result of [`ToolCallStore::upsert`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// `true` when the id was new.
    pub inserted: bool,
    /// Ids evicted to stay within the cap, oldest first.
    pub evicted: Vec<String>,
}

/// Tool call registry.
#[derive(Debug, Clone)]
pub struct ToolCallStore {
    calls: HashMap<String, ToolCall>,
    order: VecDeque<String>,
    last_fragment: HashMap<String, String>,
    capacity: usize,
}

impl ToolCallStore {
    /// Create a store holding at most `capacity` calls (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            calls: HashMap::new(),
            order: VecDeque::new(),
            last_fragment: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Look up a call.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ToolCall> {
        self.calls.get(id)
    }

    /// Look up a call for in-place mutation.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut ToolCall> {
        self.calls.get_mut(id)
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.calls.contains_key(id)
    }

    /// Number of calls held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Ids in creation order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Calls in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &ToolCall> {
        self.order.iter().filter_map(|id| self.calls.get(id))
    }

    /// Insert `call`, or merge it into the existing record with the same id.
    ///
    /// Merge rules: non-blank title, present kind, non-empty locations, and
    /// present raw payloads replace; content is appended and coalesced;
    /// timestamp, iteration, and an already-set parent are kept. A terminal
    /// status is never regressed by a late defining event.
    pub fn upsert(&mut self, call: ToolCall) -> UpsertOutcome {
        let id = call.tool_call_id.clone();

        if self.calls.contains_key(&id) {
            let fragments = {
                let Some(existing) = self.calls.get_mut(&id) else {
                    return UpsertOutcome::default();
                };
                merge_call(existing, call)
            };
            self.append_content(&id, fragments);
            return UpsertOutcome::default();
        }

        let mut call = call;
        let fragments = std::mem::take(&mut call.content);
        self.calls.insert(id.clone(), call);
        self.order.push_back(id.clone());
        self.append_content(&id, fragments);

        UpsertOutcome {
            inserted: true,
            evicted: self.evict_overflow(),
        }
    }

    /// Append output fragments to a call.
    ///
    /// Returns `false` if `id` is unknown.
    pub fn append_content(&mut self, id: &str, fragments: Vec<ToolCallContent>) -> bool {
        let Some(call) = self.calls.get_mut(id) else {
            return false;
        };
        let last = self.last_fragment.entry(id.to_owned()).or_default();
        merge_fragments(&mut call.content, last, fragments);
        true
    }

    /// Remove every call.
    pub fn clear(&mut self) {
        self.calls.clear();
        self.order.clear();
        self.last_fragment.clear();
    }

    fn evict_overflow(&mut self) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.order.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.calls.remove(&oldest);
            self.last_fragment.remove(&oldest);
            evicted.push(oldest);
        }
        evicted
    }
}

/// Merge scalar fields of `incoming` into `existing`; returns incoming content.
fn merge_call(existing: &mut ToolCall, incoming: ToolCall) -> Vec<ToolCallContent> {
    if !incoming.title.trim().is_empty() {
        existing.title = incoming.title;
    }
    if incoming.kind.is_some() {
        existing.kind = incoming.kind;
    }
    if !(existing.status.is_terminal() && !incoming.status.is_terminal()) {
        existing.status = incoming.status;
    }
    if !incoming.locations.is_empty() {
        existing.locations = incoming.locations;
    }
    if incoming.raw_input.is_some() {
        existing.raw_input = incoming.raw_input;
    }
    if incoming.raw_output.is_some() {
        existing.raw_output = incoming.raw_output;
    }
    if existing.iteration_id.is_none() {
        existing.iteration_id = incoming.iteration_id;
    }
    if existing.parent_tool_call_id.is_none() {
        existing.parent_tool_call_id = incoming.parent_tool_call_id;
    }
    incoming.content
}

/// Append `incoming` to `content`, coalescing text.
///
/// A text fragment byte-identical to the previously appended one (`last`) is
/// dropped. Distinct text is merged into a trailing text fragment instead of
/// growing the list. Non-text fragments are appended as-is and reset `last`.
pub fn merge_fragments(
    content: &mut Vec<ToolCallContent>,
    last: &mut String,
    incoming: Vec<ToolCallContent>,
) {
    for fragment in incoming {
        let Some(text) = fragment.as_text() else {
            last.clear();
            content.push(fragment);
            continue;
        };

        let tail = content.last().and_then(ToolCallContent::as_text).is_some();
        if tail && !last.is_empty() && text == last.as_str() {
            continue;
        }

        let text = text.to_owned();
        if tail {
            if let Some(ToolCallContent::Content {
                content: ContentBlock::Text { text: existing },
            }) = content.last_mut()
            {
                existing.push_str(&text);
            }
        } else {
            content.push(fragment);
        }
        *last = text;
    }
}
