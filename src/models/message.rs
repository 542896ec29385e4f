//! Timeline messages and prompt content blocks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of prompt or message content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain or markdown text.
    Text {
        /// The text itself.
        text: String,
    },
    /// Base64-encoded image.
    Image {
        /// Base64 payload.
        data: String,
        /// MIME type such as `image/png`.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Base64-encoded audio.
    Audio {
        /// Base64 payload.
        data: String,
        /// MIME type such as `audio/wav`.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Reference to a resource the agent can fetch itself.
    ResourceLink {
        /// Resource URI.
        uri: String,
        /// Display name.
        name: String,
    },
    /// Embedded resource contents, kept opaque.
    Resource {
        /// Raw resource object.
        resource: serde_json::Value,
    },
}

impl ContentBlock {
    /// Build a text block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// The text payload, if this is a text block.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Author of a timeline message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// The human operator.
    User,
    /// The agent.
    Agent,
    /// The engine itself (status notices, warnings).
    System,
}

/// One entry of the message timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageItem {
    /// Unique message identifier.
    pub id: String,
    /// Author.
    pub role: MessageRole,
    /// Accumulated text of all text blocks.
    pub content: String,
    /// Ordered structured content; adjacent text is merged into one block.
    pub content_blocks: Vec<ContentBlock>,
    /// `false` only while an agent message is still streaming.
    pub is_complete: bool,
    /// When the message was opened.
    pub start_time: DateTime<Utc>,
    /// Time from open to completion, stamped on completion.
    pub execution_time: Option<Duration>,
}

impl MessageItem {
    fn new(role: MessageRole, is_complete: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: String::new(),
            content_blocks: Vec::new(),
            is_complete,
            start_time: Utc::now(),
            execution_time: None,
        }
    }

    /// A complete user message built from the prompt blocks.
    #[must_use]
    pub fn user(blocks: Vec<ContentBlock>) -> Self {
        let mut message = Self::new(MessageRole::User, true);
        message.append_blocks(blocks);
        message
    }

    /// An open, incomplete agent message.
    #[must_use]
    pub fn agent_streaming() -> Self {
        Self::new(MessageRole::Agent, false)
    }

    /// A complete system notice.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        let mut message = Self::new(MessageRole::System, true);
        message.append_blocks(vec![ContentBlock::text(text)]);
        message
    }

    /// Whether this is the streaming agent message of the current turn.
    #[must_use]
    pub fn is_open_agent_message(&self) -> bool {
        self.role == MessageRole::Agent && !self.is_complete
    }

    /// Append blocks, merging adjacent text into the trailing text block.
    pub fn append_blocks(&mut self, blocks: Vec<ContentBlock>) {
        for block in blocks {
            if let ContentBlock::Text { text } = &block {
                self.content.push_str(text);
                if let Some(ContentBlock::Text { text: last }) = self.content_blocks.last_mut() {
                    last.push_str(text);
                    continue;
                }
            }
            self.content_blocks.push(block);
        }
    }

    /// Stamp the message complete and record its execution time.
    pub fn complete(&mut self) {
        if self.is_complete {
            return;
        }
        self.is_complete = true;
        self.execution_time = (Utc::now() - self.start_time).to_std().ok();
    }
}
