//! Message types for conversational agents
//!
//! The message model mirrors what chat-model APIs exchange: system, human,
//! assistant and tool messages, with tool calls attached to assistant
//! messages and `tool_call_id` correlating each tool result back to the
//! call that produced it. The [`add_messages`] reducer merges message lists
//! with id-based de-duplication and honours [`RemoveMessage`] markers.

use crate::tool::ToolCall;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use xpert_checkpoint::channels::REMOVE_MARKER;

/// Role of the message sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Instructions and context for the model
    System,
    /// End-user input
    Human,
    /// Model output; may carry tool calls
    Assistant,
    /// Result of a tool invocation
    Tool,
}

/// Delivery status of a tool message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolMessageStatus {
    Success,
    Error,
}

/// A single message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique id, used for de-duplication and targeted removal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Role of the sender
    pub role: MessageRole,

    /// Message content
    pub content: String,

    /// Optional sender name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Tool calls (assistant messages)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// Correlates a tool message with the call that produced it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Tool message status; `error` signals a recoverable failure the model
    /// should see
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ToolMessageStatus>,

    /// Additional metadata (provider, model, usage)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Some(Uuid::new_v4().to_string()),
            role,
            content: content.into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
            status: None,
            metadata: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn human(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Human, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Alias for [`Message::assistant`]
    pub fn ai(content: impl Into<String>) -> Self {
        Self::assistant(content)
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            id: Some(Uuid::new_v4().to_string()),
            role: MessageRole::Tool,
            content: content.into(),
            name: None,
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            status: Some(ToolMessageStatus::Success),
            metadata: None,
        }
    }

    /// Tool message carrying an error the model can recover from
    pub fn tool_error(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        let mut message = Self::tool(content, tool_call_id);
        message.status = Some(ToolMessageStatus::Error);
        message
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = Some(tool_calls);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_ai(&self) -> bool {
        self.role == MessageRole::Assistant
    }

    pub fn is_tool(&self) -> bool {
        self.role == MessageRole::Tool
    }

    /// Tool calls of this message, empty when none
    pub fn tool_calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or(&[])
    }

    pub fn ensure_id(&mut self) {
        if self.id.is_none() {
            self.id = Some(Uuid::new_v4().to_string());
        }
    }

    /// Serialize for a channel write
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Marker deleting a message by id from a messages channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveMessage {
    pub id: String,
}

impl RemoveMessage {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Channel write form understood by the messages reducer
    pub fn to_marker(&self) -> Value {
        serde_json::json!({ REMOVE_MARKER: self.id })
    }
}

/// Merge two message lists with id-based de-duplication.
///
/// Messages on the right with an id already present on the left replace the
/// existing entry in place; new messages are appended. Missing ids are
/// generated so later merges stay stable.
pub fn add_messages(left: Vec<Message>, right: Vec<Message>) -> Vec<Message> {
    let mut merged = left;
    for mut message in right {
        message.ensure_id();
        let position = message.id.as_deref().and_then(|id| {
            merged
                .iter()
                .position(|m| m.id.as_deref() == Some(id))
        });
        match position {
            Some(idx) => merged[idx] = message,
            None => merged.push(message),
        }
    }
    merged
}

/// Parse a channel value into messages, skipping malformed entries
pub fn messages_from_value(value: &Value) -> Vec<Message> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
        _ => Vec::new(),
    }
}

/// Last AI message of a list, if any
pub fn last_ai_message(messages: &[Message]) -> Option<&Message> {
    messages.iter().rev().find(|m| m.is_ai())
}
