//! Graph control commands
//!
//! Nodes, tools and resume calls steer execution with a [`Command`]: apply
//! a state update, navigate to specific nodes (optionally with [`Send`]
//! payloads), carry a resume payload into the hook that raised an
//! interrupt, and rewrite the last AI message's tool calls after a
//! human-in-the-loop review.

use crate::send::Send;
use crate::tool::ToolCall;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Navigation target for the `goto` field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum GotoTarget {
    /// Single node name
    Node(String),
    /// Multiple nodes, same state
    Nodes(Vec<String>),
    /// Sends with per-task payloads
    Sends(Vec<Send>),
}

impl From<String> for GotoTarget {
    fn from(node: String) -> Self {
        GotoTarget::Node(node)
    }
}

impl From<&str> for GotoTarget {
    fn from(node: &str) -> Self {
        GotoTarget::Node(node.to_string())
    }
}

impl From<Vec<String>> for GotoTarget {
    fn from(nodes: Vec<String>) -> Self {
        GotoTarget::Nodes(nodes)
    }
}

impl From<Vec<Send>> for GotoTarget {
    fn from(sends: Vec<Send>) -> Self {
        GotoTarget::Sends(sends)
    }
}

/// Command controlling graph execution
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Command {
    /// Channel updates to apply: either `{channel: update}` or, inside an
    /// agent scope, a partial agent-channel update
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<Value>,

    /// Payload for the hook awaiting a resume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<Value>,

    /// Navigation override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goto: Option<GotoTarget>,

    /// Replacement tool calls for the last AI message (HITL rewrite)
    #[serde(rename = "toolCalls", skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Command {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_update(mut self, update: Value) -> Self {
        self.update = Some(update);
        self
    }

    pub fn with_resume(mut self, resume: Value) -> Self {
        self.resume = Some(resume);
        self
    }

    pub fn with_goto(mut self, goto: impl Into<GotoTarget>) -> Self {
        self.goto = Some(goto.into());
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = Some(tool_calls);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.update.is_none()
            && self.resume.is_none()
            && self.goto.is_none()
            && self.tool_calls.is_none()
    }

    /// Update as a list of (channel, value) writes. A non-object update is
    /// rejected by the scheduler when applied.
    pub fn update_writes(&self) -> Vec<(String, Value)> {
        match &self.update {
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }
}
