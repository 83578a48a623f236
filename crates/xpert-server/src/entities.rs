//! HTTP-facing entities: threads, runs and request payloads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;
use xpert_core::Command;

/// Thread lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    Open,
    Interrupted,
    Closed,
}

/// A conversation identity owning runs and checkpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: String,
    pub status: ThreadStatus,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(thread_id: impl Into<String>, metadata: HashMap<String, Value>) -> Self {
        Self {
            thread_id: thread_id.into(),
            status: ThreadStatus::Open,
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// One invocation of a compiled graph against a thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub thread_id: String,
    pub assistant_id: String,
    #[serde(default)]
    pub checkpoint_ns: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predecessor: Option<String>,
    pub status: RunApiStatus,
    pub inputs: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// Run status on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunApiStatus {
    Running,
    Success,
    Error,
    Interrupted,
    Aborted,
}

impl From<xpert_core::RunStatus> for RunApiStatus {
    fn from(status: xpert_core::RunStatus) -> Self {
        match status {
            xpert_core::RunStatus::Success => RunApiStatus::Success,
            xpert_core::RunStatus::Error => RunApiStatus::Error,
            xpert_core::RunStatus::Interrupted => RunApiStatus::Interrupted,
            xpert_core::RunStatus::Aborted => RunApiStatus::Aborted,
        }
    }
}

impl Run {
    pub fn new(thread_id: impl Into<String>, assistant_id: impl Into<String>, inputs: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            assistant_id: assistant_id.into(),
            checkpoint_ns: String::new(),
            checkpoint_id: None,
            parent_id: None,
            predecessor: None,
            status: RunApiStatus::Running,
            inputs,
            outputs: None,
            elapsed_ms: None,
            error: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

/// Thread creation payload
#[derive(Debug, Clone, Deserialize)]
pub struct ThreadCreate {
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub if_exists: IfExists,
}

/// Behavior when the requested thread id already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IfExists {
    #[default]
    Raise,
    DoNothing,
}

/// Thread search payload: server-side AND over metadata fields
#[derive(Debug, Clone, Deserialize)]
pub struct ThreadSearch {
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// The chat request carried by a run creation
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChatRequest {
    /// Human input text
    #[serde(default)]
    pub input: Option<String>,
    /// Declared agent parameters
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    #[serde(default)]
    pub files: Vec<Value>,
    /// Resume channel: `{resume?, update?, toolCalls?}`
    #[serde(default)]
    pub command: Option<Command>,
}

/// Run creation payload
#[derive(Debug, Clone, Deserialize)]
pub struct RunCreateStateful {
    pub assistant_id: String,
    #[serde(default)]
    pub input: ChatRequest,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Assistant search payload
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantSearch {
    #[serde(default)]
    pub graph_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Thread state response
#[derive(Debug, Clone, Serialize)]
pub struct ThreadState {
    pub values: Value,
    pub checkpoint: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_checkpoint: Option<Value>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}
