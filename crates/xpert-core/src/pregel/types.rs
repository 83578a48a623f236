//! Scheduler task types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A unit of work in the frontier: a node to run, optionally with a
/// payload carried by the `Send` that created it.
///
/// Tasks serialize into checkpoint metadata so an interrupted run resumes
/// with exactly the frontier it suspended with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub node: String,
    /// Payload from a `Send`, when fanned out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_arg: Option<Value>,
    /// Node that routed into this task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predecessor: Option<String>,
}

impl Task {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            node: node.into(),
            send_arg: None,
            predecessor: None,
        }
    }

    pub fn with_send_arg(mut self, arg: Value) -> Self {
        self.send_arg = Some(arg);
        self
    }

    pub fn with_predecessor(mut self, predecessor: impl Into<String>) -> Self {
        self.predecessor = Some(predecessor.into());
        self
    }
}

/// Result of one executed task within a step
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task: Task,
    /// Channel writes the task produced
    pub writes: Vec<(String, Value)>,
    /// Navigation override from a command, replacing the routers
    pub goto: Option<crate::command::GotoTarget>,
}
