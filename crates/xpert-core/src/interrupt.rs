//! Interrupts and resume validation
//!
//! Hooks and tool wrappers suspend a run by raising an
//! [`InterruptSignal`]; the runner catches it, persists state, writes an
//! [`InterruptRecord`] and ends the run INTERRUPTED. A later resume command
//! is validated against the record — decision counts for human review,
//! `tool_call_id` correspondence for client tools — and each record is
//! consumed exactly once: resuming twice with the same command is a no-op
//! that returns the recorded outcome.

use crate::messages::Message;
use crate::tool::ToolCall;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// Kind of interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    /// Human-in-the-loop review of tool calls
    Hitl,
    /// Tool executed by the calling client
    ClientTool,
    /// Confirmation before a sensitive node
    Confirm,
}

impl std::fmt::Display for InterruptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterruptKind::Hitl => write!(f, "hitl"),
            InterruptKind::ClientTool => write!(f, "client_tool"),
            InterruptKind::Confirm => write!(f, "confirm"),
        }
    }
}

/// The typed signal a hook raises to suspend the run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptSignal {
    pub kind: InterruptKind,
    /// Payload streamed to the client in the `on_interrupt` event
    pub payload: Value,
    /// Tool calls awaiting a decision or client execution
    #[serde(default)]
    pub pending_tool_calls: Vec<ToolCall>,
}

impl InterruptSignal {
    pub fn hitl(payload: Value, pending_tool_calls: Vec<ToolCall>) -> Self {
        Self {
            kind: InterruptKind::Hitl,
            payload,
            pending_tool_calls,
        }
    }

    pub fn client_tool(tool_call: ToolCall) -> Self {
        let payload = serde_json::json!({ "clientToolCalls": [tool_call.clone()] });
        Self {
            kind: InterruptKind::ClientTool,
            payload,
            pending_tool_calls: vec![tool_call],
        }
    }

    pub fn confirm(node: &str, payload: Value) -> Self {
        Self {
            kind: InterruptKind::Confirm,
            payload: serde_json::json!({ "node": node, "payload": payload }),
            pending_tool_calls: Vec::new(),
        }
    }
}

/// A tool call presented for human review
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub name: String,
    pub args: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Decisions a reviewer may take on a tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionType {
    Approve,
    Edit,
    Reject,
}

/// Review configuration for one interruptible tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    pub allowed_decisions: Vec<DecisionType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Schema constraining edited arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args_schema: Option<Value>,
}

impl ReviewConfig {
    pub fn new(allowed_decisions: Vec<DecisionType>) -> Self {
        Self {
            allowed_decisions,
            description: None,
            args_schema: None,
        }
    }

    pub fn allows(&self, decision: DecisionType) -> bool {
        self.allowed_decisions.contains(&decision)
    }
}

/// One reviewer decision, paired 1:1 with an interrupted tool call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Edit {
        name: String,
        args: Value,
    },
    Reject {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Decision {
    pub fn decision_type(&self) -> DecisionType {
        match self {
            Decision::Approve => DecisionType::Approve,
            Decision::Edit { .. } => DecisionType::Edit,
            Decision::Reject { .. } => DecisionType::Reject,
        }
    }
}

/// Resume payload of a HITL interrupt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlResume {
    pub decisions: Vec<Decision>,
}

/// Resume payload of a client-tool interrupt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientToolResume {
    #[serde(rename = "toolMessages")]
    pub tool_messages: Vec<Message>,
}

/// Durable record of a pending interrupt, keyed by (thread, run)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptRecord {
    pub thread_id: String,
    pub run_id: String,
    pub kind: InterruptKind,
    pub payload: Value,
    pub pending_tool_calls: Vec<ToolCall>,
    /// Set once consumed; the run that performed the resume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_by: Option<String>,
}

impl InterruptRecord {
    pub fn from_signal(
        thread_id: impl Into<String>,
        run_id: impl Into<String>,
        signal: &InterruptSignal,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            kind: signal.kind,
            payload: signal.payload.clone(),
            pending_tool_calls: signal.pending_tool_calls.clone(),
            resumed_by: None,
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.resumed_by.is_some()
    }
}

/// Outcome of attempting to consume an interrupt record
pub enum ConsumeOutcome {
    /// First resume; caller should execute it
    Fresh(InterruptRecord),
    /// The record was already consumed by this run — idempotent no-op
    AlreadyConsumed { resumed_by: String },
}

/// In-process registry of pending interrupts
#[derive(Default)]
pub struct InterruptManager {
    records: RwLock<HashMap<(String, String), InterruptRecord>>,
    latest_by_thread: RwLock<HashMap<String, String>>,
}

impl InterruptManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, record: InterruptRecord) {
        let key = (record.thread_id.clone(), record.run_id.clone());
        self.latest_by_thread
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(record.thread_id.clone(), record.run_id.clone());
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, record);
    }

    /// The latest interrupt for a thread, consumed or not
    pub fn latest_for_thread(&self, thread_id: &str) -> Option<InterruptRecord> {
        let latest = self
            .latest_by_thread
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let run_id = latest.get(thread_id)?;
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(thread_id.to_string(), run_id.clone()))
            .cloned()
    }

    /// Consume the thread's pending interrupt. The first call wins;
    /// subsequent calls observe the recorded resume.
    pub fn consume(&self, thread_id: &str) -> Option<ConsumeOutcome> {
        let record = self.latest_for_thread(thread_id)?;
        if let Some(resumed_by) = record.resumed_by.clone() {
            return Some(ConsumeOutcome::AlreadyConsumed { resumed_by });
        }
        Some(ConsumeOutcome::Fresh(record))
    }

    /// Mark the interrupt consumed by `resumed_by`
    pub fn mark_consumed(&self, thread_id: &str, run_id: &str, resumed_by: impl Into<String>) {
        let mut records = self
            .records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(record) = records.get_mut(&(thread_id.to_string(), run_id.to_string())) {
            record.resumed_by = Some(resumed_by.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn signal() -> InterruptSignal {
        InterruptSignal::hitl(
            json!({"requests": [{"name": "dangerous", "args": {"x": 1}}]}),
            vec![ToolCall::new("t9", "dangerous", json!({"x": 1}))],
        )
    }

    #[test]
    fn test_register_and_latest() {
        let manager = InterruptManager::new();
        manager.register(InterruptRecord::from_signal("t1", "r1", &signal()));

        let record = manager.latest_for_thread("t1").unwrap();
        assert_eq!(record.kind, InterruptKind::Hitl);
        assert_eq!(record.pending_tool_calls.len(), 1);
        assert!(manager.latest_for_thread("t2").is_none());
    }

    #[test]
    fn test_consume_exactly_once() {
        let manager = InterruptManager::new();
        manager.register(InterruptRecord::from_signal("t1", "r1", &signal()));

        match manager.consume("t1").unwrap() {
            ConsumeOutcome::Fresh(record) => {
                manager.mark_consumed(&record.thread_id, &record.run_id, "r2");
            }
            ConsumeOutcome::AlreadyConsumed { .. } => panic!("first consume must be fresh"),
        }

        match manager.consume("t1").unwrap() {
            ConsumeOutcome::AlreadyConsumed { resumed_by } => assert_eq!(resumed_by, "r2"),
            ConsumeOutcome::Fresh(_) => panic!("second consume must be idempotent"),
        }
    }

    #[test]
    fn test_decision_parsing() {
        let resume: HitlResume = serde_json::from_value(json!({
            "decisions": [
                {"type": "approve"},
                {"type": "edit", "name": "safe", "args": {"x": 2}},
                {"type": "reject", "message": "nope"},
            ]
        }))
        .unwrap();
        assert_eq!(resume.decisions.len(), 3);
        assert_eq!(resume.decisions[0].decision_type(), DecisionType::Approve);
        match &resume.decisions[2] {
            Decision::Reject { message } => assert_eq!(message.as_deref(), Some("nope")),
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn test_client_tool_signal_payload() {
        let call = ToolCall::new("c1", "browser.open", json!({"url": "https://example.com"}));
        let signal = InterruptSignal::client_tool(call);
        assert_eq!(signal.payload["clientToolCalls"][0]["id"], json!("c1"));
    }
}
