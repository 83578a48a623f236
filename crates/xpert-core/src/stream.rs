//! Streaming event bus
//!
//! Every run owns one [`EventBus`]; nodes, middlewares and the runner emit
//! typed [`RunEvent`]s into it and the transport adapter (SSE in the server
//! crate) drains the other end. Events carry a tag path checked against the
//! run's [`MutePolicy`]: an event is emitted iff no prefix of its tag path
//! is muted without a more specific unmute.
//!
//! Keep-alive is a transport concern and lives in the SSE adapter, not here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Events emitted during a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum RunEvent {
    #[serde(rename = "on_run_start")]
    RunStart { run_id: String },

    #[serde(rename = "on_run_end")]
    RunEnd { run_id: String, outputs: Value },

    #[serde(rename = "on_run_error")]
    RunError { run_id: String, error: String },

    #[serde(rename = "on_agent_start")]
    AgentStart {
        execution_id: String,
        agent_key: String,
    },

    #[serde(rename = "on_agent_end")]
    AgentEnd { execution: Value },

    /// Token delta from a streaming model call
    #[serde(rename = "on_chat_message_chunk")]
    ChatMessageChunk {
        delta: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        agent_key: String,
    },

    #[serde(rename = "on_tool_start")]
    ToolStart {
        name: String,
        tool_call_id: String,
        args: Value,
    },

    #[serde(rename = "on_tool_end")]
    ToolEnd {
        name: String,
        tool_call_id: String,
        output: Value,
    },

    #[serde(rename = "on_tool_error")]
    ToolError {
        name: String,
        tool_call_id: String,
        error: String,
    },

    #[serde(rename = "on_interrupt")]
    Interrupt { payload: Value },

    /// Fire-and-forget effect executed by the client UI; no interrupt
    #[serde(rename = "on_client_effect")]
    ClientEffect { payload: Value },

    #[serde(rename = "on_checkpoint")]
    Checkpoint { checkpoint_id: String },
}

impl RunEvent {
    /// Wire name of the event
    pub fn event_name(&self) -> &'static str {
        match self {
            RunEvent::RunStart { .. } => "on_run_start",
            RunEvent::RunEnd { .. } => "on_run_end",
            RunEvent::RunError { .. } => "on_run_error",
            RunEvent::AgentStart { .. } => "on_agent_start",
            RunEvent::AgentEnd { .. } => "on_agent_end",
            RunEvent::ChatMessageChunk { .. } => "on_chat_message_chunk",
            RunEvent::ToolStart { .. } => "on_tool_start",
            RunEvent::ToolEnd { .. } => "on_tool_end",
            RunEvent::ToolError { .. } => "on_tool_error",
            RunEvent::Interrupt { .. } => "on_interrupt",
            RunEvent::ClientEffect { .. } => "on_client_effect",
            RunEvent::Checkpoint { .. } => "on_checkpoint",
        }
    }

    /// Tag path used by the mute policy
    pub fn tag_path(&self) -> Vec<String> {
        match self {
            RunEvent::RunStart { .. } => vec!["run".into(), "start".into()],
            RunEvent::RunEnd { .. } => vec!["run".into(), "end".into()],
            RunEvent::RunError { .. } => vec!["run".into(), "error".into()],
            RunEvent::AgentStart { agent_key, .. } => {
                vec!["agent".into(), agent_key.clone(), "start".into()]
            }
            RunEvent::AgentEnd { .. } => vec!["agent".into(), "end".into()],
            RunEvent::ChatMessageChunk { agent_key, .. } => {
                vec!["chat".into(), agent_key.clone(), "delta".into()]
            }
            RunEvent::ToolStart { name, .. } => {
                vec!["tool".into(), name.clone(), "start".into()]
            }
            RunEvent::ToolEnd { name, .. } => vec!["tool".into(), name.clone(), "end".into()],
            RunEvent::ToolError { name, .. } => {
                vec!["tool".into(), name.clone(), "error".into()]
            }
            RunEvent::Interrupt { .. } => vec!["interrupt".into()],
            RunEvent::ClientEffect { .. } => vec!["client_effect".into()],
            RunEvent::Checkpoint { .. } => vec!["checkpoint".into()],
        }
    }
}

/// Tag-path filters controlling which events leave the run.
///
/// Paths are segment lists; `mute: [["tool"]]` drops every tool event,
/// `unmute: [["tool", "search"]]` restores events for that one tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutePolicy {
    #[serde(default)]
    pub mute: Vec<Vec<String>>,
    #[serde(default)]
    pub unmute: Vec<Vec<String>>,
}

impl MutePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mute(mut self, path: &[&str]) -> Self {
        self.mute.push(path.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn unmute(mut self, path: &[&str]) -> Self {
        self.unmute.push(path.iter().map(|s| s.to_string()).collect());
        self
    }

    fn longest_prefix(paths: &[Vec<String>], tag: &[String]) -> Option<usize> {
        paths
            .iter()
            .filter(|p| p.len() <= tag.len() && tag[..p.len()] == p[..])
            .map(|p| p.len())
            .max()
    }

    /// Whether an event with this tag path may be emitted
    pub fn allows(&self, tag: &[String]) -> bool {
        match Self::longest_prefix(&self.mute, tag) {
            None => true,
            Some(muted) => match Self::longest_prefix(&self.unmute, tag) {
                Some(unmuted) => unmuted >= muted,
                None => false,
            },
        }
    }
}

/// Error returned when the event receiver is gone (client disconnected)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamClosed;

impl std::fmt::Display for StreamClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "event stream closed")
    }
}

impl std::error::Error for StreamClosed {}

/// Per-run event emitter.
///
/// Cheap to clone; all clones feed the same receiver. `emit` applies the
/// mute policy and reports [`StreamClosed`] when the consumer went away so
/// the runner can trip the abort signal.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<RunEvent>,
    policy: std::sync::Arc<MutePolicy>,
}

impl EventBus {
    /// Create a bus and its receiving end
    pub fn channel(policy: MutePolicy) -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                policy: std::sync::Arc::new(policy),
            },
            rx,
        )
    }

    /// Bus that drops everything; for runs nobody is watching. Emits
    /// report [`StreamClosed`], which callers of fire-and-forget events
    /// ignore.
    pub fn sink() -> Self {
        let (bus, rx) = Self::channel(MutePolicy::default());
        drop(rx);
        bus
    }

    /// Emit an event, subject to the mute policy
    pub fn emit(&self, event: RunEvent) -> Result<(), StreamClosed> {
        if !self.policy.allows(&event.tag_path()) {
            tracing::trace!(event = event.event_name(), "event muted");
            return Ok(());
        }
        self.tx.send(event).map_err(|_| StreamClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}
