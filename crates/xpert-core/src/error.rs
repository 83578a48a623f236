//! Error types for the graph runtime
//!
//! Errors are typed by category (spec: configuration, input, recursion and
//! timeout, tool, model, infrastructure) rather than by exception class, so
//! the runner and the HTTP surface can route them without string matching.

use crate::interrupt::InterruptSignal;
use thiserror::Error;

/// Errors raised while compiling or executing a graph
#[derive(Debug, Error)]
pub enum GraphError {
    /// Invalid declarative graph, missing model, duplicate middleware name,
    /// path-map mismatch. Fatal at compile time.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid caller input: malformed resume command, wrong decision
    /// count, tool-call id mismatch, unknown tool in a selector output.
    /// Fatal for the run; nothing is committed.
    #[error("Input error: {0}")]
    Input(String),

    /// The run exceeded its step ceiling
    #[error("{}", recursion_limit_message(*.limit, .language))]
    RecursionLimit { limit: usize, language: String },

    /// The run or a tool call exceeded its time budget
    #[error("{}", timeout_message(.operation, *.duration_ms, .language))]
    Timeout {
        operation: String,
        duration_ms: u64,
        language: String,
    },

    /// A tool failed and `handle_tool_errors` was disabled
    #[error("Tool '{tool}' failed: {error}")]
    Tool { tool: String, error: String },

    /// The chat model failed and no error-handling policy recovered it
    #[error("Model call failed: {0}")]
    Model(String),

    /// A node executor failed
    #[error("Node '{node}' execution failed: {error}")]
    NodeExecution { node: String, error: String },

    /// Execution was suspended by an interrupt; not a failure. The runner
    /// catches this variant, persists state and ends the run INTERRUPTED.
    #[error("Graph interrupted: {}", .0.kind)]
    Interrupt(InterruptSignal),

    /// The run was cancelled via its abort signal
    #[error("Run aborted")]
    Aborted,

    /// Checkpoint store or another piece of infrastructure failed. The run
    /// is marked ABORTED; the latest persisted checkpoint stays valid.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] xpert_checkpoint::CheckpointError),

    /// Serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GraphError {
    pub fn configuration(message: impl Into<String>) -> Self {
        GraphError::Configuration(message.into())
    }

    pub fn input(message: impl Into<String>) -> Self {
        GraphError::Input(message.into())
    }

    pub fn node(node: impl Into<String>, error: impl Into<String>) -> Self {
        GraphError::NodeExecution {
            node: node.into(),
            error: error.into(),
        }
    }

    /// Whether the error is an interrupt rather than a failure
    pub fn is_interrupt(&self) -> bool {
        matches!(self, GraphError::Interrupt(_))
    }
}

/// Localized message for the recursion-limit error
fn recursion_limit_message(limit: usize, language: &str) -> String {
    match language {
        "zh" | "zh-Hans" => format!("已达到递归上限（{limit} 步），请检查智能体是否陷入循环"),
        _ => format!("Recursion limit of {limit} steps reached; the agent appears to be stuck in a loop"),
    }
}

/// Localized message for timeout errors
fn timeout_message(operation: &str, duration_ms: u64, language: &str) -> String {
    match language {
        "zh" | "zh-Hans" => format!("{operation} 执行超时（{duration_ms} 毫秒）"),
        _ => format!("{operation} timed out after {duration_ms}ms"),
    }
}

/// Result alias for runtime operations
pub type Result<T> = std::result::Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recursion_limit_localization() {
        let en = GraphError::RecursionLimit {
            limit: 4,
            language: "en".to_string(),
        };
        assert!(en.to_string().contains("Recursion limit of 4"));

        let zh = GraphError::RecursionLimit {
            limit: 4,
            language: "zh".to_string(),
        };
        assert!(zh.to_string().contains("递归上限"));
    }

    #[test]
    fn test_timeout_message() {
        let err = GraphError::Timeout {
            operation: "tool 'search'".to_string(),
            duration_ms: 5000,
            language: "en".to_string(),
        };
        assert!(err.to_string().contains("timed out after 5000ms"));
    }
}
