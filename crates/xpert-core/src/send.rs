//! Dynamic task dispatch
//!
//! A [`Send`] targets a named node with an overridden state payload. Routers
//! return sends to fan out — one task per tool call, each carrying its own
//! call — and the scheduler enqueues them as independent tasks within the
//! next step.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A directive to run a node with a custom payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Send {
    node: String,
    arg: Value,
}

impl Send {
    pub fn new(node: impl Into<String>, arg: Value) -> Self {
        Self {
            node: node.into(),
            arg,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn arg(&self) -> &Value {
        &self.arg
    }

    pub fn into_parts(self) -> (String, Value) {
        (self.node, self.arg)
    }
}
