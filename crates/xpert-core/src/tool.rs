//! Tools and toolsets
//!
//! A [`Tool`] is a named, schema-described capability the model can call.
//! Tools are stateless from the scheduler's point of view; everything they
//! need at invocation time arrives in the [`ToolInvocation`] context. A
//! [`Toolset`] groups tools under a provider and owns their lifecycle
//! (`init_tools` / `close`).

use crate::command::Command;
use crate::messages::Message;
use crate::runtime::RunContext;
use crate::schema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A tool call emitted by the model. The `id` is preserved end-to-end so
/// the resulting tool message can be correlated back to this call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

/// What a tool invocation produced
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    /// A ready tool message; non-string content is stringified by the tool
    /// node
    Message(Message),
    /// A graph command (state update and/or navigation)
    Command(Command),
    /// Raw output wrapped into a tool message by the tool node
    Raw(Value),
}

/// Errors raised by tool execution
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum ToolError {
    #[error("Tool '{0}' not found. Available tools: {1}")]
    NotFound(String, String),

    #[error("Invalid arguments for tool '{tool}': {error}")]
    InvalidArguments { tool: String, error: String },

    #[error("Tool '{tool}' execution failed: {error}")]
    ExecutionFailed { tool: String, error: String },

    #[error("Tool '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    #[error("Tool '{tool}' aborted")]
    Aborted { tool: String },
}

/// Runtime context handed to every tool invocation
#[derive(Clone)]
pub struct ToolInvocation {
    /// Snapshot of the caller's state at invocation time
    pub state: Value,

    /// Id of the tool call being served
    pub tool_call_id: Option<String>,

    /// Toolset the tool came from, when applicable
    pub toolset_id: Option<String>,

    /// Run-scoped context: thread/run identity, env, store, signal, events
    pub run: RunContext,
}

impl ToolInvocation {
    pub fn new(state: Value, run: RunContext) -> Self {
        Self {
            state,
            tool_call_id: None,
            toolset_id: None,
            run,
        }
    }

    pub fn with_tool_call_id(mut self, id: impl Into<String>) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }

    pub fn with_toolset_id(mut self, id: impl Into<String>) -> Self {
        self.toolset_id = Some(id.into());
        self
    }
}

impl std::fmt::Debug for ToolInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolInvocation")
            .field("tool_call_id", &self.tool_call_id)
            .field("toolset_id", &self.toolset_id)
            .finish()
    }
}

/// Future returned by tool executors
pub type ToolFuture = Pin<Box<dyn Future<Output = Result<ToolOutcome, ToolError>> + Send>>;

/// Tool executor function type
pub type ToolExecutor = Arc<dyn Fn(Value, ToolInvocation) -> ToolFuture + Send + Sync>;

/// A callable tool
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// Input schema (neutral JSON Schema)
    pub schema: Value,
    pub executor: ToolExecutor,
    /// Sensitive tools are registered into `interrupt_before` at compile
    /// time so a human confirms them first
    pub sensitive: bool,
    /// Client-side tools are executed by the calling UI, not the server
    pub client_side: bool,
    /// End-node tools route to the agent's `next`/END instead of looping
    /// back into the model
    pub end_node: bool,
    /// Per-tool timeout override
    pub timeout: Option<Duration>,
    /// Provider-specific tool dict passed through untouched
    pub provider_dict: Option<Value>,
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        executor: ToolExecutor,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            executor,
            sensitive: false,
            client_side: false,
            end_node: false,
            timeout: None,
            provider_dict: None,
        }
    }

    /// Build a tool from an async closure returning a raw value
    pub fn from_fn<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        f: F,
    ) -> Self
    where
        F: Fn(Value, ToolInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let name = name.into();
        let executor_name = name.clone();
        let f = Arc::new(f);
        let executor: ToolExecutor = Arc::new(move |args, invocation| {
            let f = Arc::clone(&f);
            let name = executor_name.clone();
            Box::pin(async move {
                f(args, invocation)
                    .await
                    .map(ToolOutcome::Raw)
                    .map_err(|error| ToolError::ExecutionFailed { tool: name, error })
            })
        });
        Self::new(name, description, schema, executor)
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn client_side(mut self) -> Self {
        self.client_side = true;
        self
    }

    pub fn end_node(mut self) -> Self {
        self.end_node = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_provider_dict(mut self, dict: Value) -> Self {
        self.provider_dict = Some(dict);
        self
    }

    /// Validate args against the tool schema
    pub fn validate_args(&self, args: &Value) -> Result<(), ToolError> {
        schema::validate(&self.schema, args).map_err(|error| ToolError::InvalidArguments {
            tool: self.name.clone(),
            error,
        })
    }

    /// Validate and execute, honouring the abort signal and the tool
    /// timeout
    pub async fn invoke(
        &self,
        args: Value,
        invocation: ToolInvocation,
    ) -> Result<ToolOutcome, ToolError> {
        self.validate_args(&args)?;

        let signal = invocation.run.signal.clone();
        let fut = (self.executor)(args, invocation);

        let bounded: ToolFuture = match self.timeout {
            Some(timeout) => {
                let tool = self.name.clone();
                let timeout_ms = timeout.as_millis() as u64;
                Box::pin(async move {
                    tokio::time::timeout(timeout, fut)
                        .await
                        .map_err(|_| ToolError::Timeout { tool, timeout_ms })?
                })
            }
            None => fut,
        };

        tokio::select! {
            result = bounded => result,
            _ = signal.aborted() => Err(ToolError::Aborted { tool: self.name.clone() }),
        }
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("sensitive", &self.sensitive)
            .field("client_side", &self.client_side)
            .field("end_node", &self.end_node)
            .finish()
    }
}

/// A state variable a toolset contributes to the channel set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateVariable {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub default: Value,
}

/// A provider of tools with a lifecycle
#[async_trait::async_trait]
pub trait Toolset: Send + Sync {
    fn id(&self) -> &str;

    fn provider_name(&self) -> &str;

    /// Display title for a tool, when the provider overrides it
    fn tool_title(&self, _name: &str) -> Option<String> {
        None
    }

    /// Instantiate the toolset's tools
    async fn init_tools(&self) -> Result<Vec<Tool>, ToolError>;

    /// State variables this toolset declares
    fn variables(&self) -> Vec<StateVariable> {
        Vec::new()
    }

    /// Release resources; called on run finalize and abort
    async fn close(&self) {}
}

/// Toolset over a plain list of tools
pub struct SimpleToolset {
    id: String,
    provider: String,
    tools: Vec<Tool>,
    titles: HashMap<String, String>,
}

impl SimpleToolset {
    pub fn new(id: impl Into<String>, provider: impl Into<String>, tools: Vec<Tool>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            tools,
            titles: HashMap::new(),
        }
    }

    pub fn with_title(mut self, tool: impl Into<String>, title: impl Into<String>) -> Self {
        self.titles.insert(tool.into(), title.into());
        self
    }
}

#[async_trait::async_trait]
impl Toolset for SimpleToolset {
    fn id(&self) -> &str {
        &self.id
    }

    fn provider_name(&self) -> &str {
        &self.provider
    }

    fn tool_title(&self, name: &str) -> Option<String> {
        self.titles.get(name).cloned()
    }

    async fn init_tools(&self) -> Result<Vec<Tool>, ToolError> {
        Ok(self.tools.clone())
    }
}

/// Registry of compiled tools, keyed by name
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Tool) {
        self.tools.insert(tool.name.clone(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Tool>> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add_tool() -> Tool {
        Tool::from_fn(
            "add",
            "Add two numbers",
            json!({
                "type": "object",
                "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                "required": ["a", "b"],
            }),
            |args, _invocation| async move {
                let a = args["a"].as_f64().unwrap_or(0.0);
                let b = args["b"].as_f64().unwrap_or(0.0);
                Ok(json!(a + b))
            },
        )
    }

    #[tokio::test]
    async fn test_invoke_validates_args() {
        let tool = add_tool();
        let invocation = ToolInvocation::new(json!({}), RunContext::new("t1", "r1"));
        let err = tool.invoke(json!({"a": 2}), invocation).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn test_invoke_returns_raw_outcome() {
        let tool = add_tool();
        let invocation = ToolInvocation::new(json!({}), RunContext::new("t1", "r1"));
        let outcome = tool.invoke(json!({"a": 2, "b": 3}), invocation).await.unwrap();
        match outcome {
            ToolOutcome::Raw(value) => assert_eq!(value, json!(5.0)),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invoke_honours_timeout() {
        let slow = Tool::from_fn(
            "slow",
            "Sleeps forever",
            json!({"type": "object"}),
            |_args, _invocation| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!(null))
            },
        )
        .with_timeout(Duration::from_millis(20));

        let invocation = ToolInvocation::new(json!({}), RunContext::new("t1", "r1"));
        let err = slow.invoke(json!({}), invocation).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_invoke_honours_abort() {
        let slow = Tool::from_fn(
            "slow",
            "Sleeps forever",
            json!({"type": "object"}),
            |_args, _invocation| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!(null))
            },
        );

        let (handle, signal) = crate::runtime::abort_channel();
        let ctx = RunContext::new("t1", "r1").with_signal(signal);
        let invocation = ToolInvocation::new(json!({}), ctx);

        handle.abort();
        let err = slow.invoke(json!({}), invocation).await.unwrap_err();
        assert!(matches!(err, ToolError::Aborted { .. }));
    }

    #[tokio::test]
    async fn test_simple_toolset() {
        let toolset = SimpleToolset::new("ts1", "math", vec![add_tool()])
            .with_title("add", "Addition");
        assert_eq!(toolset.tool_title("add").as_deref(), Some("Addition"));
        let tools = toolset.init_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        toolset.close().await;
    }
}
