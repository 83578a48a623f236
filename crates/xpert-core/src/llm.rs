//! Chat model interface
//!
//! The runtime depends only on the [`ChatModel`] trait; concrete provider
//! SDKs live outside the core and are chosen at startup by a registry keyed
//! by model name. [`MockChatModel`] replays a script of completions and is
//! the model used throughout the test suite.

use crate::error::{GraphError, Result};
use crate::ledger::ModelUsage;
use crate::messages::Message;
use crate::runtime::AbortSignal;
use crate::tool::ToolCall;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Declaration of a callable tool as seen by the model
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments
    pub parameters: Value,
    /// Provider-specific tool dict, forwarded untouched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_dict: Option<Value>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            provider_dict: None,
        }
    }

    pub fn with_provider_dict(mut self, dict: Value) -> Self {
        self.provider_dict = Some(dict);
        self
    }
}

/// A model invocation request as assembled by the agent's `call_model` node
/// and transformed by the `wrap_model_call` middleware chain.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    /// Model name; `None` means the configured default
    pub model: Option<String>,
    /// System message, when present
    pub system: Option<String>,
    /// Conversation messages in prompt order
    pub messages: Vec<Message>,
    /// Tools offered to the model
    pub tools: Vec<ToolDefinition>,
    /// Provider tool-choice directive
    pub tool_choice: Option<Value>,
    /// Snapshot of the agent channel at call time
    pub state: Value,
    /// Run cancellation signal; wrappers making nested model calls must
    /// pass it along
    pub signal: AbortSignal,
}

impl ModelRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            model: None,
            system: None,
            messages,
            tools: Vec::new(),
            tool_choice: None,
            state: Value::Null,
            signal: AbortSignal::never(),
        }
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = state;
        self
    }
}

/// Sink for token deltas from a streaming model call
pub type DeltaSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Context for one model call
#[derive(Clone)]
pub struct ModelCallContext {
    pub signal: AbortSignal,
    /// When set, the model reports token deltas as they arrive
    pub on_delta: Option<DeltaSink>,
}

impl ModelCallContext {
    pub fn new(signal: AbortSignal) -> Self {
        Self {
            signal,
            on_delta: None,
        }
    }

    pub fn with_delta_sink(mut self, sink: DeltaSink) -> Self {
        self.on_delta = Some(sink);
        self
    }

    pub fn emit_delta(&self, delta: &str) {
        if let Some(sink) = &self.on_delta {
            sink(delta);
        }
    }
}

/// A completed model call
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub message: Message,
    pub usage: Option<ModelUsage>,
}

impl ChatCompletion {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: ModelUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// The single interface the runtime uses to talk to language models
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Model identifier
    fn name(&self) -> &str;

    /// Execute a chat completion. Implementations must honour
    /// `ctx.signal` and should report deltas through `ctx.on_delta`.
    async fn chat(&self, request: ModelRequest, ctx: &ModelCallContext) -> Result<ChatCompletion>;
}

/// Scripted model for tests: replays queued completions in order.
///
/// Requests are recorded so assertions can inspect what the middleware
/// chain actually sent to the model.
pub struct MockChatModel {
    name: String,
    script: Mutex<VecDeque<ChatCompletion>>,
    requests: Mutex<Vec<ModelRequest>>,
    /// Emit the final content as one delta before returning
    stream_deltas: bool,
}

impl MockChatModel {
    pub fn new(completions: Vec<ChatCompletion>) -> Self {
        Self {
            name: "mock".to_string(),
            script: Mutex::new(completions.into()),
            requests: Mutex::new(Vec::new()),
            stream_deltas: false,
        }
    }

    /// Convenience: script of plain AI messages
    pub fn with_replies(replies: Vec<Message>) -> Self {
        Self::new(replies.into_iter().map(ChatCompletion::new).collect())
    }

    /// Single reply carrying tool calls
    pub fn reply_with_tool_calls(content: &str, calls: Vec<ToolCall>) -> ChatCompletion {
        ChatCompletion::new(Message::ai(content).with_tool_calls(calls))
    }

    pub fn streaming(mut self) -> Self {
        self.stream_deltas = true;
        self
    }

    /// Requests observed so far
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl ChatModel for MockChatModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: ModelRequest, ctx: &ModelCallContext) -> Result<ChatCompletion> {
        if ctx.signal.is_aborted() {
            return Err(GraphError::Aborted);
        }
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request);

        let completion = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .ok_or_else(|| GraphError::Model("mock model script exhausted".to_string()))?;

        if self.stream_deltas {
            ctx.emit_delta(&completion.message.content);
        }
        Ok(completion)
    }
}

/// Model that always fails; for error-handling tests
pub struct FailingChatModel {
    pub error: String,
}

#[async_trait]
impl ChatModel for FailingChatModel {
    fn name(&self) -> &str {
        "failing"
    }

    async fn chat(&self, _request: ModelRequest, _ctx: &ModelCallContext) -> Result<ChatCompletion> {
        Err(GraphError::Model(self.error.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_replays_script_in_order() {
        let model = MockChatModel::with_replies(vec![Message::ai("first"), Message::ai("second")]);
        let ctx = ModelCallContext::new(AbortSignal::never());

        let first = model
            .chat(ModelRequest::new(vec![Message::human("hi")]), &ctx)
            .await
            .unwrap();
        assert_eq!(first.message.content, "first");

        let second = model.chat(ModelRequest::new(vec![]), &ctx).await.unwrap();
        assert_eq!(second.message.content, "second");

        let exhausted = model.chat(ModelRequest::new(vec![]), &ctx).await;
        assert!(matches!(exhausted, Err(GraphError::Model(_))));
    }

    #[tokio::test]
    async fn test_mock_records_requests() {
        let model = MockChatModel::with_replies(vec![Message::ai("ok")]);
        let ctx = ModelCallContext::new(AbortSignal::never());
        let request = ModelRequest::new(vec![Message::human("q")])
            .with_tools(vec![ToolDefinition::new("add", "adds", json!({"type": "object"}))]);
        model.chat(request, &ctx).await.unwrap();

        let seen = model.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].tools[0].name, "add");
    }

    #[tokio::test]
    async fn test_streaming_mock_emits_delta() {
        let model = MockChatModel::with_replies(vec![Message::ai("token")]).streaming();
        let collected = Arc::new(Mutex::new(String::new()));
        let sink_target = Arc::clone(&collected);
        let ctx = ModelCallContext::new(AbortSignal::never()).with_delta_sink(Arc::new(
            move |delta: &str| {
                sink_target
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push_str(delta);
            },
        ));

        model.chat(ModelRequest::new(vec![]), &ctx).await.unwrap();
        assert_eq!(collected.lock().unwrap().as_str(), "token");
    }
}
