//! Middleware pipeline
//!
//! A middleware declares any subset of: lifecycle hooks (`before_agent`,
//! `before_model`, `after_model`, `after_agent`), state channels, extra
//! tools, and wrappers around the model call and tool invocation.
//!
//! Hooks are state transformers over the agent channel: they return a
//! partial update plus an optional [`JumpTo`] directive that overrides the
//! router on the very next transition. `after_*` hooks run in reverse
//! registration order; the last after-model hook's output feeds the router.
//!
//! The wrappers compose right-to-left: the last registered middleware wraps
//! every earlier one, which wrap the core handler.

pub mod client_effect;
pub mod client_tool;
pub mod hitl;
pub mod summarize;
pub mod todo;
pub mod tool_selector;

pub use client_effect::ClientEffectMiddleware;
pub use client_tool::ClientToolMiddleware;
pub use hitl::HumanInTheLoopMiddleware;
pub use summarize::SummarizationMiddleware;
pub use todo::TodoListMiddleware;
pub use tool_selector::LlmToolSelectorMiddleware;

use crate::error::{GraphError, Result};
use crate::llm::{ChatCompletion, ModelRequest};
use crate::runtime::RunContext;
use crate::tool::{Tool, ToolCall, ToolInvocation, ToolOutcome};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use xpert_checkpoint::channels::ChannelSpec;

/// Router override returned by a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JumpTo {
    /// Re-enter the model
    Model,
    /// Go straight to the tool fan-out
    Tools,
    /// Finish the agent
    End,
}

/// Result of a lifecycle hook
#[derive(Debug, Clone, Default)]
pub struct HookOutcome {
    /// Partial agent-channel update. Hooks that rewrite the last AI message
    /// return a fresh message object here; they never mutate in place.
    pub update: Option<Value>,
    /// Overrides the router on the next transition
    pub jump_to: Option<JumpTo>,
}

impl HookOutcome {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn update(update: Value) -> Self {
        Self {
            update: Some(update),
            jump_to: None,
        }
    }

    pub fn with_jump(mut self, jump: JumpTo) -> Self {
        self.jump_to = Some(jump);
        self
    }
}

/// Which hooks a middleware implements; the compiler creates one graph node
/// per declared hook
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MiddlewareHooks {
    pub before_agent: bool,
    pub before_model: bool,
    pub after_model: bool,
    pub after_agent: bool,
}

/// Handler type for the composed model call
pub type ModelHandler =
    Arc<dyn Fn(ModelRequest) -> BoxFuture<'static, Result<ChatCompletion>> + Send + Sync>;

/// One tool invocation as seen by the wrap chain
#[derive(Clone)]
pub struct ToolCallRequest {
    pub tool_call: ToolCall,
    pub tool: Arc<Tool>,
    /// Caller's agent-channel snapshot
    pub state: Value,
    pub invocation: ToolInvocation,
}

/// Handler type for the composed tool call
pub type ToolHandler =
    Arc<dyn Fn(ToolCallRequest) -> BoxFuture<'static, Result<ToolOutcome>> + Send + Sync>;

/// Pluggable hooks wrapping the agent lifecycle and model/tool invocations
#[async_trait]
pub trait AgentMiddleware: Send + Sync {
    /// Unique name; duplicates fail compilation
    fn name(&self) -> &str;

    /// Hooks this middleware implements
    fn hooks(&self) -> MiddlewareHooks {
        MiddlewareHooks::default()
    }

    /// Channels this middleware contributes. Reducer defaults to
    /// last-writer-wins when the middleware does not specify otherwise.
    fn state_channels(&self) -> Vec<(String, ChannelSpec)> {
        Vec::new()
    }

    /// Tools merged into the agent's tool set at compile time
    fn tools(&self) -> Vec<Tool> {
        Vec::new()
    }

    async fn before_agent(&self, _state: &Value, _ctx: &RunContext) -> Result<HookOutcome> {
        Ok(HookOutcome::none())
    }

    async fn before_model(&self, _state: &Value, _ctx: &RunContext) -> Result<HookOutcome> {
        Ok(HookOutcome::none())
    }

    async fn after_model(&self, _state: &Value, _ctx: &RunContext) -> Result<HookOutcome> {
        Ok(HookOutcome::none())
    }

    async fn after_agent(&self, _state: &Value, _ctx: &RunContext) -> Result<HookOutcome> {
        Ok(HookOutcome::none())
    }

    /// Wrap the model call; the default forwards to `next` untouched
    async fn wrap_model_call(
        &self,
        request: ModelRequest,
        next: &ModelHandler,
    ) -> Result<ChatCompletion> {
        next(request).await
    }

    /// Wrap a tool invocation; the default forwards to `next` untouched
    async fn wrap_tool_call(
        &self,
        request: ToolCallRequest,
        next: &ToolHandler,
    ) -> Result<ToolOutcome> {
        next(request).await
    }
}

/// Reject duplicate middleware names; fatal at compile time
pub fn validate_middlewares(middlewares: &[Arc<dyn AgentMiddleware>]) -> Result<()> {
    let mut seen = HashSet::new();
    for middleware in middlewares {
        if !seen.insert(middleware.name().to_string()) {
            return Err(GraphError::configuration(format!(
                "duplicate middleware name '{}'",
                middleware.name()
            )));
        }
    }
    Ok(())
}

/// Compose `wrap_model_call` chains right-to-left around a core handler:
/// the last registered middleware becomes the outermost wrapper.
pub fn compose_model_call(
    middlewares: &[Arc<dyn AgentMiddleware>],
    core: ModelHandler,
) -> ModelHandler {
    let mut handler = core;
    for middleware in middlewares {
        let middleware = Arc::clone(middleware);
        let inner = handler;
        handler = Arc::new(move |request| {
            let middleware = Arc::clone(&middleware);
            let inner = inner.clone();
            Box::pin(async move { middleware.wrap_model_call(request, &inner).await })
        });
    }
    handler
}

/// Compose `wrap_tool_call` chains right-to-left around a core handler
pub fn compose_tool_call(
    middlewares: &[Arc<dyn AgentMiddleware>],
    core: ToolHandler,
) -> ToolHandler {
    let mut handler = core;
    for middleware in middlewares {
        let middleware = Arc::clone(middleware);
        let inner = handler;
        handler = Arc::new(move |request| {
            let middleware = Arc::clone(&middleware);
            let inner = inner.clone();
            Box::pin(async move { middleware.wrap_tool_call(request, &inner).await })
        });
    }
    handler
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelRequest;
    use crate::messages::Message;
    use std::sync::Mutex;

    struct Tagger {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl AgentMiddleware for Tagger {
        fn name(&self) -> &str {
            &self.name
        }

        async fn wrap_model_call(
            &self,
            request: ModelRequest,
            next: &ModelHandler,
        ) -> Result<ChatCompletion> {
            self.log
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(format!("{}:enter", self.name));
            let result = next(request).await;
            self.log
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(format!("{}:exit", self.name));
            result
        }
    }

    #[tokio::test]
    async fn test_model_call_composes_right_to_left() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let middlewares: Vec<Arc<dyn AgentMiddleware>> = vec![
            Arc::new(Tagger { name: "first".into(), log: Arc::clone(&log) }),
            Arc::new(Tagger { name: "second".into(), log: Arc::clone(&log) }),
        ];

        let core_log = Arc::clone(&log);
        let core: ModelHandler = Arc::new(move |_request| {
            let core_log = Arc::clone(&core_log);
            Box::pin(async move {
                core_log
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push("core".to_string());
                Ok(ChatCompletion::new(Message::ai("ok")))
            })
        });

        let handler = compose_model_call(&middlewares, core);
        handler(ModelRequest::new(vec![])).await.unwrap();

        // Last registered is outermost: second wraps first wraps core
        let order = log.lock().unwrap().clone();
        assert_eq!(
            order,
            vec!["second:enter", "first:enter", "core", "first:exit", "second:exit"]
        );
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let middlewares: Vec<Arc<dyn AgentMiddleware>> = vec![
            Arc::new(Tagger { name: "same".into(), log: Arc::clone(&log) }),
            Arc::new(Tagger { name: "same".into(), log }),
        ];
        let err = validate_middlewares(&middlewares).unwrap_err();
        assert!(matches!(err, GraphError::Configuration(_)));
    }
}
