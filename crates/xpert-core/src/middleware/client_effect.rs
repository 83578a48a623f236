//! Client effects
//!
//! Fire-and-forget UI effects: the wrapper emits an `on_client_effect`
//! event (no interrupt, the run keeps going) and returns a statically
//! configured result to the model in place of a server-side execution.

use crate::error::Result;
use crate::middleware::{AgentMiddleware, ToolCallRequest, ToolHandler};
use crate::stream::RunEvent;
use crate::tool::ToolOutcome;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Middleware name
pub const NAME: &str = "client_effect";

/// Maps tool names to the static result returned to the model
#[derive(Default)]
pub struct ClientEffectMiddleware {
    effects: HashMap<String, Value>,
}

impl ClientEffectMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_effect(mut self, tool: impl Into<String>, result: Value) -> Self {
        self.effects.insert(tool.into(), result);
        self
    }
}

#[async_trait]
impl AgentMiddleware for ClientEffectMiddleware {
    fn name(&self) -> &str {
        NAME
    }

    async fn wrap_tool_call(
        &self,
        request: ToolCallRequest,
        next: &ToolHandler,
    ) -> Result<ToolOutcome> {
        let Some(result) = self.effects.get(&request.tool_call.name) else {
            return next(request).await;
        };

        let _ = request.invocation.run.events.emit(RunEvent::ClientEffect {
            payload: serde_json::json!({
                "name": request.tool_call.name,
                "args": request.tool_call.args,
                "tool_call_id": request.tool_call.id,
            }),
        });
        Ok(ToolOutcome::Raw(result.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RunContext;
    use crate::stream::{EventBus, MutePolicy};
    use crate::tool::{Tool, ToolCall, ToolInvocation};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_effect_emits_event_and_returns_configured_result() {
        let middleware =
            ClientEffectMiddleware::new().with_effect("play_sound", json!({"played": true}));

        let (bus, mut rx) = EventBus::channel(MutePolicy::default());
        let ctx = RunContext::new("t1", "r1").with_events(bus);

        let tool = Tool::from_fn("play_sound", "Plays a sound", json!({"type": "object"}),
            |_a, _i| async move { Ok(json!("never")) });
        let request = ToolCallRequest {
            tool_call: ToolCall::new("e1", "play_sound", json!({"sound": "ding"})),
            tool: Arc::new(tool),
            state: json!({}),
            invocation: ToolInvocation::new(json!({}), ctx),
        };

        let next: ToolHandler = Arc::new(|_request| {
            Box::pin(async move { panic!("inner handler must not run for effects") })
        });
        let outcome = middleware.wrap_tool_call(request, &next).await.unwrap();
        assert!(matches!(outcome, ToolOutcome::Raw(v) if v == json!({"played": true})));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_name(), "on_client_effect");
    }
}
