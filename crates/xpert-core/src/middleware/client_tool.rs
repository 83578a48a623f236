//! Client-side tool execution
//!
//! Tools flagged client-side run in the calling UI, not on the server. The
//! wrapper never invokes the inner handler: it raises a client-tool
//! interrupt carrying the call, and on resume validates that the returned
//! tool message answers exactly that call before handing it back as the
//! tool's result.

use crate::error::{GraphError, Result};
use crate::interrupt::{ClientToolResume, InterruptSignal};
use crate::messages::ToolMessageStatus;
use crate::middleware::{AgentMiddleware, ToolCallRequest, ToolHandler};
use crate::tool::ToolOutcome;
use async_trait::async_trait;
use std::collections::HashSet;

/// Middleware name
pub const NAME: &str = "client_tool";

/// Routes configured tools (and any tool flagged `client_side`) to the
/// client
#[derive(Default)]
pub struct ClientToolMiddleware {
    client_tools: HashSet<String>,
}

impl ClientToolMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, name: impl Into<String>) -> Self {
        self.client_tools.insert(name.into());
        self
    }

    fn is_client_tool(&self, request: &ToolCallRequest) -> bool {
        request.tool.client_side || self.client_tools.contains(&request.tool_call.name)
    }
}

#[async_trait]
impl AgentMiddleware for ClientToolMiddleware {
    fn name(&self) -> &str {
        NAME
    }

    async fn wrap_tool_call(
        &self,
        request: ToolCallRequest,
        next: &ToolHandler,
    ) -> Result<ToolOutcome> {
        if !self.is_client_tool(&request) {
            return next(request).await;
        }

        let Some(resume) = request.invocation.run.take_resume() else {
            return Err(GraphError::Interrupt(InterruptSignal::client_tool(
                request.tool_call.clone(),
            )));
        };

        let resume: ClientToolResume = serde_json::from_value(resume)
            .map_err(|e| GraphError::input(format!("invalid client tool response: {e}")))?;
        if resume.tool_messages.len() != 1 {
            return Err(GraphError::input(format!(
                "client tool response must carry exactly one tool message, got {}",
                resume.tool_messages.len()
            )));
        }

        let mut message = resume.tool_messages.into_iter().next().unwrap();
        match message.tool_call_id.as_deref() {
            Some(id) if id == request.tool_call.id => {}
            Some(id) => {
                return Err(GraphError::input(format!(
                    "client tool response id '{}' does not match pending call '{}'",
                    id, request.tool_call.id
                )));
            }
            None => {
                return Err(GraphError::input(
                    "client tool response is missing tool_call_id",
                ));
            }
        }

        message.ensure_id();
        if message.status.is_none() {
            message.status = Some(ToolMessageStatus::Success);
        }
        if message.name.is_none() {
            message.name = Some(request.tool_call.name.clone());
        }
        Ok(ToolOutcome::Message(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Message;
    use crate::runtime::RunContext;
    use crate::tool::{Tool, ToolCall, ToolInvocation};
    use serde_json::json;
    use std::sync::Arc;

    fn request(ctx: RunContext) -> ToolCallRequest {
        let tool = Tool::from_fn(
            "browser.open",
            "Open a URL in the client browser",
            json!({"type": "object"}),
            |_args, _invocation| async move { Ok(json!("server side")) },
        )
        .client_side();
        let call = ToolCall::new("c1", "browser.open", json!({"url": "https://example.com"}));
        ToolCallRequest {
            tool_call: call.clone(),
            tool: Arc::new(tool),
            state: json!({}),
            invocation: ToolInvocation::new(json!({}), ctx).with_tool_call_id(call.id),
        }
    }

    fn passthrough() -> ToolHandler {
        Arc::new(|request| {
            Box::pin(async move {
                request
                    .tool
                    .clone()
                    .invoke(request.tool_call.args.clone(), request.invocation.clone())
                    .await
                    .map_err(|e| GraphError::Tool {
                        tool: request.tool_call.name.clone(),
                        error: e.to_string(),
                    })
            })
        })
    }

    #[tokio::test]
    async fn test_raises_client_tool_interrupt() {
        let middleware = ClientToolMiddleware::new();
        let err = middleware
            .wrap_tool_call(request(RunContext::new("t1", "r1")), &passthrough())
            .await
            .unwrap_err();
        match err {
            GraphError::Interrupt(signal) => {
                assert_eq!(signal.payload["clientToolCalls"][0]["id"], json!("c1"));
            }
            other => panic!("expected interrupt, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_resume_with_matching_id() {
        let ctx = RunContext::new("t1", "r1");
        ctx.set_resume(json!({
            "toolMessages": [Message::tool("ok", "c1").to_value()]
        }));

        let middleware = ClientToolMiddleware::new();
        let outcome = middleware
            .wrap_tool_call(request(ctx), &passthrough())
            .await
            .unwrap();
        match outcome {
            ToolOutcome::Message(message) => {
                assert_eq!(message.content, "ok");
                assert_eq!(message.tool_call_id.as_deref(), Some("c1"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mismatched_id_is_input_error() {
        let ctx = RunContext::new("t1", "r1");
        ctx.set_resume(json!({
            "toolMessages": [Message::tool("ok", "wrong-id").to_value()]
        }));

        let middleware = ClientToolMiddleware::new();
        let err = middleware
            .wrap_tool_call(request(ctx), &passthrough())
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Input(_)));
    }

    #[tokio::test]
    async fn test_missing_id_is_input_error() {
        let ctx = RunContext::new("t1", "r1");
        let mut message = Message::tool("ok", "c1");
        message.tool_call_id = None;
        ctx.set_resume(json!({ "toolMessages": [message.to_value()] }));

        let middleware = ClientToolMiddleware::new();
        let err = middleware
            .wrap_tool_call(request(ctx), &passthrough())
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Input(_)));
    }

    #[tokio::test]
    async fn test_server_tools_pass_through() {
        let middleware = ClientToolMiddleware::new();
        let tool = Tool::from_fn(
            "add",
            "Adds",
            json!({"type": "object"}),
            |_args, _invocation| async move { Ok(json!(5)) },
        );
        let call = ToolCall::new("t1", "add", json!({}));
        let request = ToolCallRequest {
            tool_call: call.clone(),
            tool: Arc::new(tool),
            state: json!({}),
            invocation: ToolInvocation::new(json!({}), RunContext::new("t1", "r1")),
        };
        let outcome = middleware
            .wrap_tool_call(request, &passthrough())
            .await
            .unwrap();
        assert!(matches!(outcome, ToolOutcome::Raw(v) if v == json!(5)));
    }
}
