//! Conversation summarization
//!
//! Keeps the per-agent message history under `max_messages`: when the
//! history exceeds the ceiling, the overflow (everything but the
//! `retain_messages` most recent items) is summarized by the model, the
//! summary lands in the agent channel's `summary` field, and the
//! summarized messages are removed with targeted markers.

use crate::error::Result;
use crate::llm::{ChatModel, ModelCallContext, ModelRequest};
use crate::messages::{messages_from_value, Message, RemoveMessage};
use crate::middleware::{AgentMiddleware, HookOutcome, MiddlewareHooks};
use crate::runtime::RunContext;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Middleware name
pub const NAME: &str = "summarization";

/// Summarizes conversation overflow via the model
pub struct SummarizationMiddleware {
    model: Arc<dyn ChatModel>,
    max_messages: usize,
    retain_messages: usize,
}

impl SummarizationMiddleware {
    pub fn new(model: Arc<dyn ChatModel>, max_messages: usize, retain_messages: usize) -> Self {
        Self {
            model,
            max_messages,
            retain_messages: retain_messages.min(max_messages),
        }
    }

    fn transcript(messages: &[Message]) -> String {
        messages
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl AgentMiddleware for SummarizationMiddleware {
    fn name(&self) -> &str {
        NAME
    }

    fn hooks(&self) -> MiddlewareHooks {
        MiddlewareHooks {
            before_model: true,
            ..Default::default()
        }
    }

    async fn before_model(&self, state: &Value, ctx: &RunContext) -> Result<HookOutcome> {
        let messages = messages_from_value(&state["messages"]);
        if messages.len() <= self.max_messages {
            return Ok(HookOutcome::none());
        }

        let split = messages.len() - self.retain_messages;
        let overflow = &messages[..split];

        let prior_summary = state["summary"].as_str().unwrap_or("");
        let prompt = if prior_summary.is_empty() {
            format!(
                "Summarize the following conversation concisely, keeping facts, decisions \
                 and open questions:\n\n{}",
                Self::transcript(overflow)
            )
        } else {
            format!(
                "Current summary:\n{prior_summary}\n\nExtend the summary with the following \
                 additional conversation:\n\n{}",
                Self::transcript(overflow)
            )
        };

        let request = ModelRequest::new(vec![Message::human(prompt)])
            .with_signal(ctx.signal.clone());
        let call_ctx = ModelCallContext::new(ctx.signal.clone());
        let completion = self.model.chat(request, &call_ctx).await?;

        tracing::debug!(
            summarized = overflow.len(),
            retained = self.retain_messages,
            "conversation summarized"
        );

        // Messages without ids cannot be targeted for removal; the reducer
        // assigns ids on merge, so in practice every entry has one.
        let updates: Vec<Value> = overflow
            .iter()
            .filter_map(|m| m.id.as_ref())
            .map(|id| RemoveMessage::new(id.clone()).to_marker())
            .collect();

        Ok(HookOutcome::update(serde_json::json!({
            "summary": completion.message.content,
            "messages": updates,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockChatModel;
    use serde_json::json;

    fn state_with_messages(count: usize) -> Value {
        let messages: Vec<Value> = (0..count)
            .map(|i| Message::human(format!("msg {i}")).with_id(format!("m{i}")).to_value())
            .collect();
        json!({ "messages": messages, "summary": Value::Null })
    }

    #[tokio::test]
    async fn test_below_threshold_is_noop() {
        let model = Arc::new(MockChatModel::with_replies(vec![]));
        let middleware = SummarizationMiddleware::new(model, 10, 4);
        let outcome = middleware
            .before_model(&state_with_messages(5), &RunContext::new("t1", "r1"))
            .await
            .unwrap();
        assert!(outcome.update.is_none());
    }

    #[tokio::test]
    async fn test_overflow_summarized_and_removed() {
        let model = Arc::new(MockChatModel::with_replies(vec![Message::ai(
            "summary of 6 messages",
        )]));
        let middleware = SummarizationMiddleware::new(model, 8, 4);

        let outcome = middleware
            .before_model(&state_with_messages(10), &RunContext::new("t1", "r1"))
            .await
            .unwrap();

        let update = outcome.update.unwrap();
        assert_eq!(update["summary"], json!("summary of 6 messages"));
        // 10 messages, retain 4 → 6 removal markers for m0..m5
        let markers = update["messages"].as_array().unwrap();
        assert_eq!(markers.len(), 6);
        assert_eq!(markers[0]["__remove__"], json!("m0"));
        assert_eq!(markers[5]["__remove__"], json!("m5"));
    }
}
