//! Human-in-the-loop review of tool calls
//!
//! Before routing to tools, this middleware inspects the `tool_calls` of
//! the last AI message. Calls matching its `interrupt_on` map are collected
//! into a single interrupt carrying one [`ActionRequest`] per call; the
//! resume must carry exactly one decision per interrupted call, paired by
//! index. Approve keeps the call, edit replaces name and args under the
//! original id, reject drops it and answers it with a synthetic error tool
//! message — and when any rejection occurred, the AI message is rewritten
//! to carry only the rejected calls and the flow jumps back to the model.

use crate::error::{GraphError, Result};
use crate::interrupt::{
    ActionRequest, Decision, DecisionType, HitlResume, InterruptSignal, ReviewConfig,
};
use crate::messages::{last_ai_message, messages_from_value, Message};
use crate::middleware::{AgentMiddleware, HookOutcome, JumpTo, MiddlewareHooks};
use crate::runtime::RunContext;
use crate::schema;
use crate::tool::ToolCall;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Middleware name
pub const NAME: &str = "human_in_the_loop";

/// HITL middleware configured with the tools requiring review
pub struct HumanInTheLoopMiddleware {
    interrupt_on: HashMap<String, ReviewConfig>,
}

impl HumanInTheLoopMiddleware {
    pub fn new(interrupt_on: HashMap<String, ReviewConfig>) -> Self {
        Self { interrupt_on }
    }

    /// Review a single tool with the given allowed decisions
    pub fn for_tool(tool: impl Into<String>, allowed: Vec<DecisionType>) -> Self {
        let mut interrupt_on = HashMap::new();
        interrupt_on.insert(tool.into(), ReviewConfig::new(allowed));
        Self::new(interrupt_on)
    }

    fn matched_calls(&self, message: &Message) -> Vec<ToolCall> {
        message
            .tool_calls()
            .iter()
            .filter(|call| self.interrupt_on.contains_key(&call.name))
            .cloned()
            .collect()
    }

    fn build_interrupt(&self, matched: &[ToolCall]) -> InterruptSignal {
        let requests: Vec<ActionRequest> = matched
            .iter()
            .map(|call| ActionRequest {
                name: call.name.clone(),
                args: call.args.clone(),
                description: self
                    .interrupt_on
                    .get(&call.name)
                    .and_then(|c| c.description.clone()),
            })
            .collect();
        let reviews: Vec<&ReviewConfig> = matched
            .iter()
            .filter_map(|call| self.interrupt_on.get(&call.name))
            .collect();
        let payload = serde_json::json!({
            "requests": requests,
            "reviewConfigs": reviews,
        });
        InterruptSignal::hitl(payload, matched.to_vec())
    }

    /// Apply resume decisions to the interrupted calls. Returns the calls
    /// to keep on the AI message, the synthetic tool messages, and whether
    /// any rejection occurred.
    fn apply_decisions(
        &self,
        matched: &[ToolCall],
        decisions: Vec<Decision>,
    ) -> Result<(Vec<ToolCall>, Vec<Message>, bool)> {
        if decisions.len() != matched.len() {
            return Err(GraphError::input(format!(
                "expected {} decisions, got {}",
                matched.len(),
                decisions.len()
            )));
        }

        let mut kept = Vec::new();
        let mut rejected = Vec::new();
        let mut synthetic = Vec::new();

        for (call, decision) in matched.iter().zip(decisions) {
            let review = self.interrupt_on.get(&call.name).ok_or_else(|| {
                GraphError::input(format!("no review config for tool '{}'", call.name))
            })?;
            if !review.allows(decision.decision_type()) {
                return Err(GraphError::input(format!(
                    "decision '{:?}' not allowed for tool '{}'",
                    decision.decision_type(),
                    call.name
                )));
            }

            match decision {
                Decision::Approve => kept.push(call.clone()),
                Decision::Edit { name, args } => {
                    if let Some(args_schema) = &review.args_schema {
                        schema::validate(args_schema, &args)
                            .map_err(|e| GraphError::input(format!("edited args invalid: {e}")))?;
                    }
                    // Replace name and args, keep the original id
                    kept.push(ToolCall::new(call.id.clone(), name, args));
                }
                Decision::Reject { message } => {
                    rejected.push(call.clone());
                    synthetic.push(Message::tool_error(
                        message.unwrap_or_else(|| "Tool call rejected by reviewer".to_string()),
                        call.id.clone(),
                    ));
                }
            }
        }

        let any_rejected = !rejected.is_empty();
        // When anything was rejected the AI message keeps only the rejected
        // calls so the synthetic tool messages stay correlated, and the
        // flow re-enters the model.
        let calls_for_message = if any_rejected { rejected } else { kept };
        Ok((calls_for_message, synthetic, any_rejected))
    }
}

#[async_trait]
impl AgentMiddleware for HumanInTheLoopMiddleware {
    fn name(&self) -> &str {
        NAME
    }

    fn hooks(&self) -> MiddlewareHooks {
        MiddlewareHooks {
            after_model: true,
            ..Default::default()
        }
    }

    async fn after_model(&self, state: &Value, ctx: &RunContext) -> Result<HookOutcome> {
        let messages = messages_from_value(&state["messages"]);
        let Some(ai_message) = last_ai_message(&messages) else {
            return Ok(HookOutcome::none());
        };
        let matched = self.matched_calls(ai_message);
        if matched.is_empty() {
            return Ok(HookOutcome::none());
        }

        let Some(resume) = ctx.take_resume() else {
            return Err(GraphError::Interrupt(self.build_interrupt(&matched)));
        };

        let resume: HitlResume = serde_json::from_value(resume)
            .map_err(|e| GraphError::input(format!("invalid HITL resume payload: {e}")))?;
        let (calls, synthetic, any_rejected) = self.apply_decisions(&matched, resume.decisions)?;

        // Fresh AI message object with the rewritten calls; same id so the
        // messages reducer replaces the original in place.
        let mut rewritten = ai_message.clone();
        rewritten.tool_calls = Some(calls);

        let mut updates = vec![rewritten.to_value()];
        updates.extend(synthetic.iter().map(Message::to_value));

        let outcome = HookOutcome::update(serde_json::json!({ "messages": updates }));
        Ok(if any_rejected {
            outcome.with_jump(JumpTo::Model)
        } else {
            outcome
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn middleware() -> HumanInTheLoopMiddleware {
        HumanInTheLoopMiddleware::for_tool(
            "dangerous",
            vec![DecisionType::Approve, DecisionType::Reject],
        )
    }

    fn state_with_call() -> Value {
        let ai = Message::ai("about to act")
            .with_id("ai-1")
            .with_tool_calls(vec![ToolCall::new("t9", "dangerous", json!({"x": 1}))]);
        json!({ "messages": [ai.to_value()] })
    }

    #[tokio::test]
    async fn test_raises_interrupt_without_resume() {
        let ctx = RunContext::new("t1", "r1");
        let err = middleware()
            .after_model(&state_with_call(), &ctx)
            .await
            .unwrap_err();
        match err {
            GraphError::Interrupt(signal) => {
                assert_eq!(signal.pending_tool_calls.len(), 1);
                assert_eq!(signal.payload["requests"][0]["name"], json!("dangerous"));
            }
            other => panic!("expected interrupt, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_no_matching_calls_is_noop() {
        let ctx = RunContext::new("t1", "r1");
        let ai = Message::ai("safe").with_tool_calls(vec![ToolCall::new(
            "t1",
            "harmless",
            json!({}),
        )]);
        let state = json!({ "messages": [ai.to_value()] });
        let outcome = middleware().after_model(&state, &ctx).await.unwrap();
        assert!(outcome.update.is_none());
        assert!(outcome.jump_to.is_none());
    }

    #[tokio::test]
    async fn test_reject_rewrites_message_and_jumps_to_model() {
        let ctx = RunContext::new("t1", "r1");
        ctx.set_resume(json!({
            "decisions": [{"type": "reject", "message": "nope"}]
        }));

        let outcome = middleware()
            .after_model(&state_with_call(), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.jump_to, Some(JumpTo::Model));

        let update = outcome.update.unwrap();
        let messages = update["messages"].as_array().unwrap().clone();
        assert_eq!(messages.len(), 2);
        // Fresh AI message, same id, only the rejected call
        assert_eq!(messages[0]["id"], json!("ai-1"));
        assert_eq!(messages[0]["tool_calls"][0]["id"], json!("t9"));
        // Synthetic error tool message answers the rejected call
        assert_eq!(messages[1]["tool_call_id"], json!("t9"));
        assert_eq!(messages[1]["status"], json!("error"));
        assert_eq!(messages[1]["content"], json!("nope"));
    }

    #[tokio::test]
    async fn test_approve_keeps_call_without_jump() {
        let ctx = RunContext::new("t1", "r1");
        ctx.set_resume(json!({"decisions": [{"type": "approve"}]}));

        let outcome = middleware()
            .after_model(&state_with_call(), &ctx)
            .await
            .unwrap();
        assert!(outcome.jump_to.is_none());
        let update = outcome.update.unwrap();
        assert_eq!(update["messages"][0]["tool_calls"][0]["name"], json!("dangerous"));
    }

    #[tokio::test]
    async fn test_edit_replaces_args_keeps_id() {
        let middleware = HumanInTheLoopMiddleware::for_tool(
            "dangerous",
            vec![DecisionType::Approve, DecisionType::Edit],
        );
        let ctx = RunContext::new("t1", "r1");
        ctx.set_resume(json!({
            "decisions": [{"type": "edit", "name": "safer", "args": {"x": 2}}]
        }));

        let outcome = middleware
            .after_model(&state_with_call(), &ctx)
            .await
            .unwrap();
        let call = &outcome.unwrap_update()["messages"][0]["tool_calls"][0];
        assert_eq!(call["id"], json!("t9"));
        assert_eq!(call["name"], json!("safer"));
        assert_eq!(call["args"]["x"], json!(2));
    }

    #[tokio::test]
    async fn test_wrong_decision_count_fails() {
        let ctx = RunContext::new("t1", "r1");
        ctx.set_resume(json!({
            "decisions": [{"type": "approve"}, {"type": "approve"}]
        }));
        let err = middleware()
            .after_model(&state_with_call(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Input(_)));
    }

    #[tokio::test]
    async fn test_disallowed_decision_fails() {
        let ctx = RunContext::new("t1", "r1");
        ctx.set_resume(json!({
            "decisions": [{"type": "edit", "name": "x", "args": {}}]
        }));
        let err = middleware()
            .after_model(&state_with_call(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Input(_)));
    }

    impl HookOutcome {
        fn unwrap_update(&self) -> &Value {
            self.update.as_ref().expect("hook produced no update")
        }
    }
}
