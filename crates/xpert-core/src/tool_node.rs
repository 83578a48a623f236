//! Tool node
//!
//! Executes the tool calls an AI message fanned out to this node. Each call
//! runs through the composed `wrap_tool_call` chain; the result is
//! normalized into a tool message (or a command whose message updates are
//! rewritten into the caller's agent channel), variable assigners copy
//! selected parts of the result into named channels, and errors come back
//! to the model as `status: error` tool messages unless error handling is
//! disabled.

use crate::error::{GraphError, Result};
use crate::graph::{NodeContext, NodeOutput};
use crate::messages::{last_ai_message, messages_from_value, Message};
use crate::middleware::{compose_tool_call, AgentMiddleware, ToolCallRequest, ToolHandler};
use crate::stream::RunEvent;
use crate::tool::{Tool, ToolCall, ToolInvocation, ToolOutcome};
use serde_json::Value;
use std::sync::Arc;

/// Where an assigned variable takes its value from
#[derive(Debug, Clone)]
pub enum AssignSource {
    /// The textual content of the tool result
    Content,
    /// The `artifact` field of a structured tool result
    Artifact,
    /// A constant
    Constant(Value),
}

/// Writes part of a tool result into a named channel
#[derive(Debug, Clone)]
pub struct VariableAssigner {
    pub channel: String,
    pub source: AssignSource,
}

/// Graph node executing one tool for one agent
pub struct ToolNode {
    tool: Arc<Tool>,
    agent_key: String,
    agent_channel: String,
    handler: ToolHandler,
    variables: Vec<VariableAssigner>,
    handle_tool_errors: bool,
    toolset_id: Option<String>,
}

impl ToolNode {
    pub fn new(
        tool: Arc<Tool>,
        agent_key: impl Into<String>,
        agent_channel: impl Into<String>,
        middlewares: &[Arc<dyn AgentMiddleware>],
    ) -> Self {
        let core = core_handler();
        Self {
            tool,
            agent_key: agent_key.into(),
            agent_channel: agent_channel.into(),
            handler: compose_tool_call(middlewares, core),
            variables: Vec::new(),
            handle_tool_errors: true,
            toolset_id: None,
        }
    }

    pub fn with_variables(mut self, variables: Vec<VariableAssigner>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_error_handling(mut self, handle: bool) -> Self {
        self.handle_tool_errors = handle;
        self
    }

    pub fn with_toolset_id(mut self, id: impl Into<String>) -> Self {
        self.toolset_id = Some(id.into());
        self
    }

    /// The tool calls this node serves: the `Send` payload when fanned
    /// out, otherwise every matching call of the caller's last AI message.
    fn resolve_calls(&self, ctx: &NodeContext, agent_state: &Value) -> Vec<ToolCall> {
        if let Some(arg) = &ctx.send_arg {
            if let Ok(call) = serde_json::from_value::<ToolCall>(arg["tool_call"].clone()) {
                return vec![call];
            }
        }
        let messages = messages_from_value(&agent_state["messages"]);
        last_ai_message(&messages)
            .map(|ai| {
                ai.tool_calls()
                    .iter()
                    .filter(|call| call.name == self.tool.name)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput> {
        let agent_state = ctx.channel(&self.agent_channel);
        let calls = self.resolve_calls(&ctx, &agent_state);
        if calls.is_empty() {
            return Ok(NodeOutput::empty());
        }

        let mut writes: Vec<(String, Value)> = Vec::new();
        let mut goto = None;

        for call in calls {
            let _ = ctx.run.events.emit(RunEvent::ToolStart {
                name: call.name.clone(),
                tool_call_id: call.id.clone(),
                args: call.args.clone(),
            });

            let mut invocation =
                ToolInvocation::new(agent_state.clone(), ctx.run.for_agent(&self.agent_key))
                    .with_tool_call_id(call.id.clone());
            if let Some(toolset_id) = &self.toolset_id {
                invocation = invocation.with_toolset_id(toolset_id.clone());
            }
            let request = ToolCallRequest {
                tool_call: call.clone(),
                tool: Arc::clone(&self.tool),
                state: agent_state.clone(),
                invocation,
            };

            match (self.handler)(request).await {
                Ok(outcome) => {
                    let (message, artifact, command) = self.normalize(&call, outcome);
                    if let Some(message) = &message {
                        let _ = ctx.run.events.emit(RunEvent::ToolEnd {
                            name: call.name.clone(),
                            tool_call_id: call.id.clone(),
                            output: Value::String(message.content.clone()),
                        });
                        self.push_message_writes(&mut writes, message);
                        self.push_variable_writes(&mut writes, message, artifact.as_ref());
                    }
                    if let Some(command) = command {
                        for (channel, value) in command.update_writes() {
                            if channel == "messages" {
                                // Message updates land in the caller's channel
                                writes.push((
                                    self.agent_channel.clone(),
                                    serde_json::json!({ "messages": value }),
                                ));
                            } else {
                                writes.push((channel, value));
                            }
                        }
                        if command.goto.is_some() {
                            goto = command.goto;
                        }
                        let _ = ctx.run.events.emit(RunEvent::ToolEnd {
                            name: call.name.clone(),
                            tool_call_id: call.id.clone(),
                            output: Value::Null,
                        });
                    }
                }
                Err(error) => {
                    // Interrupts suspend the run; invalid caller input is
                    // fatal. Neither is a recoverable tool failure.
                    if error.is_interrupt() || matches!(error, GraphError::Input(_)) {
                        return Err(error);
                    }
                    if !self.handle_tool_errors {
                        return Err(GraphError::Tool {
                            tool: call.name.clone(),
                            error: error.to_string(),
                        });
                    }
                    tracing::warn!(tool = %call.name, error = %error, "tool failed, recovering");
                    let _ = ctx.run.events.emit(RunEvent::ToolError {
                        name: call.name.clone(),
                        tool_call_id: call.id.clone(),
                        error: error.to_string(),
                    });
                    let message = Message::tool_error(format!("Error: {error}"), call.id.clone())
                        .with_name(call.name.clone());
                    self.push_message_writes(&mut writes, &message);
                }
            }
        }

        Ok(match goto {
            Some(goto) => NodeOutput::Command(
                crate::command::Command::new()
                    .with_update(writes_to_update(writes))
                    .with_goto(goto),
            ),
            None => NodeOutput::Writes(writes),
        })
    }

    /// Normalize an outcome into (tool message, artifact, command)
    fn normalize(
        &self,
        call: &ToolCall,
        outcome: ToolOutcome,
    ) -> (Option<Message>, Option<Value>, Option<crate::command::Command>) {
        match outcome {
            ToolOutcome::Message(mut message) => {
                if message.tool_call_id.is_none() {
                    message.tool_call_id = Some(call.id.clone());
                }
                if message.name.is_none() {
                    message.name = Some(call.name.clone());
                }
                (Some(message), None, None)
            }
            ToolOutcome::Command(command) => (None, None, Some(command)),
            ToolOutcome::Raw(value) => {
                let artifact = value.get("artifact").cloned();
                let content = match &value {
                    Value::String(s) => s.clone(),
                    other => other
                        .get("content")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| other.to_string()),
                };
                let message = Message::tool(content, call.id.clone()).with_name(call.name.clone());
                (Some(message), artifact, None)
            }
        }
    }

    fn push_message_writes(&self, writes: &mut Vec<(String, Value)>, message: &Message) {
        writes.push((
            self.agent_channel.clone(),
            serde_json::json!({ "messages": [message.to_value()] }),
        ));
        writes.push(("messages".to_string(), message.to_value()));
    }

    fn push_variable_writes(
        &self,
        writes: &mut Vec<(String, Value)>,
        message: &Message,
        artifact: Option<&Value>,
    ) {
        for assigner in &self.variables {
            let value = match &assigner.source {
                AssignSource::Content => Value::String(message.content.clone()),
                AssignSource::Artifact => artifact.cloned().unwrap_or(Value::Null),
                AssignSource::Constant(value) => value.clone(),
            };
            writes.push((assigner.channel.clone(), value));
        }
    }
}

fn core_handler() -> ToolHandler {
    Arc::new(|request: ToolCallRequest| {
        Box::pin(async move {
            request
                .tool
                .invoke(request.tool_call.args.clone(), request.invocation.clone())
                .await
                .map_err(|e| GraphError::Tool {
                    tool: request.tool_call.name.clone(),
                    error: e.to_string(),
                })
        })
    })
}

fn writes_to_update(writes: Vec<(String, Value)>) -> Value {
    let mut map = serde_json::Map::new();
    for (channel, value) in writes {
        map.insert(channel, value);
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RunContext;
    use serde_json::json;

    fn add_tool() -> Arc<Tool> {
        Arc::new(Tool::from_fn(
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
                Ok(json!((a + b) as i64))
            },
        ))
    }

    fn node_ctx(send_arg: Option<Value>) -> NodeContext {
        NodeContext {
            state: json!({"lead_channel": {"messages": []}, "messages": []}),
            send_arg,
            run: RunContext::new("t1", "r1"),
        }
    }

    #[tokio::test]
    async fn test_send_payload_executes_single_call() {
        let node = ToolNode::new(add_tool(), "lead", "lead_channel", &[]);
        let ctx = node_ctx(Some(json!({
            "tool_call": {"id": "t1", "name": "add", "args": {"a": 2, "b": 3}}
        })));

        let output = node.execute(ctx).await.unwrap();
        let NodeOutput::Writes(writes) = output else {
            panic!("expected writes");
        };
        // Tool message lands in the agent channel and the shared channel
        assert_eq!(writes.len(), 2);
        let (channel, value) = &writes[0];
        assert_eq!(channel, "lead_channel");
        assert_eq!(value["messages"][0]["tool_call_id"], json!("t1"));
        assert_eq!(value["messages"][0]["content"], json!("5"));
    }

    #[tokio::test]
    async fn test_calls_resolved_from_agent_channel() {
        let node = ToolNode::new(add_tool(), "lead", "lead_channel", &[]);
        let ai = Message::ai("let me add")
            .with_tool_calls(vec![ToolCall::new("t2", "add", json!({"a": 1, "b": 1}))]);
        let ctx = NodeContext {
            state: json!({"lead_channel": {"messages": [ai.to_value()]}}),
            send_arg: None,
            run: RunContext::new("t1", "r1"),
        };

        let output = node.execute(ctx).await.unwrap();
        let NodeOutput::Writes(writes) = output else {
            panic!("expected writes");
        };
        assert_eq!(writes[0].1["messages"][0]["tool_call_id"], json!("t2"));
    }

    #[tokio::test]
    async fn test_error_becomes_error_tool_message() {
        let failing = Arc::new(Tool::from_fn(
            "boom",
            "Always fails",
            json!({"type": "object"}),
            |_args, _invocation| async move { Err::<Value, _>("kaput".to_string()) },
        ));
        let node = ToolNode::new(failing, "lead", "lead_channel", &[]);
        let ctx = node_ctx(Some(json!({
            "tool_call": {"id": "t3", "name": "boom", "args": {}}
        })));

        let output = node.execute(ctx).await.unwrap();
        let NodeOutput::Writes(writes) = output else {
            panic!("expected writes");
        };
        let message = &writes[0].1["messages"][0];
        assert_eq!(message["status"], json!("error"));
        assert!(message["content"].as_str().unwrap().starts_with("Error:"));
        assert_eq!(message["tool_call_id"], json!("t3"));
    }

    #[tokio::test]
    async fn test_error_escalates_when_handling_disabled() {
        let failing = Arc::new(Tool::from_fn(
            "boom",
            "Always fails",
            json!({"type": "object"}),
            |_args, _invocation| async move { Err::<Value, _>("kaput".to_string()) },
        ));
        let node =
            ToolNode::new(failing, "lead", "lead_channel", &[]).with_error_handling(false);
        let ctx = node_ctx(Some(json!({
            "tool_call": {"id": "t4", "name": "boom", "args": {}}
        })));

        let err = node.execute(ctx).await.unwrap_err();
        assert!(matches!(err, GraphError::Tool { .. }));
    }

    #[tokio::test]
    async fn test_variable_assigners() {
        let structured = Arc::new(Tool::from_fn(
            "lookup",
            "Structured result",
            json!({"type": "object"}),
            |_args, _invocation| async move {
                Ok(json!({"content": "the answer", "artifact": {"rows": 3}}))
            },
        ));
        let node = ToolNode::new(structured, "lead", "lead_channel", &[]).with_variables(vec![
            VariableAssigner {
                channel: "answer".to_string(),
                source: AssignSource::Content,
            },
            VariableAssigner {
                channel: "rows".to_string(),
                source: AssignSource::Artifact,
            },
        ]);
        let ctx = node_ctx(Some(json!({
            "tool_call": {"id": "t5", "name": "lookup", "args": {}}
        })));

        let output = node.execute(ctx).await.unwrap();
        let NodeOutput::Writes(writes) = output else {
            panic!("expected writes");
        };
        assert!(writes
            .iter()
            .any(|(c, v)| c == "answer" && v == &json!("the answer")));
        assert!(writes
            .iter()
            .any(|(c, v)| c == "rows" && v == &json!({"rows": 3})));
    }

    #[tokio::test]
    async fn test_command_messages_rewritten_to_agent_channel() {
        let commander = Arc::new(Tool::new(
            "handoff",
            "Returns a command",
            json!({"type": "object"}),
            Arc::new(|_args, _invocation| {
                Box::pin(async move {
                    Ok(ToolOutcome::Command(
                        crate::command::Command::new()
                            .with_update(json!({"messages": [{"id": "m9", "role": "tool", "content": "done", "tool_call_id": "t6"}]}))
                            .with_goto("other_agent"),
                    ))
                })
            }),
        ));
        let node = ToolNode::new(commander, "lead", "lead_channel", &[]);
        let ctx = node_ctx(Some(json!({
            "tool_call": {"id": "t6", "name": "handoff", "args": {}}
        })));

        let output = node.execute(ctx).await.unwrap();
        let NodeOutput::Command(command) = output else {
            panic!("expected command");
        };
        let update = command.update.unwrap();
        assert_eq!(update["lead_channel"]["messages"][0]["id"], json!("m9"));
        assert!(command.goto.is_some());
    }
}
