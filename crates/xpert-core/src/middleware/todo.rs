//! Todo-list middleware
//!
//! Demonstrates a state-schema extension: the middleware contributes its
//! own `todos` channel plus two tools that write it through commands. The
//! channel survives checkpoints like any other state.

use crate::command::Command;
use crate::middleware::{AgentMiddleware, MiddlewareHooks};
use crate::tool::{Tool, ToolOutcome};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;
use xpert_checkpoint::channels::{ChannelSpec, ReducerFn};

/// Middleware name
pub const NAME: &str = "todo_list";

/// Contributes a `todos` channel and tools for maintaining it
#[derive(Default)]
pub struct TodoListMiddleware;

impl TodoListMiddleware {
    pub fn new() -> Self {
        Self
    }
}

impl AgentMiddleware for TodoListMiddleware {
    fn name(&self) -> &str {
        NAME
    }

    fn hooks(&self) -> MiddlewareHooks {
        MiddlewareHooks::default()
    }

    fn state_channels(&self) -> Vec<(String, ChannelSpec)> {
        // Entries merge by id, last writer wins per field
        let reducer: ReducerFn = Arc::new(|current, update| {
            let mut entries = match current {
                Value::Array(items) => items,
                _ => vec![],
            };
            let updates = match update {
                Value::Array(items) => items,
                other => vec![other],
            };
            for incoming in updates {
                let id = incoming.get("id").cloned();
                let position = id
                    .as_ref()
                    .and_then(|id| entries.iter().position(|e| e.get("id") == Some(id)));
                match position {
                    Some(idx) => {
                        if let (Value::Object(existing), Value::Object(patch)) =
                            (&mut entries[idx], incoming)
                        {
                            for (k, v) in patch {
                                existing.insert(k, v);
                            }
                        }
                    }
                    None => entries.push(incoming),
                }
            }
            Value::Array(entries)
        });
        vec![("todos".to_string(), ChannelSpec::Reducer(json!([]), reducer))]
    }

    fn tools(&self) -> Vec<Tool> {
        let write = Tool::new(
            "write_todo",
            "Add an item to the shared todo list",
            json!({
                "type": "object",
                "properties": {"content": {"type": "string"}},
                "required": ["content"],
            }),
            std::sync::Arc::new(|args, _invocation| {
                Box::pin(async move {
                    let id = Uuid::new_v4().to_string();
                    let entry = json!({
                        "id": id,
                        "content": args["content"],
                        "status": "pending",
                    });
                    Ok(ToolOutcome::Command(
                        Command::new().with_update(json!({ "todos": [entry.clone()] })),
                    ))
                })
            }),
        );

        let complete = Tool::new(
            "complete_todo",
            "Mark a todo item as completed",
            json!({
                "type": "object",
                "properties": {"id": {"type": "string"}},
                "required": ["id"],
            }),
            std::sync::Arc::new(|args, _invocation| {
                Box::pin(async move {
                    let entry = json!({ "id": args["id"], "status": "completed" });
                    Ok(ToolOutcome::Command(
                        Command::new().with_update(json!({ "todos": [entry] })),
                    ))
                })
            }),
        );

        vec![write, complete]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declares_channel_and_tools() {
        let middleware = TodoListMiddleware::new();
        let channels = middleware.state_channels();
        assert_eq!(channels[0].0, "todos");

        let tools = middleware.tools();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["write_todo", "complete_todo"]);
    }

    #[tokio::test]
    async fn test_write_todo_returns_channel_command() {
        let middleware = TodoListMiddleware::new();
        let tools = middleware.tools();
        let write = &tools[0];

        let invocation = crate::tool::ToolInvocation::new(
            serde_json::Value::Null,
            crate::runtime::RunContext::new("t1", "r1"),
        );
        let outcome = write
            .invoke(json!({"content": "ship it"}), invocation)
            .await
            .unwrap();
        match outcome {
            ToolOutcome::Command(cmd) => {
                let writes = cmd.update_writes();
                assert_eq!(writes[0].0, "todos");
                assert_eq!(writes[0].1[0]["status"], json!("pending"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
