//! LLM-driven tool selection
//!
//! Agents with large tool sets overflow provider limits and dilute the
//! model's attention. When more than `max_tools` tools are offered, this
//! wrapper asks a (possibly smaller) selector model for a structured list
//! of tool names and filters the request down to the selection plus an
//! `always_include` set. A selection referencing an unknown tool fails the
//! run; tool definitions carrying provider-specific dicts always pass
//! through untouched.

use crate::error::{GraphError, Result};
use crate::llm::{ChatCompletion, ChatModel, ModelCallContext, ModelRequest, ToolDefinition};
use crate::messages::Message;
use crate::middleware::{AgentMiddleware, ModelHandler};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Middleware name
pub const NAME: &str = "llm_tool_selector";

/// Selects a relevant subset of tools before the model call
pub struct LlmToolSelectorMiddleware {
    selector: Arc<dyn ChatModel>,
    max_tools: usize,
    always_include: Vec<String>,
}

impl LlmToolSelectorMiddleware {
    pub fn new(selector: Arc<dyn ChatModel>, max_tools: usize) -> Self {
        Self {
            selector,
            max_tools,
            always_include: Vec::new(),
        }
    }

    pub fn always_include(mut self, tool: impl Into<String>) -> Self {
        self.always_include.push(tool.into());
        self
    }

    fn selection_prompt(&self, request: &ModelRequest) -> String {
        let mut prompt = String::from(
            "Select the tools relevant to the conversation below. Respond with a JSON \
             object of the form {\"tools\": [\"name\", ...]} and nothing else.\n\nTools:\n",
        );
        for tool in &request.tools {
            prompt.push_str(&format!("- {}: {}\n", tool.name, tool.description));
        }
        prompt.push_str("\nConversation:\n");
        for message in request.messages.iter().rev().take(4).rev() {
            prompt.push_str(&format!("{:?}: {}\n", message.role, message.content));
        }
        prompt
    }

    fn parse_selection(content: &str) -> Result<Vec<String>> {
        let value: Value = serde_json::from_str(content.trim())
            .map_err(|e| GraphError::input(format!("selector output is not JSON: {e}")))?;
        let names = value
            .get("tools")
            .and_then(Value::as_array)
            .or_else(|| value.as_array())
            .ok_or_else(|| GraphError::input("selector output has no 'tools' array"))?;
        Ok(names
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect())
    }

    fn filter_tools(
        &self,
        tools: Vec<ToolDefinition>,
        selection: Vec<String>,
    ) -> Result<Vec<ToolDefinition>> {
        for name in &selection {
            if !tools.iter().any(|t| &t.name == name) {
                return Err(GraphError::input(format!(
                    "selector chose unknown tool '{name}'"
                )));
            }
        }

        // Cap the selection, then make sure always-included tools survive.
        let mut wanted: Vec<String> = selection.into_iter().take(self.max_tools).collect();
        for name in &self.always_include {
            if !wanted.contains(name) {
                wanted.push(name.clone());
            }
        }

        let kept = tools
            .into_iter()
            .filter(|tool| tool.provider_dict.is_some() || wanted.contains(&tool.name))
            .collect();
        Ok(kept)
    }
}

#[async_trait]
impl AgentMiddleware for LlmToolSelectorMiddleware {
    fn name(&self) -> &str {
        NAME
    }

    async fn wrap_model_call(
        &self,
        mut request: ModelRequest,
        next: &ModelHandler,
    ) -> Result<ChatCompletion> {
        if request.tools.len() <= self.max_tools {
            return next(request).await;
        }

        let prompt = self.selection_prompt(&request);
        let selector_request =
            ModelRequest::new(vec![Message::human(prompt)]).with_signal(request.signal.clone());
        let ctx = ModelCallContext::new(request.signal.clone());
        let completion = self.selector.chat(selector_request, &ctx).await?;
        let selection = Self::parse_selection(&completion.message.content)?;

        tracing::debug!(
            selected = selection.len(),
            offered = request.tools.len(),
            "tool selector filtered tool set"
        );
        request.tools = self.filter_tools(std::mem::take(&mut request.tools), selection)?;
        next(request).await
    }
}
