//! Subgraph compiler
//!
//! Translates a declarative [`Xpert`] into an executable [`CompiledGraph`]
//! rooted at one agent: hook chains around the model call, a conditional
//! router fanning tool calls out to tool and sub-agent nodes, workflow
//! nodes with their navigators, and the channel set the whole thing runs
//! on. Followers and collaborators compile recursively into sub-agent
//! tools; sensitive tools register into `interrupt_before`.

use crate::error::{GraphError, Result};
use crate::graph::{
    node_fn, CompiledGraph, ConditionalEdge, NodeContext, NodeOutput, NodeSpec, RouterTarget,
    END, SUMMARIZE_CONVERSATION, TITLE_CONVERSATION,
};
use crate::ledger::{Execution, ExecutionOutcome, ModelUsage};
use crate::llm::{ChatModel, ModelCallContext, ModelRequest, ToolDefinition};
use crate::messages::{last_ai_message, messages_from_value, Message, MessageRole};
use crate::middleware::{
    compose_model_call, validate_middlewares, AgentMiddleware, HookOutcome, JumpTo,
};
use crate::pregel::{Runner, RunStatus};
use crate::runtime::RunContext;
use crate::send::Send;
use crate::stream::RunEvent;
use crate::tool::{Tool, ToolError, ToolRegistry, Toolset};
use crate::tool_node::{AssignSource, ToolNode, VariableAssigner};
use crate::xpert::{
    ErrorHandling, KnowledgeNode, RecallParams, StructuredOutputMethod, WorkflowKind,
    WorkflowNode, Xpert, XpertAgent, XpertNodeEntity,
};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use xpert_checkpoint::channels::ChannelSpec;
use xpert_checkpoint::CheckpointSaver;

/// Produces retriever tools bound to a knowledgebase
pub trait KnowledgeRetriever: ::core::marker::Send + Sync {
    fn retriever_tool(&self, knowledgebase_id: &str, recall: &RecallParams) -> Tool;
}

/// Everything the compiler needs besides the Xpert itself
#[derive(Clone)]
pub struct CompileOptions {
    pub model: Arc<dyn ChatModel>,
    pub middlewares: Vec<Arc<dyn AgentMiddleware>>,
    pub toolsets: Vec<Arc<dyn Toolset>>,
    pub knowledge: Option<Arc<dyn KnowledgeRetriever>>,
    /// External Xperts resolved by id, for collaborators
    pub collaborators: HashMap<String, Xpert>,
    /// Checkpointer sub-agent runners persist into
    pub checkpointer: Arc<dyn CheckpointSaver>,
    /// Convert tool failures into error tool messages (default true)
    pub handle_tool_errors: bool,
}

impl CompileOptions {
    pub fn new(model: Arc<dyn ChatModel>, checkpointer: Arc<dyn CheckpointSaver>) -> Self {
        Self {
            model,
            middlewares: Vec::new(),
            toolsets: Vec::new(),
            knowledge: None,
            collaborators: HashMap::new(),
            checkpointer,
            handle_tool_errors: true,
        }
    }

    pub fn with_middlewares(mut self, middlewares: Vec<Arc<dyn AgentMiddleware>>) -> Self {
        self.middlewares = middlewares;
        self
    }

    pub fn with_toolsets(mut self, toolsets: Vec<Arc<dyn Toolset>>) -> Self {
        self.toolsets = toolsets;
        self
    }

    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeRetriever>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn with_collaborator(mut self, xpert: Xpert) -> Self {
        self.collaborators.insert(xpert.id.clone(), xpert);
        self
    }

    pub fn with_handle_tool_errors(mut self, handle: bool) -> Self {
        self.handle_tool_errors = handle;
        self
    }
}

/// Compile an Xpert into an executable graph rooted at `entry_key`
pub async fn compile_xpert(
    xpert: &Xpert,
    entry_key: &str,
    options: &CompileOptions,
) -> Result<CompiledGraph> {
    let mut stack = Vec::new();
    compile_agent(xpert, entry_key, options, &mut stack).await
}

fn compile_agent<'a>(
    xpert: &'a Xpert,
    entry_key: &'a str,
    options: &'a CompileOptions,
    stack: &'a mut Vec<String>,
) -> BoxFuture<'a, Result<CompiledGraph>> {
    Box::pin(async move {
        if stack.iter().any(|k| k == entry_key) {
            return Err(GraphError::configuration(format!(
                "agent '{entry_key}' is part of a follower cycle: {stack:?}"
            )));
        }
        stack.push(entry_key.to_string());
        let result = compile_agent_inner(xpert, entry_key, options, stack).await;
        stack.pop();
        result
    })
}

async fn compile_agent_inner(
    xpert: &Xpert,
    entry_key: &str,
    options: &CompileOptions,
    stack: &mut Vec<String>,
) -> Result<CompiledGraph> {
    let agent = xpert
        .agent(entry_key)
        .ok_or_else(|| GraphError::configuration(format!("unknown agent '{entry_key}'")))?;
    validate_middlewares(&options.middlewares)?;

    let agent_channel = format!("{}_channel", agent.key);
    let mut graph = CompiledGraph::new();
    graph.agent_channel = Some(agent_channel.clone());

    // Channels: shared messages, the agent channel, then contributions
    graph.add_channel("messages", ChannelSpec::Messages)?;
    graph.add_channel(&agent_channel, ChannelSpec::Agent)?;
    if agent.options.title_conversation {
        graph.add_channel("title", ChannelSpec::LastValue(None))?;
    }
    if !agent.knowledgebase_ids.is_empty() {
        graph.add_channel("knowledgebase_channel", ChannelSpec::LastValue(None))?;
    }
    for middleware in &options.middlewares {
        for (name, spec) in middleware.state_channels() {
            graph.add_channel(name, spec)?;
        }
    }

    // Tool collection
    let mut registry = ToolRegistry::new();
    let mut toolset_of: HashMap<String, String> = HashMap::new();
    collect_toolset_tools(xpert, agent, options, &mut registry, &mut toolset_of).await?;
    collect_knowledge_tools(xpert, agent, options, &mut registry)?;
    for middleware in &options.middlewares {
        for tool in middleware.tools() {
            registry.register(tool);
        }
    }

    // Workflow nodes reachable from this agent
    let workflows = reachable_workflows(xpert, agent);
    for workflow in &workflows {
        if let Some(channel) = &workflow.channel {
            graph.add_channel(channel, ChannelSpec::LastValue(None))?;
        }
        if let WorkflowKind::Task {
            description,
            schema,
            result,
        } = &workflow.kind
        {
            registry.register(workflow_task_tool(workflow, description, schema, result));
        }
    }

    // Sub-agent tools: followers by agent name, collaborators by xpert id
    for follower_key in &agent.followers {
        let follower = xpert.agent(follower_key).ok_or_else(|| {
            GraphError::configuration(format!(
                "agent '{}' follows unknown agent '{follower_key}'",
                agent.key
            ))
        })?;
        let sub_graph = compile_agent(xpert, follower_key, options, stack).await?;
        let tool = sub_agent_tool(
            follower.name.clone(),
            follower.key.clone(),
            format!("{}_channel", follower.key),
            Arc::new(sub_graph),
            Arc::clone(&options.checkpointer),
        );
        registry.register(tool);
    }
    for collaborator_id in &agent.collaborators {
        let external = options.collaborators.get(collaborator_id).ok_or_else(|| {
            GraphError::configuration(format!("unresolved collaborator '{collaborator_id}'"))
        })?;
        let primary = external.primary_agent().ok_or_else(|| {
            GraphError::configuration(format!("collaborator '{collaborator_id}' has no agent"))
        })?;
        let mut sub_stack = Vec::new();
        let sub_graph = compile_agent(external, &primary.key, options, &mut sub_stack).await?;
        let tool = sub_agent_tool(
            collaborator_id.clone(),
            primary.key.clone(),
            format!("{}_channel", primary.key),
            Arc::new(sub_graph),
            Arc::clone(&options.checkpointer),
        );
        registry.register(tool);
    }

    // Sensitive tools interrupt before execution
    for tool in registry.iter() {
        if tool.sensitive {
            graph.interrupt_before.push(tool.name.clone());
        }
    }

    // Node names
    let exit_node = format!("{}__exit", agent.key);
    let before_agent: Vec<(Arc<dyn AgentMiddleware>, String)> = options
        .middlewares
        .iter()
        .filter(|m| m.hooks().before_agent)
        .map(|m| (Arc::clone(m), format!("{}.before_agent", m.name())))
        .collect();
    let before_model: Vec<(Arc<dyn AgentMiddleware>, String)> = options
        .middlewares
        .iter()
        .filter(|m| m.hooks().before_model)
        .map(|m| (Arc::clone(m), format!("{}.before_model", m.name())))
        .collect();
    // After hooks run in reverse registration order
    let after_model: Vec<(Arc<dyn AgentMiddleware>, String)> = options
        .middlewares
        .iter()
        .rev()
        .filter(|m| m.hooks().after_model)
        .map(|m| (Arc::clone(m), format!("{}.after_model", m.name())))
        .collect();
    let after_agent: Vec<(Arc<dyn AgentMiddleware>, String)> = options
        .middlewares
        .iter()
        .rev()
        .filter(|m| m.hooks().after_agent)
        .map(|m| (Arc::clone(m), format!("{}.after_agent", m.name())))
        .collect();

    let call_model_node = agent.key.clone();
    let loop_entry = before_model
        .first()
        .map(|(_, name)| name.clone())
        .unwrap_or_else(|| call_model_node.clone());
    let start_node = before_agent
        .first()
        .map(|(_, name)| name.clone())
        .unwrap_or_else(|| loop_entry.clone());
    let after_agent_head = after_agent
        .first()
        .map(|(_, name)| name.clone())
        .unwrap_or_else(|| exit_node.clone());
    let router_source = after_model
        .last()
        .map(|(_, name)| name.clone())
        .unwrap_or_else(|| call_model_node.clone());

    // Hook nodes and their chains
    let tool_node_names: HashSet<String> = registry.names().into_iter().collect();
    for (middleware, name) in before_agent
        .iter()
        .chain(&before_model)
        .chain(&after_model)
        .chain(&after_agent)
    {
        graph.add_node(NodeSpec::new(
            name.clone(),
            hook_executor(
                Arc::clone(middleware),
                name.clone(),
                agent_channel.clone(),
                loop_entry.clone(),
                exit_node.clone(),
                tool_node_names.clone(),
            ),
        ));
    }
    chain(&mut graph, &before_agent, &loop_entry);
    chain(&mut graph, &before_model, &call_model_node);
    if let Some((_, first_after)) = after_model.first() {
        graph.add_edge(call_model_node.clone(), first_after.clone());
        chain_names(&mut graph, &after_model);
    }
    chain_names(&mut graph, &after_agent);
    if let Some((_, last_after_agent)) = after_agent.last() {
        graph.add_edge(last_after_agent.clone(), exit_node.clone());
    }

    // The model-call node
    graph.add_node(NodeSpec::new(
        call_model_node.clone(),
        call_model_executor(agent.clone(), agent_channel.clone(), &registry, options),
    ));

    // Router out of the model loop: no tool calls → after-agent chain;
    // otherwise one Send per tool call to the matching tool node
    let mut path_map: Vec<String> = tool_node_names.iter().cloned().collect();
    path_map.sort();
    path_map.push(after_agent_head.clone());
    let router_channel = agent_channel.clone();
    let router_fallthrough = after_agent_head.clone();
    let router_tools = tool_node_names.clone();
    graph.add_conditional(ConditionalEdge {
        source: router_source,
        router: Arc::new(move |state| {
            route_model_output(state, &router_channel, &router_tools, &router_fallthrough)
        }),
        path_map,
    });

    // Tool and sub-agent nodes
    for tool in registry.iter() {
        let name = tool.name.clone();
        let mut variables = Vec::new();
        if agent
            .knowledgebase_ids
            .iter()
            .any(|id| name == knowledge_tool_name(id))
        {
            variables.push(VariableAssigner {
                channel: "knowledgebase_channel".to_string(),
                source: AssignSource::Artifact,
            });
        }
        if let Some(workflow) = workflows.iter().find(|w| workflow_task_name(&w.key) == name) {
            if let Some(channel) = &workflow.channel {
                variables.push(VariableAssigner {
                    channel: channel.clone(),
                    source: AssignSource::Artifact,
                });
            }
        }

        let mut tool_node = ToolNode::new(
            Arc::clone(tool),
            agent.key.clone(),
            agent_channel.clone(),
            &options.middlewares,
        )
        .with_variables(variables)
        .with_error_handling(options.handle_tool_errors);
        if let Some(toolset_id) = toolset_of.get(&name) {
            tool_node = tool_node.with_toolset_id(toolset_id.clone());
        }
        let tool_node = Arc::new(tool_node);
        graph.add_node(NodeSpec::new(
            name.clone(),
            Arc::new(move |ctx: NodeContext| {
                let tool_node = Arc::clone(&tool_node);
                Box::pin(async move { tool_node.execute(ctx).await })
            }),
        ));

        // End-node tools add END (and next) to their successors instead of
        // looping back into the model
        let is_end_tool = tool.end_node || agent.options.end_nodes.contains(&name);
        if is_end_tool {
            for next in &agent.next {
                graph.add_edge(name.clone(), next.clone());
            }
            graph.add_edge(name.clone(), END);
        } else {
            graph.add_edge(name.clone(), loop_entry.clone());
        }
    }

    // Exit node: terminal bookkeeping fans out to summarize/title, then
    // declared successors or END
    graph.add_node(NodeSpec::new(
        exit_node.clone(),
        node_fn(|_ctx| async move { Ok(NodeOutput::empty()) }),
    ));
    let mut exit_targets: Vec<String> = Vec::new();
    if agent.options.summarize_conversation {
        exit_targets.push(SUMMARIZE_CONVERSATION.to_string());
    }
    if agent.options.title_conversation {
        exit_targets.push(TITLE_CONVERSATION.to_string());
    }
    for next in &agent.next {
        exit_targets.push(next.clone());
    }
    if exit_targets.is_empty() {
        exit_targets.push(END.to_string());
    }
    for target in &exit_targets {
        graph.add_edge(exit_node.clone(), target.clone());
    }

    if agent.options.summarize_conversation {
        graph.add_node(NodeSpec::new(
            SUMMARIZE_CONVERSATION,
            summarize_executor(agent_channel.clone(), Arc::clone(&options.model)),
        ));
        graph.add_edge(SUMMARIZE_CONVERSATION, END);
    }
    if agent.options.title_conversation {
        graph.add_node(NodeSpec::new(
            TITLE_CONVERSATION,
            title_executor(Arc::clone(&options.model)),
        ));
        graph.add_edge(TITLE_CONVERSATION, END);
    }

    // Workflow nodes and their navigators
    for workflow in &workflows {
        add_workflow_node(&mut graph, xpert, workflow)?;
    }

    graph.set_entry(start_node);
    graph.mark_deferred_joins();
    graph.validate()?;
    Ok(graph)
}

/// Chain hook nodes into each other, ending at `tail`
fn chain(
    graph: &mut CompiledGraph,
    hooks: &[(Arc<dyn AgentMiddleware>, String)],
    tail: &str,
) {
    for window in hooks.windows(2) {
        graph.add_edge(window[0].1.clone(), window[1].1.clone());
    }
    if let Some((_, last)) = hooks.last() {
        graph.add_edge(last.clone(), tail.to_string());
    }
}

/// Chain hook nodes into each other with no tail edge
fn chain_names(graph: &mut CompiledGraph, hooks: &[(Arc<dyn AgentMiddleware>, String)]) {
    for window in hooks.windows(2) {
        graph.add_edge(window[0].1.clone(), window[1].1.clone());
    }
}

fn route_model_output(
    state: &Value,
    agent_channel: &str,
    tool_nodes: &HashSet<String>,
    fallthrough: &str,
) -> Result<RouterTarget> {
    let channel = &state[agent_channel];
    let messages = messages_from_value(&channel["messages"]);
    let Some(ai) = last_ai_message(&messages) else {
        return Ok(RouterTarget::Node(fallthrough.to_string()));
    };
    let calls = ai.tool_calls();
    if calls.is_empty() {
        return Ok(RouterTarget::Node(fallthrough.to_string()));
    }

    let mut sends = Vec::with_capacity(calls.len());
    for call in calls {
        if !tool_nodes.contains(&call.name) {
            return Err(GraphError::input(format!(
                "model called unknown tool '{}'",
                call.name
            )));
        }
        sends.push(Send::new(call.name.clone(), json!({ "tool_call": call })));
    }
    Ok(RouterTarget::Sends(sends))
}

fn hook_executor(
    middleware: Arc<dyn AgentMiddleware>,
    node_name: String,
    agent_channel: String,
    loop_entry: String,
    exit_node: String,
    tool_nodes: HashSet<String>,
) -> crate::graph::NodeExecutor {
    Arc::new(move |ctx: NodeContext| {
        let middleware = Arc::clone(&middleware);
        let node_name = node_name.clone();
        let agent_channel = agent_channel.clone();
        let loop_entry = loop_entry.clone();
        let exit_node = exit_node.clone();
        let tool_nodes = tool_nodes.clone();
        Box::pin(async move {
            let state = ctx.channel(&agent_channel);
            let outcome = run_hook(&middleware, &node_name, &state, &ctx.run).await?;

            let mut writes: Vec<(String, Value)> = Vec::new();
            if let Some(update) = &outcome.update {
                writes.push((agent_channel.clone(), update.clone()));
                // Mirror message updates into the shared channel
                if let Some(messages) = update.get("messages") {
                    writes.push(("messages".to_string(), messages.clone()));
                }
            }

            match outcome.jump_to {
                None => Ok(NodeOutput::Writes(writes)),
                Some(jump) => {
                    let goto = match jump {
                        JumpTo::Model => RouterTarget::Node(loop_entry.clone()),
                        JumpTo::End => RouterTarget::Node(exit_node.clone()),
                        JumpTo::Tools => {
                            // Fan out over the (possibly rewritten) calls
                            let source = outcome
                                .update
                                .as_ref()
                                .filter(|u| u.get("messages").is_some())
                                .cloned()
                                .unwrap_or(state);
                            route_model_output(
                                &json!({ agent_channel.clone(): source }),
                                &agent_channel,
                                &tool_nodes,
                                &exit_node,
                            )?
                        }
                    };
                    let command = match goto {
                        RouterTarget::Node(node) => crate::command::Command::new()
                            .with_update(update_map(writes))
                            .with_goto(node),
                        RouterTarget::Sends(sends) => crate::command::Command::new()
                            .with_update(update_map(writes))
                            .with_goto(sends),
                        RouterTarget::Nodes(nodes) => crate::command::Command::new()
                            .with_update(update_map(writes))
                            .with_goto(nodes),
                        RouterTarget::End => crate::command::Command::new()
                            .with_update(update_map(writes))
                            .with_goto(exit_node.clone()),
                    };
                    Ok(NodeOutput::Command(command))
                }
            }
        })
    })
}

async fn run_hook(
    middleware: &Arc<dyn AgentMiddleware>,
    node_name: &str,
    state: &Value,
    ctx: &RunContext,
) -> Result<HookOutcome> {
    if node_name.ends_with(".before_agent") {
        middleware.before_agent(state, ctx).await
    } else if node_name.ends_with(".before_model") {
        middleware.before_model(state, ctx).await
    } else if node_name.ends_with(".after_model") {
        middleware.after_model(state, ctx).await
    } else {
        middleware.after_agent(state, ctx).await
    }
}

fn update_map(writes: Vec<(String, Value)>) -> Value {
    let mut map = serde_json::Map::new();
    for (channel, value) in writes {
        map.insert(channel, value);
    }
    Value::Object(map)
}

fn call_model_executor(
    agent: XpertAgent,
    agent_channel: String,
    registry: &ToolRegistry,
    options: &CompileOptions,
) -> crate::graph::NodeExecutor {
    let definitions: Vec<ToolDefinition> = registry
        .iter()
        .map(|tool| {
            let mut def = ToolDefinition::new(
                tool.name.clone(),
                tool.description.clone(),
                tool.schema.clone(),
            );
            if let Some(dict) = &tool.provider_dict {
                def = def.with_provider_dict(dict.clone());
            }
            def
        })
        .collect();
    let handler_model = Arc::clone(&options.model);
    let middlewares = options.middlewares.clone();
    let agent = Arc::new(agent);

    Arc::new(move |ctx: NodeContext| {
        let agent = Arc::clone(&agent);
        let agent_channel = agent_channel.clone();
        let definitions = definitions.clone();
        let model = Arc::clone(&handler_model);
        let middlewares = middlewares.clone();
        Box::pin(async move {
            let channel_state = ctx.channel(&agent_channel);

            let execution = Execution::open(
                ctx.run.thread_id.clone(),
                agent.key.clone(),
                channel_state.clone(),
            )
            .with_namespace(ctx.run.checkpoint_ns.clone());
            let execution = match &ctx.run.agent_key {
                Some(caller) if caller != &agent.key => {
                    execution.with_predecessor(caller.clone())
                }
                _ => execution,
            };
            let execution_id = execution.id.clone();
            ctx.run
                .ledger
                .open(execution)
                .await
                .map_err(|e| GraphError::node(&agent.key, e.to_string()))?;
            let _ = ctx.run.events.emit(RunEvent::AgentStart {
                execution_id: execution_id.clone(),
                agent_key: agent.key.clone(),
            });

            let request = build_model_request(&agent, &channel_state, &definitions, &ctx);
            let events = ctx.run.events.clone();
            let agent_key = agent.key.clone();
            let call_ctx = ModelCallContext::new(ctx.run.signal.clone()).with_delta_sink(
                Arc::new(move |delta: &str| {
                    let _ = events.emit(RunEvent::ChatMessageChunk {
                        delta: delta.to_string(),
                        message_id: None,
                        agent_key: agent_key.clone(),
                    });
                }),
            );
            let core_model = Arc::clone(&model);
            let core: crate::middleware::ModelHandler = Arc::new(move |request| {
                let model = Arc::clone(&core_model);
                let call_ctx = call_ctx.clone();
                Box::pin(async move { model.chat(request, &call_ctx).await })
            });
            let handler = compose_model_call(&middlewares, core);

            let result = call_with_retries(&agent, request, &handler).await;
            let completion = match result {
                Ok(completion) => completion,
                Err(error) if error.is_interrupt() => {
                    return Err(error);
                }
                Err(error) => {
                    ctx.run
                        .ledger
                        .close(&execution_id, ExecutionOutcome::error(error.to_string()))
                        .await
                        .ok();
                    return handle_model_error(&agent, &agent_channel, error);
                }
            };

            let mut message = completion.message.clone();
            message.ensure_id();
            let usage = completion.usage.clone().unwrap_or(ModelUsage::default());

            let mut update = serde_json::Map::new();
            update.insert("messages".to_string(), json!([message.to_value()]));
            if let Some(output) = &agent.output_variables {
                if let Ok(parsed) = serde_json::from_str::<Value>(&message.content) {
                    if crate::schema::validate(&output.schema, &parsed).is_ok() {
                        update.insert("output".to_string(), parsed);
                    }
                }
            }

            ctx.run
                .ledger
                .close(
                    &execution_id,
                    ExecutionOutcome::success(message.to_value()).with_usage(usage),
                )
                .await
                .ok();
            let _ = ctx.run.events.emit(RunEvent::AgentEnd {
                execution: json!({ "execution_id": execution_id, "agent_key": agent.key }),
            });

            Ok(NodeOutput::Writes(vec![
                (agent_channel.clone(), Value::Object(update)),
                ("messages".to_string(), message.to_value()),
            ]))
        })
    })
}

fn build_model_request(
    agent: &XpertAgent,
    channel_state: &Value,
    definitions: &[ToolDefinition],
    ctx: &NodeContext,
) -> ModelRequest {
    let mut system = agent.prompt.clone();
    if let Some(output) = &agent.output_variables {
        if agent.options.structured_output_method == StructuredOutputMethod::Prompt {
            system.push_str(&format!(
                "\n\nRespond with a single JSON object named '{}' matching this schema: {}",
                output.name, output.schema
            ));
        }
    }

    let mut messages = messages_from_value(&channel_state["messages"]);
    if agent.options.disable_message_history {
        // History off: the prompt carries only the current human turn
        messages = messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Human)
            .cloned()
            .into_iter()
            .collect();
    }

    ModelRequest::new(messages)
        .with_system(system)
        .with_tools(definitions.to_vec())
        .with_state(channel_state.clone())
        .with_signal(ctx.run.signal.clone())
}

async fn call_with_retries(
    agent: &XpertAgent,
    request: ModelRequest,
    handler: &crate::middleware::ModelHandler,
) -> Result<crate::llm::ChatCompletion> {
    let mut attempt = 0;
    let mut tried_fallback = false;
    let mut request = request;
    loop {
        match handler(request.clone()).await {
            Ok(completion) => return Ok(completion),
            Err(error) if error.is_interrupt() => return Err(error),
            Err(GraphError::Input(e)) => return Err(GraphError::Input(e)),
            Err(error) => {
                if attempt < agent.options.retries {
                    attempt += 1;
                    tracing::debug!(agent = %agent.key, attempt, "retrying model call");
                    continue;
                }
                if let Some(fallback) = &agent.options.fallback_model {
                    if !tried_fallback {
                        tried_fallback = true;
                        request.model = Some(fallback.clone());
                        tracing::debug!(agent = %agent.key, fallback = %fallback, "switching to fallback model");
                        continue;
                    }
                }
                return Err(error);
            }
        }
    }
}

fn handle_model_error(
    agent: &XpertAgent,
    agent_channel: &str,
    error: GraphError,
) -> Result<NodeOutput> {
    match &agent.options.error_handling {
        Some(ErrorHandling::DefaultValue { content }) => {
            let message = Message::ai(content.clone());
            Ok(NodeOutput::Writes(vec![
                (
                    agent_channel.to_string(),
                    json!({ "messages": [message.to_value()], "error": error.to_string() }),
                ),
                ("messages".to_string(), message.to_value()),
            ]))
        }
        Some(ErrorHandling::FailBranch) => match &agent.fail {
            Some(fail_node) => Ok(NodeOutput::Command(
                crate::command::Command::new()
                    .with_update(json!({ agent_channel: { "error": error.to_string() } }))
                    .with_goto(fail_node.clone()),
            )),
            None => Err(GraphError::configuration(format!(
                "agent '{}' declares fail-branch error handling without a fail node",
                agent.key
            ))),
        },
        None => Err(error),
    }
}

fn summarize_executor(
    agent_channel: String,
    model: Arc<dyn ChatModel>,
) -> crate::graph::NodeExecutor {
    Arc::new(move |ctx: NodeContext| {
        let agent_channel = agent_channel.clone();
        let model = Arc::clone(&model);
        Box::pin(async move {
            let messages = messages_from_value(&ctx.channel("messages"));
            let transcript = messages
                .iter()
                .map(|m| format!("{:?}: {}", m.role, m.content))
                .collect::<Vec<_>>()
                .join("\n");
            let request = ModelRequest::new(vec![Message::human(format!(
                "Summarize this conversation in a short paragraph:\n\n{transcript}"
            ))])
            .with_signal(ctx.run.signal.clone());
            let call_ctx = ModelCallContext::new(ctx.run.signal.clone());
            let completion = model.chat(request, &call_ctx).await?;
            Ok(NodeOutput::write(
                agent_channel,
                json!({ "summary": completion.message.content }),
            ))
        })
    })
}

fn title_executor(model: Arc<dyn ChatModel>) -> crate::graph::NodeExecutor {
    Arc::new(move |ctx: NodeContext| {
        let model = Arc::clone(&model);
        Box::pin(async move {
            let messages = messages_from_value(&ctx.channel("messages"));
            let opening = messages
                .iter()
                .find(|m| m.role == MessageRole::Human)
                .map(|m| m.content.clone())
                .unwrap_or_default();
            let request = ModelRequest::new(vec![Message::human(format!(
                "Produce a short title (max 6 words) for a conversation that starts with: {opening}"
            ))])
            .with_signal(ctx.run.signal.clone());
            let call_ctx = ModelCallContext::new(ctx.run.signal.clone());
            let completion = model.chat(request, &call_ctx).await?;
            Ok(NodeOutput::write(
                "title",
                Value::String(completion.message.content),
            ))
        })
    })
}

async fn collect_toolset_tools(
    xpert: &Xpert,
    agent: &XpertAgent,
    options: &CompileOptions,
    registry: &mut ToolRegistry,
    toolset_of: &mut HashMap<String, String>,
) -> Result<()> {
    for toolset_id in &agent.toolset_ids {
        let toolset = options
            .toolsets
            .iter()
            .find(|t| t.id() == toolset_id)
            .ok_or_else(|| {
                GraphError::configuration(format!("unresolved toolset '{toolset_id}'"))
            })?;
        // Allow-list from the toolset node, when declared
        let allow_list: Option<&Vec<String>> =
            xpert.graph.nodes.iter().find_map(|node| match &node.entity {
                XpertNodeEntity::Toolset(ts) if &ts.toolset_id == toolset_id && !ts.tools.is_empty() => {
                    Some(&ts.tools)
                }
                _ => None,
            });

        let tools = toolset
            .init_tools()
            .await
            .map_err(|e| GraphError::configuration(e.to_string()))?;
        for mut tool in tools {
            if let Some(allowed) = allow_list {
                if !allowed.contains(&tool.name) {
                    continue;
                }
            }
            // Per-tool overrides from the agent options
            if let Some(over) = agent.options.tools.get(&tool.name) {
                if let Some(description) = &over.description {
                    tool = tool.with_description(description.clone());
                }
                if over.sensitive {
                    tool = tool.sensitive();
                }
                if let Some(timeout_ms) = over.timeout_ms {
                    tool = tool.with_timeout(Duration::from_millis(timeout_ms));
                }
            }
            toolset_of.insert(tool.name.clone(), toolset_id.clone());
            registry.register(tool);
        }
    }
    Ok(())
}

fn knowledge_tool_name(knowledgebase_id: &str) -> String {
    format!("knowledge_search_{knowledgebase_id}")
}

fn collect_knowledge_tools(
    xpert: &Xpert,
    agent: &XpertAgent,
    options: &CompileOptions,
    registry: &mut ToolRegistry,
) -> Result<()> {
    if agent.knowledgebase_ids.is_empty() {
        return Ok(());
    }
    let retriever = options.knowledge.as_ref().ok_or_else(|| {
        GraphError::configuration(format!(
            "agent '{}' references knowledgebases but no retriever is configured",
            agent.key
        ))
    })?;
    for knowledgebase_id in &agent.knowledgebase_ids {
        let recall = xpert
            .graph
            .nodes
            .iter()
            .find_map(|node| match &node.entity {
                XpertNodeEntity::Knowledge(KnowledgeNode {
                    knowledgebase_id: id,
                    recall,
                }) if id == knowledgebase_id => Some(recall.clone()),
                _ => None,
            })
            .unwrap_or_default();
        let mut tool = retriever.retriever_tool(knowledgebase_id, &recall);
        tool.name = knowledge_tool_name(knowledgebase_id);
        registry.register(tool);
    }
    Ok(())
}

/// Callable surface of a workflow task, distinct from the workflow node
/// itself so both can live in one node set
fn workflow_task_name(key: &str) -> String {
    format!("task_{key}")
}

fn workflow_task_tool(
    workflow: &WorkflowNode,
    description: &str,
    schema: &Value,
    result: &Value,
) -> Tool {
    let result = result.clone();
    let key = workflow.key.clone();
    Tool::new(
        workflow_task_name(&workflow.key),
        description.to_string(),
        if schema.is_null() {
            json!({"type": "object"})
        } else {
            schema.clone()
        },
        Arc::new(move |_args, _invocation| {
            let result = result.clone();
            let key = key.clone();
            Box::pin(async move {
                tracing::debug!(workflow = %key, "workflow task invoked");
                Ok(crate::tool::ToolOutcome::Raw(json!({
                    "content": result_to_content(&result),
                    "artifact": result,
                })))
            })
        }),
    )
}

fn result_to_content(result: &Value) -> String {
    match result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Workflow nodes reachable from the agent's `next` set via connections
/// and route destinations
fn reachable_workflows<'x>(xpert: &'x Xpert, agent: &XpertAgent) -> Vec<&'x WorkflowNode> {
    let mut queue: Vec<String> = agent.next.clone();
    if let Some(fail) = &agent.fail {
        queue.push(fail.clone());
    }
    let mut seen: HashSet<String> = HashSet::new();
    let mut found = Vec::new();

    while let Some(key) = queue.pop() {
        if !seen.insert(key.clone()) {
            continue;
        }
        let Some(workflow) = xpert.workflow(&key) else {
            continue;
        };
        found.push(workflow);

        for connection in &xpert.graph.connections {
            if connection.from == key {
                queue.push(connection.to.clone());
            }
        }
        if let WorkflowKind::Route { cases, default, .. } = &workflow.kind {
            queue.extend(cases.values().cloned());
            if let Some(default) = default {
                queue.push(default.clone());
            }
        }
    }
    found
}

fn add_workflow_node(
    graph: &mut CompiledGraph,
    xpert: &Xpert,
    workflow: &WorkflowNode,
) -> Result<()> {
    match &workflow.kind {
        WorkflowKind::Task { result, .. } => {
            // Standalone execution of the task writes its result channel
            let channel = workflow.channel.clone();
            let result = result.clone();
            graph.add_node(NodeSpec::new(
                workflow.key.clone(),
                node_fn(move |_ctx| {
                    let channel = channel.clone();
                    let result = result.clone();
                    async move {
                        Ok(match channel {
                            Some(channel) => NodeOutput::write(channel, result),
                            None => NodeOutput::empty(),
                        })
                    }
                }),
            ));
            let mut targets: Vec<String> = xpert
                .graph
                .connections
                .iter()
                .filter(|c| c.from == workflow.key)
                .map(|c| c.to.clone())
                .collect();
            if workflow.is_end || targets.is_empty() {
                targets.push(END.to_string());
            }
            for target in targets {
                graph.add_edge(workflow.key.clone(), target);
            }
        }
        WorkflowKind::Route {
            input,
            field,
            cases,
            default,
        } => {
            graph.add_node(NodeSpec::new(
                workflow.key.clone(),
                node_fn(|_ctx| async move { Ok(NodeOutput::empty()) }),
            ));
            let mut path_map: Vec<String> = cases.values().cloned().collect();
            if let Some(default) = default {
                path_map.push(default.clone());
            }
            path_map.sort();
            path_map.dedup();
            if workflow.is_end {
                path_map.push(END.to_string());
            }

            let input = input.clone();
            let field = field.clone();
            let cases = cases.clone();
            let default = default.clone();
            graph.add_conditional(ConditionalEdge {
                source: workflow.key.clone(),
                router: Arc::new(move |state| {
                    let mut value = state.get(&input).cloned().unwrap_or(Value::Null);
                    if let Some(field) = &field {
                        value = value.get(field).cloned().unwrap_or(Value::Null);
                    }
                    let discriminant = match &value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    match cases.get(&discriminant).or(default.as_ref()) {
                        Some(target) => Ok(RouterTarget::Node(target.clone())),
                        None => Ok(RouterTarget::End),
                    }
                }),
                path_map,
            });
        }
    }
    Ok(())
}

fn sub_agent_tool(
    tool_name: String,
    sub_agent_key: String,
    sub_agent_channel: String,
    sub_graph: Arc<CompiledGraph>,
    checkpointer: Arc<dyn CheckpointSaver>,
) -> Tool {
    let description = format!("Delegate a task to the '{tool_name}' agent");
    let name_for_executor = tool_name.clone();
    Tool::new(
        tool_name,
        description,
        json!({
            "type": "object",
            "properties": {"input": {"type": "string", "description": "Task for the agent"}},
            "required": ["input"],
        }),
        Arc::new(move |args, invocation| {
            let sub_graph = Arc::clone(&sub_graph);
            let checkpointer = Arc::clone(&checkpointer);
            let name = name_for_executor.clone();
            let sub_agent_key = sub_agent_key.clone();
            let sub_agent_channel = sub_agent_channel.clone();
            Box::pin(async move {
                let input = args["input"].as_str().unwrap_or_default().to_string();
                let human = Message::human(input);
                let writes = vec![
                    ("messages".to_string(), human.to_value()),
                    (
                        sub_agent_channel.clone(),
                        json!({ "messages": [human.to_value()] }),
                    ),
                ];

                let child_ctx = invocation.run.child_scope(&name, sub_agent_key.clone());
                let runner = Runner::new(sub_graph, checkpointer);
                let outcome = runner.invoke(writes, child_ctx).await.map_err(|e| {
                    ToolError::ExecutionFailed {
                        tool: name.clone(),
                        error: e.to_string(),
                    }
                })?;

                match outcome.status {
                    RunStatus::Success => Ok(crate::tool::ToolOutcome::Raw(Value::String(
                        outcome.final_text().unwrap_or_default(),
                    ))),
                    other => Err(ToolError::ExecutionFailed {
                        tool: name,
                        error: format!("sub-agent run ended with status {other:?}"),
                    }),
                }
            })
        }),
    )
}
