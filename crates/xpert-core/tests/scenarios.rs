//! End-to-end runtime scenarios against a scripted model

use serde_json::{json, Value};
use std::sync::Arc;
use xpert_checkpoint::{CheckpointConfig, CheckpointSaver, InMemoryCheckpointSaver};
use xpert_core::interrupt::DecisionType;
use xpert_core::llm::ChatCompletion;
use xpert_core::messages::{messages_from_value, Message, MessageRole, ToolMessageStatus};
use xpert_core::middleware::AgentMiddleware;
use xpert_core::xpert::{
    AgentConfig, StructuredOutput, ToolsetNode, Xpert, XpertAgent, XpertAgentOptions, XpertGraph,
    XpertNode, XpertNodeEntity,
};
use xpert_core::{
    compile_xpert, Command, CompileOptions, HumanInTheLoopMiddleware, ClientToolMiddleware,
    LlmToolSelectorMiddleware, MockChatModel, RunContext, RunStatus, Runner, RunnerConfig,
    SimpleToolset, Tool, ToolCall,
};

fn agent_xpert(agent: XpertAgent, toolset: Option<ToolsetNode>) -> Xpert {
    let mut nodes = vec![XpertNode {
        key: agent.key.clone(),
        entity: XpertNodeEntity::Agent(agent),
    }];
    if let Some(toolset) = toolset {
        nodes.push(XpertNode {
            key: format!("toolset_{}", toolset.toolset_id),
            entity: XpertNodeEntity::Toolset(toolset),
        });
    }
    Xpert {
        id: "x1".to_string(),
        slug: "assistant".to_string(),
        name: "Assistant".to_string(),
        description: None,
        version: "1".to_string(),
        latest: true,
        graph: XpertGraph {
            nodes,
            connections: vec![],
        },
        agent_config: AgentConfig::default(),
    }
}

fn base_agent(key: &str) -> XpertAgent {
    XpertAgent {
        key: key.to_string(),
        name: key.to_string(),
        prompt: "You are a helpful assistant.".to_string(),
        parameters: None,
        output_variables: None,
        toolset_ids: vec![],
        knowledgebase_ids: vec![],
        followers: vec![],
        collaborators: vec![],
        next: vec![],
        fail: None,
        options: XpertAgentOptions::default(),
    }
}

fn add_tool() -> Tool {
    Tool::from_fn(
        "add",
        "Add two numbers",
        json!({
            "type": "object",
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
            "required": ["a", "b"],
        }),
        |args, _invocation| async move {
            let a = args["a"].as_i64().unwrap_or(0);
            let b = args["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        },
    )
}

fn human_input(agent_key: &str, text: &str) -> Vec<(String, Value)> {
    let human = Message::human(text);
    vec![
        ("messages".to_string(), human.to_value()),
        (
            format!("{agent_key}_channel"),
            json!({ "messages": [human.to_value()] }),
        ),
    ]
}

async fn compile_and_run(
    xpert: &Xpert,
    options: &CompileOptions,
    input: Vec<(String, Value)>,
    checkpointer: Arc<dyn CheckpointSaver>,
) -> (Runner, xpert_core::RunOutcome) {
    let graph = compile_xpert(xpert, &xpert.primary_agent().unwrap().key, options)
        .await
        .unwrap();
    let runner = Runner::new(Arc::new(graph), checkpointer);
    let outcome = runner
        .invoke(input, RunContext::new("t1", "r1"))
        .await
        .unwrap();
    (runner, outcome)
}

#[tokio::test]
async fn scenario_single_agent_structured_output() {
    let mut agent = base_agent("lead");
    agent.output_variables = Some(StructuredOutput {
        name: "answer".to_string(),
        schema: json!({
            "type": "object",
            "properties": {"answer": {"type": "string"}},
            "required": ["answer"],
        }),
    });
    let xpert = agent_xpert(agent, None);

    let model = Arc::new(MockChatModel::with_replies(vec![Message::ai(
        r#"{"answer": "Paris"}"#,
    )]));
    let checkpointer = Arc::new(InMemoryCheckpointSaver::new());
    let options = CompileOptions::new(model, checkpointer.clone());

    let (_, outcome) = compile_and_run(
        &xpert,
        &options,
        human_input("lead", "capital of France"),
        checkpointer,
    )
    .await;

    assert_eq!(outcome.status, RunStatus::Success);
    let messages = messages_from_value(&outcome.values["messages"]);
    let last = messages.last().unwrap();
    assert_eq!(last.role, MessageRole::Assistant);
    let parsed: Value = serde_json::from_str(&last.content).unwrap();
    assert_eq!(parsed["answer"], json!("Paris"));
    // Structured output also lands in the agent channel's output field
    assert_eq!(outcome.values["lead_channel"]["output"]["answer"], json!("Paris"));
}

#[tokio::test]
async fn scenario_tool_call_loop() {
    let mut agent = base_agent("lead");
    agent.toolset_ids = vec!["math".to_string()];
    let xpert = agent_xpert(
        agent,
        Some(ToolsetNode {
            toolset_id: "math".to_string(),
            tools: vec![],
        }),
    );

    let model = Arc::new(MockChatModel::new(vec![
        ChatCompletion::new(Message::ai("adding").with_tool_calls(vec![ToolCall::new(
            "t1",
            "add",
            json!({"a": 2, "b": 3}),
        )])),
        ChatCompletion::new(Message::ai("5")),
    ]));
    let checkpointer = Arc::new(InMemoryCheckpointSaver::new());
    let options = CompileOptions::new(model, checkpointer.clone())
        .with_toolsets(vec![Arc::new(SimpleToolset::new(
            "math",
            "math",
            vec![add_tool()],
        ))]);

    let (_, outcome) =
        compile_and_run(&xpert, &options, human_input("lead", "what is 2+3?"), checkpointer).await;

    assert_eq!(outcome.status, RunStatus::Success);
    let messages = messages_from_value(&outcome.values["messages"]);
    let roles: Vec<&MessageRole> = messages.iter().map(|m| &m.role).collect();
    assert_eq!(
        roles,
        vec![
            &MessageRole::Human,
            &MessageRole::Assistant,
            &MessageRole::Tool,
            &MessageRole::Assistant,
        ]
    );
    let tool_message = &messages[2];
    assert_eq!(tool_message.tool_call_id.as_deref(), Some("t1"));
    assert_eq!(tool_message.content, "5");
    assert_eq!(messages[3].content, "5");
}

#[tokio::test]
async fn scenario_hitl_reject() {
    let mut agent = base_agent("lead");
    agent.toolset_ids = vec!["danger".to_string()];
    let xpert = agent_xpert(
        agent,
        Some(ToolsetNode {
            toolset_id: "danger".to_string(),
            tools: vec![],
        }),
    );

    let dangerous = Tool::from_fn(
        "dangerous",
        "Does something risky",
        json!({"type": "object"}),
        |_args, _invocation| async move { Ok(json!("executed")) },
    );
    let model = Arc::new(MockChatModel::new(vec![
        ChatCompletion::new(Message::ai("about to act").with_tool_calls(vec![ToolCall::new(
            "t9",
            "dangerous",
            json!({"x": 1}),
        )])),
        ChatCompletion::new(Message::ai("understood, cancelled")),
    ]));
    let checkpointer = Arc::new(InMemoryCheckpointSaver::new());
    let hitl: Arc<dyn AgentMiddleware> = Arc::new(HumanInTheLoopMiddleware::for_tool(
        "dangerous",
        vec![DecisionType::Approve, DecisionType::Reject],
    ));
    let options = CompileOptions::new(model, checkpointer.clone())
        .with_toolsets(vec![Arc::new(SimpleToolset::new(
            "danger",
            "danger",
            vec![dangerous],
        ))])
        .with_middlewares(vec![hitl]);

    let (runner, outcome) =
        compile_and_run(&xpert, &options, human_input("lead", "do the thing"), checkpointer).await;

    // First run halts INTERRUPTED with one action request
    assert_eq!(outcome.status, RunStatus::Interrupted);
    let signal = outcome.interrupt.unwrap();
    assert_eq!(signal.payload["requests"].as_array().unwrap().len(), 1);
    assert_eq!(signal.payload["requests"][0]["name"], json!("dangerous"));

    // Reject; the AI message is rewritten, a synthetic error tool message
    // answers the call, and the flow re-enters the model
    let outcome = runner
        .resume(
            Command::new().with_resume(json!({
                "decisions": [{"type": "reject", "message": "nope"}]
            })),
            RunContext::new("t1", "r2"),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Success);
    let messages = messages_from_value(&outcome.values["messages"]);
    let rejected_ai = messages
        .iter()
        .find(|m| m.is_ai() && !m.tool_calls().is_empty())
        .unwrap();
    assert_eq!(rejected_ai.tool_calls().len(), 1);
    assert_eq!(rejected_ai.tool_calls()[0].id, "t9");

    let synthetic = messages
        .iter()
        .find(|m| m.is_tool() && m.status == Some(ToolMessageStatus::Error))
        .unwrap();
    assert_eq!(synthetic.tool_call_id.as_deref(), Some("t9"));
    assert_eq!(synthetic.content, "nope");

    assert_eq!(messages.last().unwrap().content, "understood, cancelled");
}

#[tokio::test]
async fn scenario_client_tool_round_trip() {
    let mut agent = base_agent("lead");
    agent.toolset_ids = vec!["browser".to_string()];
    let xpert = agent_xpert(
        agent,
        Some(ToolsetNode {
            toolset_id: "browser".to_string(),
            tools: vec![],
        }),
    );

    let client_tool = Tool::from_fn(
        "browser.open",
        "Open a URL in the user's browser",
        json!({"type": "object"}),
        |_args, _invocation| async move { Ok(json!("server must not run this")) },
    )
    .client_side();
    let model = Arc::new(MockChatModel::new(vec![
        ChatCompletion::new(Message::ai("opening").with_tool_calls(vec![ToolCall::new(
            "c1",
            "browser.open",
            json!({"url": "https://example.com"}),
        )])),
        ChatCompletion::new(Message::ai("done")),
    ]));
    let checkpointer = Arc::new(InMemoryCheckpointSaver::new());
    let options = CompileOptions::new(model, checkpointer.clone())
        .with_toolsets(vec![Arc::new(SimpleToolset::new(
            "browser",
            "browser",
            vec![client_tool],
        ))])
        .with_middlewares(vec![Arc::new(ClientToolMiddleware::new())]);

    let (runner, outcome) =
        compile_and_run(&xpert, &options, human_input("lead", "open example.com"), checkpointer)
            .await;

    assert_eq!(outcome.status, RunStatus::Interrupted);
    let signal = outcome.interrupt.unwrap();
    assert_eq!(signal.payload["clientToolCalls"][0]["id"], json!("c1"));
    assert_eq!(
        signal.payload["clientToolCalls"][0]["name"],
        json!("browser.open")
    );

    // The client executed the tool and reports its result
    let outcome = runner
        .resume(
            Command::new().with_resume(json!({
                "toolMessages": [Message::tool("ok", "c1").to_value()]
            })),
            RunContext::new("t1", "r2"),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Success);
    let messages = messages_from_value(&outcome.values["messages"]);
    let tool_message = messages.iter().find(|m| m.is_tool()).unwrap();
    assert_eq!(tool_message.tool_call_id.as_deref(), Some("c1"));
    assert_eq!(tool_message.content, "ok");
    assert_eq!(messages.last().unwrap().content, "done");
}

#[tokio::test]
async fn scenario_client_tool_id_mismatch_fails() {
    let mut agent = base_agent("lead");
    agent.toolset_ids = vec!["browser".to_string()];
    let xpert = agent_xpert(
        agent,
        Some(ToolsetNode {
            toolset_id: "browser".to_string(),
            tools: vec![],
        }),
    );

    let client_tool = Tool::from_fn(
        "browser.open",
        "Open a URL",
        json!({"type": "object"}),
        |_args, _invocation| async move { Ok(json!(null)) },
    )
    .client_side();
    let model = Arc::new(MockChatModel::new(vec![ChatCompletion::new(
        Message::ai("opening").with_tool_calls(vec![ToolCall::new(
            "c1",
            "browser.open",
            json!({}),
        )]),
    )]));
    let checkpointer = Arc::new(InMemoryCheckpointSaver::new());
    let options = CompileOptions::new(model, checkpointer.clone())
        .with_toolsets(vec![Arc::new(SimpleToolset::new(
            "browser",
            "browser",
            vec![client_tool],
        ))])
        .with_middlewares(vec![Arc::new(ClientToolMiddleware::new())]);

    let (runner, outcome) =
        compile_and_run(&xpert, &options, human_input("lead", "open it"), checkpointer).await;
    assert_eq!(outcome.status, RunStatus::Interrupted);

    let outcome = runner
        .resume(
            Command::new().with_resume(json!({
                "toolMessages": [Message::tool("ok", "wrong-id").to_value()]
            })),
            RunContext::new("t1", "r2"),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Error);
    assert!(outcome.error.unwrap().contains("does not match"));
}

#[tokio::test]
async fn scenario_tool_selector_cap() {
    let mut agent = base_agent("lead");
    agent.toolset_ids = vec!["many".to_string()];
    let xpert = agent_xpert(
        agent,
        Some(ToolsetNode {
            toolset_id: "many".to_string(),
            tools: vec![],
        }),
    );

    let tools: Vec<Tool> = ["a", "b", "c", "d", "e", "f", "g", "h", "i", "search"]
        .iter()
        .map(|name| {
            Tool::from_fn(
                *name,
                format!("tool {name}"),
                json!({"type": "object"}),
                |_args, _invocation| async move { Ok(json!(null)) },
            )
        })
        .collect();

    let selector = Arc::new(MockChatModel::with_replies(vec![Message::ai(
        r#"{"tools": ["a", "b", "c", "d"]}"#,
    )]));
    let model = Arc::new(MockChatModel::with_replies(vec![Message::ai("done")]));
    let checkpointer = Arc::new(InMemoryCheckpointSaver::new());
    let options = CompileOptions::new(model.clone(), checkpointer.clone())
        .with_toolsets(vec![Arc::new(SimpleToolset::new("many", "many", tools))])
        .with_middlewares(vec![Arc::new(
            LlmToolSelectorMiddleware::new(selector, 3).always_include("search"),
        )]);

    let (_, outcome) =
        compile_and_run(&xpert, &options, human_input("lead", "pick tools"), checkpointer).await;
    assert_eq!(outcome.status, RunStatus::Success);

    // The inner model saw exactly the capped selection plus always-include
    let requests = model.requests();
    assert_eq!(requests.len(), 1);
    let mut names: Vec<&str> = requests[0].tools.iter().map(|t| t.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["a", "b", "c", "search"]);
}

#[tokio::test]
async fn scenario_recursion_limit() {
    let mut agent = base_agent("lead");
    agent.toolset_ids = vec!["math".to_string()];
    let xpert = agent_xpert(
        agent,
        Some(ToolsetNode {
            toolset_id: "math".to_string(),
            tools: vec![],
        }),
    );

    // The model keeps emitting the same tool call forever
    let looping: Vec<ChatCompletion> = (0..20)
        .map(|i| {
            ChatCompletion::new(Message::ai("again").with_tool_calls(vec![ToolCall::new(
                format!("t{i}"),
                "add",
                json!({"a": 1, "b": 1}),
            )]))
        })
        .collect();
    let model = Arc::new(MockChatModel::new(looping));
    let checkpointer: Arc<InMemoryCheckpointSaver> = Arc::new(InMemoryCheckpointSaver::new());
    let options = CompileOptions::new(model, checkpointer.clone())
        .with_toolsets(vec![Arc::new(SimpleToolset::new(
            "math",
            "math",
            vec![add_tool()],
        ))]);

    let graph = compile_xpert(&xpert, "lead", &options).await.unwrap();
    let runner = Runner::new(Arc::new(graph), checkpointer.clone()).with_config(RunnerConfig {
        recursion_limit: 4,
        ..Default::default()
    });
    let outcome = runner
        .invoke(human_input("lead", "loop forever"), RunContext::new("t1", "r1"))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Error);
    assert!(outcome
        .error
        .unwrap()
        .to_lowercase()
        .contains("recursion limit"));

    // The checkpoint of the last successful step survives for resume
    let tuple = checkpointer
        .get_tuple(&CheckpointConfig::new("t1"))
        .await
        .unwrap()
        .unwrap();
    assert!(!tuple.checkpoint.channel_values.is_empty());
}

#[tokio::test]
async fn scenario_disabled_history_sends_only_current_turn() {
    let mut agent = base_agent("lead");
    agent.options.disable_message_history = true;
    let xpert = agent_xpert(agent, None);

    let model = Arc::new(MockChatModel::with_replies(vec![Message::ai("fresh")]));
    let checkpointer = Arc::new(InMemoryCheckpointSaver::new());
    let options = CompileOptions::new(model.clone(), checkpointer.clone());

    // Seed prior turns, then the current human input
    let prior_human = Message::human("old question");
    let prior_ai = Message::ai("old answer");
    let current = Message::human("new question");
    let input = vec![
        ("messages".to_string(), json!([prior_human.to_value(), prior_ai.to_value(), current.to_value()])),
        (
            "lead_channel".to_string(),
            json!({ "messages": [prior_human.to_value(), prior_ai.to_value(), current.to_value()] }),
        ),
    ];

    let (_, outcome) = compile_and_run(&xpert, &options, input, checkpointer).await;
    assert_eq!(outcome.status, RunStatus::Success);

    let requests = model.requests();
    assert_eq!(requests[0].messages.len(), 1);
    assert_eq!(requests[0].messages[0].content, "new question");
    assert!(requests[0].system.is_some());
}

#[tokio::test]
async fn scenario_model_error_default_value() {
    let mut agent = base_agent("lead");
    agent.options.error_handling = Some(xpert_core::ErrorHandling::DefaultValue {
        content: "Sorry, I could not answer.".to_string(),
    });
    let xpert = agent_xpert(agent, None);

    let model = Arc::new(xpert_core::FailingChatModel {
        error: "provider unavailable".to_string(),
    });
    let checkpointer = Arc::new(InMemoryCheckpointSaver::new());
    let options = CompileOptions::new(model, checkpointer.clone());

    let (_, outcome) =
        compile_and_run(&xpert, &options, human_input("lead", "hello"), checkpointer).await;

    assert_eq!(outcome.status, RunStatus::Success);
    let messages = messages_from_value(&outcome.values["messages"]);
    assert_eq!(messages.last().unwrap().content, "Sorry, I could not answer.");
    assert_eq!(
        outcome.values["lead_channel"]["error"],
        json!("Model call failed: provider unavailable")
    );
}

#[tokio::test]
async fn scenario_resume_is_recorded_for_idempotence() {
    // The interrupt manager records consumption so a second identical
    // resume is a no-op at the service layer
    let manager = Arc::new(xpert_core::InterruptManager::new());
    let mut agent = base_agent("lead");
    agent.toolset_ids = vec!["danger".to_string()];
    let xpert = agent_xpert(
        agent,
        Some(ToolsetNode {
            toolset_id: "danger".to_string(),
            tools: vec![],
        }),
    );

    let dangerous = Tool::from_fn(
        "dangerous",
        "Risky",
        json!({"type": "object"}),
        |_args, _invocation| async move { Ok(json!("done")) },
    );
    let model = Arc::new(MockChatModel::new(vec![
        ChatCompletion::new(Message::ai("hm").with_tool_calls(vec![ToolCall::new(
            "t1",
            "dangerous",
            json!({}),
        )])),
        ChatCompletion::new(Message::ai("finished")),
    ]));
    let checkpointer = Arc::new(InMemoryCheckpointSaver::new());
    let hitl: Arc<dyn AgentMiddleware> = Arc::new(HumanInTheLoopMiddleware::for_tool(
        "dangerous",
        vec![DecisionType::Approve],
    ));
    let options = CompileOptions::new(model, checkpointer.clone())
        .with_toolsets(vec![Arc::new(SimpleToolset::new(
            "danger",
            "danger",
            vec![dangerous],
        ))])
        .with_middlewares(vec![hitl]);

    let graph = compile_xpert(&xpert, "lead", &options).await.unwrap();
    let runner = Runner::new(Arc::new(graph), checkpointer)
        .with_interrupt_manager(manager.clone());
    let outcome = runner
        .invoke(human_input("lead", "go"), RunContext::new("t1", "r1"))
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Interrupted);

    // The record is registered and consumable exactly once
    match manager.consume("t1").unwrap() {
        xpert_core::ConsumeOutcome::Fresh(record) => {
            manager.mark_consumed(&record.thread_id, &record.run_id, "r2");
        }
        _ => panic!("expected a fresh interrupt"),
    }
    match manager.consume("t1").unwrap() {
        xpert_core::ConsumeOutcome::AlreadyConsumed { resumed_by } => {
            assert_eq!(resumed_by, "r2");
        }
        _ => panic!("expected idempotent consume"),
    }
}
