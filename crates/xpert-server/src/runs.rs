//! Run execution service
//!
//! Bridges HTTP payloads onto the core runner: builds the run context,
//! wires cancellation and the event bus, dispatches create-vs-resume, and
//! records the outcome on the run and thread entities.

use crate::entities::{ChatRequest, Run, RunApiStatus, ThreadStatus};
use crate::error::{Result, ServerError};
use crate::state::AppState;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use xpert_core::{
    abort_channel, ConsumeOutcome, EventBus, Message, RunContext, RunOutcome, Runner,
    RunnerConfig, RunStatus,
};

/// Execute a run to completion, updating the stored entities as it goes.
///
/// `events` receives the run's streaming events; pass [`EventBus::sink`]
/// for background runs nobody watches.
pub async fn execute_run(
    state: &AppState,
    run: &Run,
    request: &ChatRequest,
    events: EventBus,
) -> Result<RunOutcome> {
    let graph = state
        .graphs
        .get(&run.assistant_id)
        .map(|g| Arc::clone(&g))
        .ok_or_else(|| ServerError::NotFound(format!("assistant '{}'", run.assistant_id)))?;
    let agent_config = state
        .assistants
        .get(&run.assistant_id)
        .map(|x| x.agent_config.clone())
        .unwrap_or_default();

    let (abort, signal) = abort_channel();
    state.abort_handles.insert(run.id.clone(), abort);

    let ctx = RunContext::new(run.thread_id.clone(), run.id.clone())
        .with_events(events)
        .with_signal(signal)
        .with_store(Arc::clone(&state.store))
        .with_ledger(Arc::clone(&state.ledger))
        .with_language(agent_config.language.clone().unwrap_or_else(|| "en".to_string()));

    let mut runner_config = RunnerConfig::default();
    if let Some(limit) = agent_config.recursion_limit {
        runner_config.recursion_limit = limit;
    }
    runner_config.max_concurrency = agent_config.max_concurrency;
    runner_config.timeout = agent_config.timeout_ms.map(Duration::from_millis);

    let runner = Runner::new(graph.clone(), Arc::clone(&state.checkpointer))
        .with_interrupt_manager(Arc::clone(&state.interrupts))
        .with_config(runner_config);

    let outcome = match &request.command {
        Some(command) => {
            // Resume path: consume the pending interrupt exactly once
            match state.interrupts.consume(&run.thread_id) {
                Some(ConsumeOutcome::AlreadyConsumed { resumed_by }) => {
                    // Idempotent resume: return the recorded outcome of the
                    // run that already consumed this interrupt
                    tracing::info!(
                        thread_id = %run.thread_id,
                        resumed_by = %resumed_by,
                        "duplicate resume; returning recorded outcome"
                    );
                    let prior = state
                        .runs
                        .get(&resumed_by)
                        .map(|r| r.clone())
                        .ok_or_else(|| ServerError::NotFound(format!("run '{resumed_by}'")))?;
                    state.abort_handles.remove(&run.id);
                    let outcome = RunOutcome {
                        status: match prior.status {
                            RunApiStatus::Success => RunStatus::Success,
                            RunApiStatus::Interrupted => RunStatus::Interrupted,
                            RunApiStatus::Aborted => RunStatus::Aborted,
                            _ => RunStatus::Error,
                        },
                        values: prior
                            .outputs
                            .and_then(|v| serde_json::from_value(v).ok())
                            .unwrap_or_default(),
                        interrupt: None,
                        error: prior.error,
                        checkpoint: None,
                    };
                    record_outcome(state, &run.id, &outcome);
                    return Ok(outcome);
                }
                Some(ConsumeOutcome::Fresh(record)) => {
                    let outcome = runner.resume(command.clone(), ctx).await?;
                    state
                        .interrupts
                        .mark_consumed(&record.thread_id, &record.run_id, run.id.clone());
                    outcome
                }
                None => {
                    // Raw resume with no recorded interrupt: still honour
                    // the command against the latest checkpoint
                    runner.resume(command.clone(), ctx).await?
                }
            }
        }
        None => {
            let writes = input_writes(&graph, request);
            runner.invoke(writes, ctx).await?
        }
    };

    state.abort_handles.remove(&run.id);
    record_outcome(state, &run.id, &outcome);
    Ok(outcome)
}

/// Abort an in-flight run; the record flips to ABORTED when the runner
/// observes the signal.
pub fn abort_run(state: &AppState, run_id: &str) -> bool {
    match state.abort_handles.get(run_id) {
        Some(handle) => {
            handle.abort();
            true
        }
        None => false,
    }
}

fn input_writes(
    graph: &xpert_core::CompiledGraph,
    request: &ChatRequest,
) -> Vec<(String, Value)> {
    let mut writes = Vec::new();
    if let Some(input) = &request.input {
        let human = Message::human(input.clone());
        writes.push(("messages".to_string(), human.to_value()));
        if let Some(agent_channel) = &graph.agent_channel {
            writes.push((
                agent_channel.clone(),
                json!({ "messages": [human.to_value()] }),
            ));
        }
    }
    if !request.parameters.is_empty() {
        if let Some(agent_channel) = &graph.agent_channel {
            writes.push((
                agent_channel.clone(),
                json!({ "parameters": request.parameters }),
            ));
        }
    }
    writes
}

fn record_outcome(state: &AppState, run_id: &str, outcome: &RunOutcome) {
    if let Some(mut run) = state.runs.get_mut(run_id) {
        run.status = RunApiStatus::from(outcome.status);
        run.outputs = serde_json::to_value(&outcome.values).ok();
        run.error = outcome.error.clone();
        run.checkpoint_id = outcome
            .checkpoint
            .as_ref()
            .and_then(|c| c.checkpoint_id.clone());
        run.elapsed_ms = Some((chrono::Utc::now() - run.created_at).num_milliseconds());

        if let Some(mut thread) = state.threads.get_mut(&run.thread_id) {
            thread.status = match outcome.status {
                RunStatus::Interrupted => ThreadStatus::Interrupted,
                _ => ThreadStatus::Open,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::entities::Thread;
    use std::collections::HashMap;
    use xpert_core::xpert::{
        AgentConfig, Xpert, XpertAgent, XpertAgentOptions, XpertGraph, XpertNode, XpertNodeEntity,
    };
    use xpert_core::{compile_xpert, CompileOptions, MockChatModel};

    async fn test_state() -> AppState {
        let model = Arc::new(MockChatModel::with_replies(vec![Message::ai("hi there")]));
        let state = AppState::new(ServerConfig::default(), model.clone());

        let agent = XpertAgent {
            key: "lead".to_string(),
            name: "Lead".to_string(),
            prompt: "Assist.".to_string(),
            parameters: None,
            output_variables: None,
            toolset_ids: vec![],
            knowledgebase_ids: vec![],
            followers: vec![],
            collaborators: vec![],
            next: vec![],
            fail: None,
            options: XpertAgentOptions::default(),
        };
        let xpert = Xpert {
            id: "x1".to_string(),
            slug: "lead".to_string(),
            name: "Lead".to_string(),
            description: None,
            version: "1".to_string(),
            latest: true,
            graph: XpertGraph {
                nodes: vec![XpertNode {
                    key: "lead".to_string(),
                    entity: XpertNodeEntity::Agent(agent),
                }],
                connections: vec![],
            },
            agent_config: AgentConfig::default(),
        };

        let options = CompileOptions::new(model, Arc::clone(&state.checkpointer));
        let graph = compile_xpert(&xpert, "lead", &options).await.unwrap();
        state.register_assistant(xpert, Arc::new(graph));
        state
    }

    #[tokio::test]
    async fn test_execute_run_records_outcome() {
        let state = test_state().await;
        state
            .threads
            .insert("t1".to_string(), Thread::new("t1", HashMap::new()));

        let run = Run::new("t1", "x1", json!({"input": "hello"}));
        state.runs.insert(run.id.clone(), run.clone());

        let request = ChatRequest {
            input: Some("hello".to_string()),
            ..Default::default()
        };
        let outcome = execute_run(&state, &run, &request, EventBus::sink())
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Success);
        assert_eq!(outcome.final_text().as_deref(), Some("hi there"));

        let stored = state.runs.get(&run.id).unwrap();
        assert_eq!(stored.status, RunApiStatus::Success);
        assert!(stored.elapsed_ms.is_some());
        assert!(stored.checkpoint_id.is_some());
    }

    #[tokio::test]
    async fn test_abort_unknown_run() {
        let state = test_state().await;
        assert!(!abort_run(&state, "missing"));
    }
}
