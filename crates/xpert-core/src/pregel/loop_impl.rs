//! The runner: frontier loop, checkpointing, interrupts, resume
//!
//! One [`Runner`] executes one compiled graph against one thread at a time.
//! Each step executes the ready frontier, applies the collected writes to
//! the channel store atomically, persists a checkpoint (with the next
//! frontier in its metadata, so a crash or interrupt resumes exactly where
//! it stopped) and routes successors. Interrupts suspend the run with its
//! pre-interrupt state as pending writes; `resume` replays them and
//! continues from the persisted frontier.

use crate::command::Command;
use crate::error::{GraphError, Result};
use crate::graph::{CompiledGraph, NodeContext, NodeOutput};
use crate::interrupt::{InterruptManager, InterruptRecord, InterruptSignal};
use crate::messages::{last_ai_message, messages_from_value};
use crate::pregel::algo::{plan_step, route_successors};
use crate::pregel::types::{Task, TaskResult};
use crate::runtime::RunContext;
use crate::stream::RunEvent;
use crate::tool::{ToolCall, Toolset};
use futures::future::join_all;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use xpert_checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, CheckpointSource,
    ChannelStore, PendingWrite,
};

/// Metadata key carrying the serialized frontier
const FRONTIER_KEY: &str = "frontier";

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Hard ceiling on step transitions per invoke/resume
    pub recursion_limit: usize,
    /// Bounded parallelism within a step; `None` is unbounded
    pub max_concurrency: Option<usize>,
    /// Per-run wall-clock budget
    pub timeout: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            recursion_limit: 25,
            max_concurrency: None,
            timeout: None,
        }
    }
}

/// Final state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Error,
    Interrupted,
    Aborted,
}

/// What a run produced
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Channel snapshot at the end of the run
    pub values: HashMap<String, Value>,
    /// The interrupt that suspended the run, when status is Interrupted
    pub interrupt: Option<InterruptSignal>,
    pub error: Option<String>,
    /// Config of the last persisted checkpoint
    pub checkpoint: Option<CheckpointConfig>,
}

impl RunOutcome {
    /// Content of the last AI message in the `messages` channel
    pub fn final_text(&self) -> Option<String> {
        let messages = messages_from_value(self.values.get("messages")?);
        last_ai_message(&messages).map(|m| m.content.clone())
    }
}

/// Cooperative per-run executor
pub struct Runner {
    graph: Arc<CompiledGraph>,
    checkpointer: Arc<dyn CheckpointSaver>,
    interrupts: Arc<InterruptManager>,
    toolsets: Vec<Arc<dyn Toolset>>,
    config: RunnerConfig,
}

impl Runner {
    pub fn new(graph: Arc<CompiledGraph>, checkpointer: Arc<dyn CheckpointSaver>) -> Self {
        Self {
            graph,
            checkpointer,
            interrupts: Arc::new(InterruptManager::new()),
            toolsets: Vec::new(),
            config: RunnerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_interrupt_manager(mut self, interrupts: Arc<InterruptManager>) -> Self {
        self.interrupts = interrupts;
        self
    }

    /// Toolsets to close when the run finalizes or aborts
    pub fn with_toolsets(mut self, toolsets: Vec<Arc<dyn Toolset>>) -> Self {
        self.toolsets = toolsets;
        self
    }

    fn checkpoint_config(&self, ctx: &RunContext) -> CheckpointConfig {
        CheckpointConfig::new(ctx.thread_id.clone()).with_namespace(ctx.checkpoint_ns.clone())
    }

    /// Execute a new run: seed channels (continuing from the thread's
    /// latest checkpoint when one exists), apply the input writes, and
    /// drive the graph from its entry node.
    pub async fn invoke(
        &self,
        input: Vec<(String, Value)>,
        ctx: RunContext,
    ) -> Result<RunOutcome> {
        let _ = ctx.events.emit(RunEvent::RunStart {
            run_id: ctx.run_id.clone(),
        });
        let result = self.bounded(self.start(input, &ctx), &ctx).await;
        self.finish(result, &ctx).await
    }

    /// Resume an interrupted run with a command: re-hydrate state from the
    /// checkpoint, replay pending writes, stage the resume payload, apply
    /// `update` and the optional tool-call rewrite, then continue from the
    /// persisted frontier.
    pub async fn resume(&self, command: Command, ctx: RunContext) -> Result<RunOutcome> {
        let _ = ctx.events.emit(RunEvent::RunStart {
            run_id: ctx.run_id.clone(),
        });
        let result = self.bounded(self.restart(command, &ctx), &ctx).await;
        self.finish(result, &ctx).await
    }

    async fn bounded<F>(&self, fut: F, ctx: &RunContext) -> Result<RunOutcome>
    where
        F: std::future::Future<Output = Result<RunOutcome>>,
    {
        match self.config.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(GraphError::Timeout {
                    operation: "run".to_string(),
                    duration_ms: timeout.as_millis() as u64,
                    language: ctx.language.clone(),
                }),
            },
            None => fut.await,
        }
    }

    async fn start(&self, input: Vec<(String, Value)>, ctx: &RunContext) -> Result<RunOutcome> {
        let config = self.checkpoint_config(ctx);
        let mut store = ChannelStore::initialize(&self.graph.channels);

        let parent_id = match self.checkpointer.get_tuple(&config).await? {
            Some(tuple) => {
                store.restore(&tuple.checkpoint.channel_values)?;
                Some(tuple.checkpoint.id)
            }
            None => None,
        };

        if !input.is_empty() {
            store.apply(input)?;
        }

        let frontier = vec![Task::new(self.graph.entry.clone())];
        let checkpoint = Checkpoint::new(store.snapshot()?, parent_id);
        let parent_id = checkpoint.id.clone();
        self.checkpointer
            .put(
                &config,
                checkpoint,
                self.metadata(CheckpointSource::Input, -1, &frontier, ctx)?,
            )
            .await?;

        self.run_loop(store, frontier, 0, parent_id, ctx).await
    }

    async fn restart(&self, command: Command, ctx: &RunContext) -> Result<RunOutcome> {
        let config = self.checkpoint_config(ctx);
        let tuple = self
            .checkpointer
            .get_tuple(&config)
            .await?
            .ok_or_else(|| GraphError::input("no checkpoint to resume from"))?;

        let mut store = ChannelStore::initialize(&self.graph.channels);
        store.restore(&tuple.checkpoint.channel_values)?;

        // Replay the pre-interrupt writes recorded with the checkpoint
        let mut pending: Vec<(String, Value)> = tuple
            .checkpoint
            .pending_writes
            .iter()
            .map(|(_, channel, value)| (channel.clone(), value.clone()))
            .collect();
        pending.extend(
            tuple
                .pending_writes
                .iter()
                .map(|(_, channel, value)| (channel.clone(), value.clone())),
        );
        if !pending.is_empty() {
            store.apply(pending)?;
        }

        if let Some(resume) = &command.resume {
            ctx.set_resume(resume.clone());
        }
        if let Some(calls) = &command.tool_calls {
            self.rewrite_tool_calls(&mut store, calls)?;
        }
        let update = command.update_writes();
        if !update.is_empty() {
            store.apply(update)?;
        }

        let frontier = tuple
            .metadata
            .extra
            .get(FRONTIER_KEY)
            .cloned()
            .map(serde_json::from_value::<Vec<Task>>)
            .transpose()?
            .unwrap_or_else(|| vec![Task::new(self.graph.entry.clone())]);
        let step = tuple.metadata.step.unwrap_or(0).max(0);

        self.run_loop(store, frontier, step, tuple.checkpoint.id, ctx)
            .await
    }

    /// Rewrite the last AI message's tool calls in the agent channel and
    /// the shared messages channel. A fresh message object under the same
    /// id replaces the original through the reducer.
    fn rewrite_tool_calls(&self, store: &mut ChannelStore, calls: &[ToolCall]) -> Result<()> {
        let mut writes = Vec::new();
        if let Some(channel) = &self.graph.agent_channel {
            let value = store.read(channel)?;
            let messages = messages_from_value(&value["messages"]);
            if let Some(ai) = last_ai_message(&messages) {
                let mut fresh = ai.clone();
                fresh.tool_calls = Some(calls.to_vec());
                writes.push((
                    channel.clone(),
                    serde_json::json!({ "messages": [fresh.to_value()] }),
                ));
            }
        }
        if store.contains("messages") {
            let messages = messages_from_value(&store.read("messages")?);
            if let Some(ai) = last_ai_message(&messages) {
                let mut fresh = ai.clone();
                fresh.tool_calls = Some(calls.to_vec());
                writes.push(("messages".to_string(), fresh.to_value()));
            }
        }
        if !writes.is_empty() {
            store.apply(writes)?;
        }
        Ok(())
    }

    fn metadata(
        &self,
        source: CheckpointSource,
        step: i64,
        frontier: &[Task],
        ctx: &RunContext,
    ) -> Result<CheckpointMetadata> {
        Ok(CheckpointMetadata::new()
            .with_source(source)
            .with_step(step)
            .with_run_id(ctx.run_id.clone())
            .with_extra(FRONTIER_KEY, serde_json::to_value(frontier)?))
    }

    async fn run_loop(
        &self,
        mut store: ChannelStore,
        mut frontier: Vec<Task>,
        mut step: i64,
        mut parent_id: String,
        ctx: &RunContext,
    ) -> Result<RunOutcome> {
        let config = self.checkpoint_config(ctx);
        let mut transitions = 0usize;

        while !frontier.is_empty() {
            if transitions >= self.config.recursion_limit {
                return Err(GraphError::RecursionLimit {
                    limit: self.config.recursion_limit,
                    language: ctx.language.clone(),
                });
            }
            if ctx.signal.is_aborted() {
                return Err(GraphError::Aborted);
            }

            let (batch, remaining) = plan_step(&self.graph, frontier);

            // Confirmation gate before sensitive nodes
            if let Some(task) = batch
                .iter()
                .find(|t| self.graph.interrupt_before.contains(&t.node))
            {
                if ctx.take_resume().is_none() {
                    let signal = InterruptSignal::confirm(
                        &task.node,
                        task.send_arg.clone().unwrap_or(Value::Null),
                    );
                    let mut persisted: Vec<Task> = batch.clone();
                    persisted.extend(remaining);
                    return self
                        .suspend(&config, &store, Vec::new(), persisted, step, parent_id, signal, ctx)
                        .await;
                }
            }

            let state = serde_json::to_value(store.snapshot()?)?;
            let results = self.execute_batch(&batch, &state, ctx).await;

            let mut completed: Vec<TaskResult> = Vec::new();
            let mut interrupt: Option<InterruptSignal> = None;
            for (task, result) in results {
                match result {
                    Ok(output) => completed.push(into_task_result(task, output)),
                    Err(GraphError::Interrupt(signal)) => {
                        tracing::debug!(node = %task.node, kind = %signal.kind, "node raised interrupt");
                        interrupt = Some(signal);
                    }
                    Err(e) => {
                        tracing::warn!(node = %task.node, error = %e, "node failed");
                        return Err(e);
                    }
                }
            }

            if let Some(signal) = interrupt {
                // Pre-interrupt state: writes of tasks that did complete
                // this step stay pending; incomplete tasks re-run on resume.
                let pending: Vec<PendingWrite> = completed
                    .iter()
                    .flat_map(|r| {
                        r.writes
                            .iter()
                            .map(|(c, v)| (r.task.id.clone(), c.clone(), v.clone()))
                    })
                    .collect();
                let completed_ids: HashSet<&str> =
                    completed.iter().map(|r| r.task.id.as_str()).collect();
                let mut persisted: Vec<Task> = batch
                    .into_iter()
                    .filter(|t| !completed_ids.contains(t.id.as_str()))
                    .collect();
                persisted.extend(remaining);
                return self
                    .suspend(&config, &store, pending, persisted, step, parent_id, signal, ctx)
                    .await;
            }

            // Atomic step commit: predecessor order, then routing order
            let writes: Vec<(String, Value)> = completed
                .iter()
                .flat_map(|r| r.writes.iter().cloned())
                .collect();
            store.apply(writes)?;

            let snapshot = store.snapshot()?;
            let state = serde_json::to_value(&snapshot)?;
            let successors = route_successors(&self.graph, &completed, &state)?;

            let mut next: Vec<Task> = remaining;
            next.extend(successors);

            let checkpoint = Checkpoint::new(snapshot, Some(parent_id.clone()));
            parent_id = checkpoint.id.clone();
            self.checkpointer
                .put(
                    &config,
                    checkpoint,
                    self.metadata(CheckpointSource::Loop, step, &next, ctx)?,
                )
                .await?;
            let _ = ctx.events.emit(RunEvent::Checkpoint {
                checkpoint_id: parent_id.clone(),
            });

            // Confirmation gate after flagged nodes
            if let Some(result) = completed
                .iter()
                .find(|r| self.graph.interrupt_after.contains(&r.task.node))
            {
                let signal = InterruptSignal::confirm(&result.task.node, Value::Null);
                return self
                    .suspend(&config, &store, Vec::new(), next, step + 1, parent_id, signal, ctx)
                    .await;
            }

            frontier = next;
            step += 1;
            transitions += 1;
        }

        Ok(RunOutcome {
            status: RunStatus::Success,
            values: store.snapshot()?,
            interrupt: None,
            error: None,
            checkpoint: Some(
                self.checkpoint_config(ctx)
                    .with_checkpoint_id(parent_id),
            ),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn suspend(
        &self,
        config: &CheckpointConfig,
        store: &ChannelStore,
        pending: Vec<PendingWrite>,
        frontier: Vec<Task>,
        step: i64,
        parent_id: String,
        signal: InterruptSignal,
        ctx: &RunContext,
    ) -> Result<RunOutcome> {
        let checkpoint = Checkpoint::new(store.snapshot()?, Some(parent_id))
            .with_pending_writes(pending.clone());
        let resolved = self
            .checkpointer
            .put(
                config,
                checkpoint,
                self.metadata(CheckpointSource::Interrupt, step, &frontier, ctx)?,
            )
            .await?;
        if !pending.is_empty() {
            self.checkpointer.put_writes(&resolved, pending).await?;
        }

        Ok(RunOutcome {
            status: RunStatus::Interrupted,
            values: store.snapshot()?,
            interrupt: Some(signal),
            error: None,
            checkpoint: Some(resolved),
        })
    }

    async fn execute_batch(
        &self,
        batch: &[Task],
        state: &Value,
        ctx: &RunContext,
    ) -> Vec<(Task, Result<NodeOutput>)> {
        if batch.is_empty() {
            return Vec::new();
        }
        let cap = self
            .config
            .max_concurrency
            .unwrap_or(batch.len())
            .max(1);

        let mut results = Vec::with_capacity(batch.len());
        for chunk in batch.chunks(cap) {
            let futures = chunk.iter().map(|task| {
                let node_ctx = NodeContext {
                    state: state.clone(),
                    send_arg: task.send_arg.clone(),
                    run: ctx.clone(),
                };
                async move {
                    match self.graph.node(&task.node) {
                        Some(node) => (node.executor)(node_ctx).await,
                        None => Err(GraphError::configuration(format!(
                            "task references unknown node '{}'",
                            task.node
                        ))),
                    }
                }
            });
            let chunk_results = join_all(futures).await;
            results.extend(chunk.iter().cloned().zip(chunk_results));
        }
        results
    }

    async fn finish(&self, result: Result<RunOutcome>, ctx: &RunContext) -> Result<RunOutcome> {
        let outcome = match result {
            Ok(outcome) => {
                if let Some(signal) = &outcome.interrupt {
                    self.interrupts.register(InterruptRecord::from_signal(
                        ctx.thread_id.clone(),
                        ctx.run_id.clone(),
                        signal,
                    ));
                    let _ = ctx.events.emit(RunEvent::Interrupt {
                        payload: signal.payload.clone(),
                    });
                }
                let _ = ctx.events.emit(RunEvent::RunEnd {
                    run_id: ctx.run_id.clone(),
                    outputs: serde_json::to_value(&outcome.values).unwrap_or(Value::Null),
                });
                outcome
            }
            Err(error) => {
                let status = match &error {
                    GraphError::Aborted | GraphError::Checkpoint(_) => RunStatus::Aborted,
                    _ => RunStatus::Error,
                };
                tracing::error!(run_id = %ctx.run_id, error = %error, "run failed");
                let _ = ctx.events.emit(RunEvent::RunError {
                    run_id: ctx.run_id.clone(),
                    error: error.to_string(),
                });
                RunOutcome {
                    status,
                    values: HashMap::new(),
                    interrupt: None,
                    error: Some(error.to_string()),
                    checkpoint: None,
                }
            }
        };

        for toolset in &self.toolsets {
            toolset.close().await;
        }
        Ok(outcome)
    }
}

fn into_task_result(task: Task, output: NodeOutput) -> TaskResult {
    match output {
        NodeOutput::Writes(writes) => TaskResult {
            task,
            writes,
            goto: None,
        },
        NodeOutput::Command(command) => TaskResult {
            task,
            writes: command.update_writes(),
            goto: command.goto,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{node_fn, ConditionalEdge, NodeSpec, RouterTarget, END};
    use serde_json::json;
    use xpert_checkpoint::channels::ChannelSpec;
    use xpert_checkpoint::InMemoryCheckpointSaver;

    fn counter_graph(limit: usize) -> CompiledGraph {
        // "count" increments forever; the router stops at `limit`
        let mut graph = CompiledGraph::new();
        graph
            .add_channel("count", ChannelSpec::LastValue(Some(json!(0))))
            .unwrap();
        graph.add_node(NodeSpec::new(
            "count",
            node_fn(|ctx| async move {
                let current = ctx.channel("count").as_i64().unwrap_or(0);
                Ok(NodeOutput::write("count", json!(current + 1)))
            }),
        ));
        graph.set_entry("count");
        graph.add_conditional(ConditionalEdge {
            source: "count".to_string(),
            router: Arc::new(move |state| {
                let current = state["count"].as_i64().unwrap_or(0);
                Ok(if (current as usize) < limit {
                    RouterTarget::Node("count".to_string())
                } else {
                    RouterTarget::End
                })
            }),
            path_map: vec!["count".to_string(), END.to_string()],
        });
        graph
    }

    fn runner(graph: CompiledGraph) -> Runner {
        Runner::new(Arc::new(graph), Arc::new(InMemoryCheckpointSaver::new()))
    }

    #[tokio::test]
    async fn test_loop_until_router_ends() {
        let outcome = runner(counter_graph(3))
            .invoke(vec![], RunContext::new("t1", "r1"))
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Success);
        assert_eq!(outcome.values["count"], json!(3));
    }

    #[tokio::test]
    async fn test_recursion_limit_enforced() {
        let runner = runner(counter_graph(1000)).with_config(RunnerConfig {
            recursion_limit: 4,
            ..Default::default()
        });
        let outcome = runner
            .invoke(vec![], RunContext::new("t1", "r1"))
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Error);
        assert!(outcome.error.unwrap().contains("Recursion limit of 4"));
    }

    #[tokio::test]
    async fn test_recursion_limit_keeps_last_checkpoint() {
        let checkpointer = Arc::new(InMemoryCheckpointSaver::new());
        let runner = Runner::new(Arc::new(counter_graph(1000)), checkpointer.clone())
            .with_config(RunnerConfig {
                recursion_limit: 4,
                ..Default::default()
            });
        runner
            .invoke(vec![], RunContext::new("t1", "r1"))
            .await
            .unwrap();

        // The last committed step is preserved for later resume
        let tuple = checkpointer
            .get_tuple(&CheckpointConfig::new("t1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tuple.checkpoint.channel_values["count"], json!(4));
    }

    #[tokio::test]
    async fn test_abort_stops_writes() {
        let (handle, signal) = crate::runtime::abort_channel();
        let ctx = RunContext::new("t1", "r1").with_signal(signal);
        handle.abort();

        let outcome = runner(counter_graph(100)).invoke(vec![], ctx).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Aborted);
    }

    #[tokio::test]
    async fn test_interrupt_before_suspends_and_resumes() {
        let mut graph = counter_graph(2);
        graph.interrupt_before = vec!["count".to_string()];
        let checkpointer = Arc::new(InMemoryCheckpointSaver::new());
        let runner = Runner::new(Arc::new(graph), checkpointer);

        let outcome = runner
            .invoke(vec![], RunContext::new("t1", "r1"))
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Interrupted);
        let signal = outcome.interrupt.unwrap();
        assert_eq!(signal.payload["node"], json!("count"));

        // Approving resumes; the gate consumes the resume and the node runs
        let outcome = runner
            .resume(
                Command::new().with_resume(json!({"approved": true})),
                RunContext::new("t1", "r2"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Interrupted); // gated again next loop
    }

    #[tokio::test]
    async fn test_input_checkpoint_written() {
        let checkpointer = Arc::new(InMemoryCheckpointSaver::new());
        let runner = Runner::new(Arc::new(counter_graph(1)), checkpointer.clone());
        runner
            .invoke(
                vec![("count".to_string(), json!(0))],
                RunContext::new("t1", "r1"),
            )
            .await
            .unwrap();

        let history = checkpointer
            .list(&CheckpointConfig::new("t1"), None, None)
            .await
            .unwrap();
        // input checkpoint + one loop step
        assert_eq!(history.len(), 2);
        assert_eq!(
            history.last().unwrap().metadata.source,
            Some(CheckpointSource::Input)
        );
    }
}
