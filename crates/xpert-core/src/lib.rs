//! # xpert-core — agent graph runtime
//!
//! A checkpointed, streaming state-machine executor for LLM-powered agent
//! teams. A declarative [`Xpert`](xpert::Xpert) compiles into a
//! [`CompiledGraph`](graph::CompiledGraph) of agent nodes, tool nodes,
//! workflow nodes and middleware hooks; the Pregel-style
//! [`Runner`](pregel::Runner) drives it with durable checkpoints,
//! fan-out over tool calls, interrupt/resume for human review and
//! client-side tools, and a per-run streaming event bus.
//!
//! The runtime depends only on interface contracts at its seams:
//! [`CheckpointSaver`](xpert_checkpoint::CheckpointSaver),
//! [`Toolset`](tool::Toolset), [`ChatModel`](llm::ChatModel),
//! [`Store`](store::Store) and [`ExecutionLedger`](ledger::ExecutionLedger).
//! Implementations are chosen at startup.

pub mod command;
pub mod compiler;
pub mod error;
pub mod graph;
pub mod interrupt;
pub mod ledger;
pub mod llm;
pub mod messages;
pub mod middleware;
pub mod pregel;
pub mod runtime;
pub mod schema;
pub mod send;
pub mod store;
pub mod stream;
pub mod tool;
pub mod tool_node;
pub mod xpert;

pub use command::{Command, GotoTarget};
pub use compiler::{compile_xpert, CompileOptions, KnowledgeRetriever};
pub use error::{GraphError, Result};
pub use graph::{
    node_fn, CompiledGraph, ConditionalEdge, Edge, NodeContext, NodeExecutor, NodeOutput,
    NodeSpec, RouterTarget, END, START, SUMMARIZE_CONVERSATION, TITLE_CONVERSATION,
};
pub use interrupt::{
    ActionRequest, ConsumeOutcome, Decision, DecisionType, InterruptKind, InterruptManager,
    InterruptRecord, InterruptSignal, ReviewConfig,
};
pub use ledger::{
    Execution, ExecutionLedger, ExecutionOutcome, ExecutionStatus, InMemoryLedger, ModelUsage,
    SqliteLedger,
};
pub use llm::{
    ChatCompletion, ChatModel, FailingChatModel, MockChatModel, ModelCallContext, ModelRequest,
    ToolDefinition,
};
pub use messages::{add_messages, Message, MessageRole, RemoveMessage, ToolMessageStatus};
pub use middleware::{
    AgentMiddleware, ClientEffectMiddleware, ClientToolMiddleware, HookOutcome,
    HumanInTheLoopMiddleware, JumpTo, LlmToolSelectorMiddleware, MiddlewareHooks,
    SummarizationMiddleware, TodoListMiddleware,
};
pub use pregel::{RunOutcome, RunStatus, Runner, RunnerConfig};
pub use runtime::{abort_channel, AbortHandle, AbortSignal, RunContext};
pub use send::Send;
pub use store::{InMemoryStore, Store, StoreItem};
pub use stream::{EventBus, MutePolicy, RunEvent};
pub use tool::{SimpleToolset, Tool, ToolCall, ToolRegistry, Toolset};
pub use tool_node::{AssignSource, ToolNode, VariableAssigner};
pub use xpert::{
    AgentConfig, ErrorHandling, Xpert, XpertAgent, XpertAgentOptions, XpertGraph, XpertNode,
    XpertNodeEntity,
};
