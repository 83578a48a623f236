//! Declarative Xpert model
//!
//! An [`Xpert`] is an immutable-per-version description of an agent team: a
//! graph of typed nodes (agent / knowledge / toolset / xpert / workflow)
//! and connections, plus per-agent configuration. At most one version per
//! slug is marked `latest`. The runtime resolves toolset and knowledgebase
//! references at compile time; they are ids here, not owned objects.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A versioned declarative definition of an agent team
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Xpert {
    pub id: String,
    pub slug: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: String,
    /// At most one version per slug carries this flag
    #[serde(default)]
    pub latest: bool,
    pub graph: XpertGraph,
    #[serde(default)]
    pub agent_config: AgentConfig,
}

impl Xpert {
    /// The agent node with the given key
    pub fn agent(&self, key: &str) -> Option<&XpertAgent> {
        self.graph.nodes.iter().find_map(|node| match &node.entity {
            XpertNodeEntity::Agent(agent) if agent.key == key => Some(agent),
            _ => None,
        })
    }

    /// The workflow node with the given key
    pub fn workflow(&self, key: &str) -> Option<&WorkflowNode> {
        self.graph.nodes.iter().find_map(|node| match &node.entity {
            XpertNodeEntity::Workflow(workflow) if workflow.key == key => Some(workflow),
            _ => None,
        })
    }

    /// The primary agent: target of the entry connection, or the first
    /// agent node
    pub fn primary_agent(&self) -> Option<&XpertAgent> {
        self.graph.nodes.iter().find_map(|node| match &node.entity {
            XpertNodeEntity::Agent(agent) => Some(agent),
            _ => None,
        })
    }
}

/// The user-declared topology
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct XpertGraph {
    pub nodes: Vec<XpertNode>,
    #[serde(default)]
    pub connections: Vec<XpertConnection>,
}

/// A typed node in the declarative graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XpertNode {
    pub key: String,
    pub entity: XpertNodeEntity,
}

/// Node payloads by type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum XpertNodeEntity {
    Agent(XpertAgent),
    Knowledge(KnowledgeNode),
    Toolset(ToolsetNode),
    /// An external Xpert collaborating as a tool
    Xpert(CollaboratorNode),
    Workflow(WorkflowNode),
}

/// An edge in the declarative graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XpertConnection {
    pub from: String,
    pub to: String,
    #[serde(rename = "type", default)]
    pub kind: ConnectionKind,
}

/// Connection types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    #[default]
    Edge,
    Agent,
    Toolset,
    Knowledge,
    Xpert,
    Workflow,
}

/// A single agent inside an Xpert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XpertAgent {
    /// Unique within the xpert
    pub key: String,
    pub name: String,
    pub prompt: String,
    /// Input schema of the agent's parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    /// Structured output declaration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_variables: Option<StructuredOutput>,
    #[serde(default)]
    pub toolset_ids: Vec<String>,
    #[serde(default)]
    pub knowledgebase_ids: Vec<String>,
    /// Sub-agents in the same team, exposed as tools named by agent name
    #[serde(default)]
    pub followers: Vec<String>,
    /// External Xperts called as tools, keyed by their id
    #[serde(default)]
    pub collaborators: Vec<String>,
    /// Successor node keys
    #[serde(default)]
    pub next: Vec<String>,
    /// Fail branch target for `error_handling = fail_branch`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail: Option<String>,
    #[serde(default)]
    pub options: XpertAgentOptions,
}

/// Structured output declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredOutput {
    pub name: String,
    /// JSON Schema the output must satisfy
    pub schema: Value,
}

/// Per-agent options
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct XpertAgentOptions {
    /// Model-call retries before the error-handling policy applies
    #[serde(default)]
    pub retries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_handling: Option<ErrorHandling>,
    #[serde(default)]
    pub structured_output_method: StructuredOutputMethod,
    /// Drop prior conversation from the prompt; the request carries the
    /// system message and the current human turn only
    #[serde(default)]
    pub disable_message_history: bool,
    /// Tools that end the agent instead of looping back into the model.
    /// A hint: adds END to the successor set, never replaces it.
    #[serde(default)]
    pub end_nodes: Vec<String>,
    /// Per-tool overrides
    #[serde(default)]
    pub tools: HashMap<String, ToolOverride>,
    /// Write conversation summaries to long-term memory
    #[serde(default)]
    pub memories: bool,
    /// Generate a conversation title when the run finishes
    #[serde(default)]
    pub title_conversation: bool,
    /// Summarize the conversation when the run finishes
    #[serde(default)]
    pub summarize_conversation: bool,
}

/// Error-handling policy of an agent's model call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ErrorHandling {
    /// Substitute a configured AI message
    DefaultValue { content: String },
    /// Route to the agent's declared fail node
    FailBranch,
}

/// How structured output is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StructuredOutputMethod {
    /// Instruct via the system prompt and parse the reply
    #[default]
    Prompt,
    /// Force a synthetic tool call carrying the output
    Tool,
}

/// Per-tool configuration overrides
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Sensitive tools require confirmation before execution
    #[serde(default)]
    pub sensitive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Knowledge node: binds a knowledgebase with recall parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeNode {
    pub knowledgebase_id: String,
    #[serde(default)]
    pub recall: RecallParams,
}

/// Retrieval parameters of a knowledge node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallParams {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub score_threshold: f64,
}

fn default_top_k() -> usize {
    4
}

impl Default for RecallParams {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            score_threshold: 0.0,
        }
    }
}

/// Toolset node: references a toolset by id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsetNode {
    pub toolset_id: String,
    /// Allow-list of tool names; empty means all
    #[serde(default)]
    pub tools: Vec<String>,
}

/// Collaborator node: an external Xpert used as a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorNode {
    pub xpert_id: String,
}

/// A workflow node in the graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Adds END to the node's successor set
    #[serde(default)]
    pub is_end: bool,
    /// Channel this node declares, reduced last-writer-wins
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(flatten)]
    pub kind: WorkflowKind,
}

/// Workflow node behaviors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WorkflowKind {
    /// A task exposing a callable surface to agents. Invoking the task
    /// writes `result` into the node's channel.
    Task {
        description: String,
        #[serde(default)]
        schema: Value,
        result: Value,
    },
    /// A router: compares a channel field against literal cases
    Route {
        /// Channel inspected by the router
        input: String,
        /// Optional field inside the channel value
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        /// Literal value → destination node key
        cases: HashMap<String, String>,
        /// Destination when no case matches
        #[serde(skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
}

/// Run-level configuration of an Xpert
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    /// Per-run wall-clock budget
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recursion_limit: Option<usize>,
    /// Bounded parallelism within a step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Language for localized runtime messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}
