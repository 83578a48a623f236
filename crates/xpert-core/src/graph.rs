//! Runtime graph representation
//!
//! The executable form a declarative [`crate::xpert::Xpert`] compiles into:
//! nodes with async executors, static edges, conditional routers with
//! exhaustive path maps, the channel set, and the interrupt lists. The
//! scheduler consumes this structure; it never sees the declarative model.

use crate::command::Command;
use crate::error::{GraphError, Result};
use crate::runtime::RunContext;
use crate::send::Send;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use xpert_checkpoint::channels::ChannelSpec;

/// Entry sentinel
pub const START: &str = "__start__";
/// Terminal sentinel
pub const END: &str = "__end__";
/// Conversation summarization terminal node
pub const SUMMARIZE_CONVERSATION: &str = "summarize_conversation";
/// Conversation title terminal node
pub const TITLE_CONVERSATION: &str = "title_conversation";

/// Node identifier
pub type NodeId = String;

/// Execution context handed to a node
#[derive(Clone)]
pub struct NodeContext {
    /// Snapshot of every channel at step start: `{channel: value}`
    pub state: Value,
    /// Payload carried by a [`Send`], when the task was fanned out
    pub send_arg: Option<Value>,
    /// Run-scoped context
    pub run: RunContext,
}

impl NodeContext {
    /// Value of a channel in the snapshot
    pub fn channel(&self, name: &str) -> Value {
        self.state.get(name).cloned().unwrap_or(Value::Null)
    }
}

/// What a node produced
#[derive(Debug, Clone)]
pub enum NodeOutput {
    /// Channel writes, applied atomically with the rest of the step
    Writes(Vec<(String, Value)>),
    /// A command: writes plus an optional navigation override
    Command(Command),
}

impl NodeOutput {
    pub fn empty() -> Self {
        NodeOutput::Writes(Vec::new())
    }

    pub fn write(channel: impl Into<String>, value: Value) -> Self {
        NodeOutput::Writes(vec![(channel.into(), value)])
    }
}

/// Future returned by node executors
pub type NodeFuture = Pin<Box<dyn Future<Output = Result<NodeOutput>> + ::core::marker::Send>>;

/// Node executor function type
pub type NodeExecutor = Arc<dyn Fn(NodeContext) -> NodeFuture + ::core::marker::Send + Sync>;

/// An executable node
#[derive(Clone)]
pub struct NodeSpec {
    pub id: NodeId,
    pub executor: NodeExecutor,
    /// Deferred nodes run only after all their predecessors in the current
    /// step have completed
    pub defer: bool,
}

impl NodeSpec {
    pub fn new(id: impl Into<NodeId>, executor: NodeExecutor) -> Self {
        Self {
            id: id.into(),
            executor,
            defer: false,
        }
    }
}

impl std::fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSpec")
            .field("id", &self.id)
            .field("defer", &self.defer)
            .finish()
    }
}

/// A static edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
}

/// Result of a conditional router
#[derive(Debug, Clone)]
pub enum RouterTarget {
    Node(NodeId),
    Nodes(Vec<NodeId>),
    Sends(Vec<Send>),
    End,
}

/// Router function: inspects the state snapshot, returns the destinations
pub type RouterFn = Arc<dyn Fn(&Value) -> Result<RouterTarget> + ::core::marker::Send + Sync>;

/// A conditional edge with its declared, exhaustive destination set
#[derive(Clone)]
pub struct ConditionalEdge {
    pub source: NodeId,
    pub router: RouterFn,
    /// Every destination the router may return; validated at compile time
    pub path_map: Vec<NodeId>,
}

impl std::fmt::Debug for ConditionalEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionalEdge")
            .field("source", &self.source)
            .field("path_map", &self.path_map)
            .finish()
    }
}

/// The executable graph
#[derive(Clone, Default)]
pub struct CompiledGraph {
    nodes: HashMap<NodeId, NodeSpec>,
    edges: Vec<Edge>,
    conditionals: HashMap<NodeId, ConditionalEdge>,
    pub channels: BTreeMap<String, ChannelSpec>,
    pub interrupt_before: Vec<NodeId>,
    pub interrupt_after: Vec<NodeId>,
    pub entry: NodeId,
    /// Channel of the entry agent; resume-time tool-call rewrites target it
    pub agent_channel: Option<String>,
}

impl CompiledGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: NodeSpec) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn add_edge(&mut self, source: impl Into<NodeId>, target: impl Into<NodeId>) {
        self.edges.push(Edge {
            source: source.into(),
            target: target.into(),
        });
    }

    pub fn add_conditional(&mut self, edge: ConditionalEdge) {
        self.conditionals.insert(edge.source.clone(), edge);
    }

    pub fn add_channel(&mut self, name: impl Into<String>, spec: ChannelSpec) -> Result<()> {
        let name = name.into();
        if self.channels.contains_key(&name) {
            return Err(GraphError::configuration(format!(
                "channel '{name}' declared twice with different reducers"
            )));
        }
        self.channels.insert(name, spec);
        Ok(())
    }

    pub fn set_entry(&mut self, entry: impl Into<NodeId>) {
        self.entry = entry.into();
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    pub fn has_node(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn conditional(&self, source: &str) -> Option<&ConditionalEdge> {
        self.conditionals.get(source)
    }

    /// Static successors of a node, in declaration order
    pub fn static_successors(&self, source: &str) -> Vec<NodeId> {
        self.edges
            .iter()
            .filter(|e| e.source == source)
            .map(|e| e.target.clone())
            .collect()
    }

    /// Mark every node with more than one in-edge as deferred. Conditional
    /// path maps count as in-edges.
    pub fn mark_deferred_joins(&mut self) {
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        for edge in &self.edges {
            *in_degree.entry(edge.target.clone()).or_default() += 1;
        }
        for conditional in self.conditionals.values() {
            for target in &conditional.path_map {
                *in_degree.entry(target.clone()).or_default() += 1;
            }
        }
        for (id, node) in self.nodes.iter_mut() {
            if in_degree.get(id).copied().unwrap_or(0) > 1 {
                node.defer = true;
            }
        }
    }

    /// Compile-time validation: entry and every referenced destination must
    /// exist. A conditional destination missing from the node set fails
    /// compilation.
    pub fn validate(&self) -> Result<()> {
        if self.entry.is_empty() {
            return Err(GraphError::configuration("graph has no entry node"));
        }
        if !self.has_node(&self.entry) {
            return Err(GraphError::configuration(format!(
                "entry node '{}' does not exist",
                self.entry
            )));
        }
        for edge in &self.edges {
            if edge.source != START && !self.has_node(&edge.source) {
                return Err(GraphError::configuration(format!(
                    "edge source '{}' does not exist",
                    edge.source
                )));
            }
            if edge.target != END && !self.has_node(&edge.target) {
                return Err(GraphError::configuration(format!(
                    "edge target '{}' does not exist",
                    edge.target
                )));
            }
        }
        for conditional in self.conditionals.values() {
            if !self.has_node(&conditional.source) {
                return Err(GraphError::configuration(format!(
                    "conditional source '{}' does not exist",
                    conditional.source
                )));
            }
            for target in &conditional.path_map {
                if target != END && !self.has_node(target) {
                    return Err(GraphError::configuration(format!(
                        "conditional destination '{target}' of '{}' does not exist",
                        conditional.source
                    )));
                }
            }
        }
        for node in self.interrupt_before.iter().chain(&self.interrupt_after) {
            if !self.has_node(node) {
                return Err(GraphError::configuration(format!(
                    "interrupt node '{node}' does not exist"
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("entry", &self.entry)
            .field("nodes", &self.node_ids())
            .field("edges", &self.edges.len())
            .field("conditionals", &self.conditionals.len())
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Helper to build a node executor from an async closure
pub fn node_fn<F, Fut>(f: F) -> NodeExecutor
where
    F: Fn(NodeContext) -> Fut + ::core::marker::Send + Sync + 'static,
    Fut: Future<Output = Result<NodeOutput>> + ::core::marker::Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |ctx| {
        let f = Arc::clone(&f);
        Box::pin(async move { f(ctx).await })
    })
}
