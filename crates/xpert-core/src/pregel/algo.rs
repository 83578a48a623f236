//! Step planning: ready-set selection, deferred joins, routing
//!
//! Determinism: the frontier preserves predecessor routing order, and
//! successors of a step are appended by iterating completed tasks in batch
//! order with each router's results kept in their declared order. Two nodes
//! writing the same field in one step therefore commit in (predecessor
//! order, node name) order.

use crate::command::GotoTarget;
use crate::error::{GraphError, Result};
use crate::graph::{CompiledGraph, RouterTarget, END};
use crate::pregel::types::{Task, TaskResult};
use serde_json::Value;
use std::collections::HashSet;

/// Split the frontier into the batch to run this step and the tasks that
/// stay queued.
///
/// Non-deferred tasks run first. Deferred join nodes run only once no
/// non-deferred work remains, and multiple pending tasks for the same
/// deferred node collapse into one.
pub fn plan_step(graph: &CompiledGraph, frontier: Vec<Task>) -> (Vec<Task>, Vec<Task>) {
    let (ready, deferred): (Vec<Task>, Vec<Task>) = frontier
        .into_iter()
        .partition(|task| !graph.node(&task.node).map(|n| n.defer).unwrap_or(false));

    if !ready.is_empty() {
        return (ready, deferred);
    }

    // Only deferred work left: all predecessors have completed. Collapse
    // duplicate tasks per node, keeping the first occurrence's payload.
    let mut seen = HashSet::new();
    let mut batch = Vec::new();
    for task in deferred {
        if seen.insert(task.node.clone()) {
            batch.push(task);
        }
    }
    (batch, Vec::new())
}

/// Collect the next frontier from a step's completed tasks.
///
/// A task's `goto` (from a command) replaces its routers; otherwise the
/// node's conditional router decides, falling back to static edges. END
/// targets are dropped.
pub fn route_successors(
    graph: &CompiledGraph,
    results: &[TaskResult],
    state: &Value,
) -> Result<Vec<Task>> {
    let mut next = Vec::new();
    for result in results {
        let targets = match &result.goto {
            Some(goto) => goto_targets(goto, &result.task),
            None => routed_targets(graph, &result.task, state)?,
        };
        next.extend(targets.into_iter().filter(|t| t.node != END));
    }
    Ok(next)
}

fn goto_targets(goto: &GotoTarget, source: &Task) -> Vec<Task> {
    match goto {
        GotoTarget::Node(node) => vec![Task::new(node.clone()).with_predecessor(&source.node)],
        GotoTarget::Nodes(nodes) => nodes
            .iter()
            .map(|n| Task::new(n.clone()).with_predecessor(&source.node))
            .collect(),
        GotoTarget::Sends(sends) => sends
            .iter()
            .map(|send| {
                Task::new(send.node())
                    .with_send_arg(send.arg().clone())
                    .with_predecessor(&source.node)
            })
            .collect(),
    }
}

fn routed_targets(graph: &CompiledGraph, source: &Task, state: &Value) -> Result<Vec<Task>> {
    if let Some(conditional) = graph.conditional(&source.node) {
        let target = (conditional.router)(state)?;
        let tasks = match target {
            RouterTarget::Node(node) => {
                ensure_declared(conditional, &node)?;
                vec![Task::new(node).with_predecessor(&source.node)]
            }
            RouterTarget::Nodes(nodes) => {
                for node in &nodes {
                    ensure_declared(conditional, node)?;
                }
                nodes
                    .into_iter()
                    .map(|n| Task::new(n).with_predecessor(&source.node))
                    .collect()
            }
            RouterTarget::Sends(sends) => sends
                .into_iter()
                .map(|send| {
                    let (node, arg) = send.into_parts();
                    ensure_declared(conditional, &node).map(|_| {
                        Task::new(node)
                            .with_send_arg(arg)
                            .with_predecessor(&source.node)
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            RouterTarget::End => vec![],
        };
        return Ok(tasks);
    }

    Ok(graph
        .static_successors(&source.node)
        .into_iter()
        .map(|target| Task::new(target).with_predecessor(&source.node))
        .collect())
}

fn ensure_declared(
    conditional: &crate::graph::ConditionalEdge,
    node: &str,
) -> Result<()> {
    if node == END || conditional.path_map.iter().any(|p| p == node) {
        Ok(())
    } else {
        Err(GraphError::configuration(format!(
            "router of '{}' returned '{}' which is not in its path map",
            conditional.source, node
        )))
    }
}
