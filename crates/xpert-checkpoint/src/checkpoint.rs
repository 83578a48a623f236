//! Core checkpoint data structures
//!
//! A [`Checkpoint`] is a durable snapshot of every channel in a run's state,
//! keyed by `(thread_id, checkpoint_ns, checkpoint_id)` and linked to its
//! parent so a thread's history can be replayed or resumed from any point.
//! Sub-agents and collaborators store their snapshots under hierarchical
//! dotted namespaces (`"agent_a.collab_b"`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Checkpoint ID type
pub type CheckpointId = String;

/// Pending write tuple: (task_id, channel, value)
///
/// A write produced by a task that has not been merged into a checkpoint
/// yet. Pending writes are replay-safe: re-applying them after a crash or
/// resume yields the same channel state.
pub type PendingWrite = (String, String, serde_json::Value);

/// Where a checkpoint came from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Created from the input of a new run
    Input,
    /// Created inside the scheduler loop after a step committed
    Loop,
    /// Created by a manual state update (e.g. a resume command's `update`)
    Update,
    /// Created when an interrupt suspended the run
    Interrupt,
}

/// Metadata stored alongside a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckpointMetadata {
    /// The source of the checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CheckpointSource>,

    /// Step number: -1 for the input checkpoint, 0 for the first loop
    /// checkpoint, n for the nth afterwards
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,

    /// The run that produced this checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    /// Additional custom metadata
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CheckpointMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: CheckpointSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// State snapshot at a given point in a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique checkpoint id (UUID, monotonically created)
    pub id: CheckpointId,

    /// Parent checkpoint id; `None` for the root of a thread/namespace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<CheckpointId>,

    /// Creation timestamp
    pub ts: DateTime<Utc>,

    /// Channel name → serialized channel snapshot
    pub channel_values: HashMap<String, serde_json::Value>,

    /// Writes staged for the next step that have not been merged yet
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_writes: Vec<PendingWrite>,
}

impl Checkpoint {
    /// Create a checkpoint from a full channel snapshot
    pub fn new(
        channel_values: HashMap<String, serde_json::Value>,
        parent_id: Option<CheckpointId>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id,
            ts: Utc::now(),
            channel_values,
            pending_writes: Vec::new(),
        }
    }

    /// Create an empty root checkpoint
    pub fn empty() -> Self {
        Self::new(HashMap::new(), None)
    }

    pub fn with_pending_writes(mut self, writes: Vec<PendingWrite>) -> Self {
        self.pending_writes = writes;
        self
    }
}

/// Identifies a checkpoint location: thread, namespace and optionally a
/// specific checkpoint id. When `checkpoint_id` is absent, operations act on
/// the latest checkpoint of the `(thread_id, checkpoint_ns)` pair.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CheckpointConfig {
    /// Thread grouping related checkpoints
    pub thread_id: String,

    /// Hierarchical namespace, dotted for sub-agent scopes; `""` is the root
    #[serde(default)]
    pub checkpoint_ns: String,

    /// Specific checkpoint to address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,
}

impl CheckpointConfig {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_ns: String::new(),
            checkpoint_id: None,
        }
    }

    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.checkpoint_ns = ns.into();
        self
    }

    pub fn with_checkpoint_id(mut self, id: impl Into<CheckpointId>) -> Self {
        self.checkpoint_id = Some(id.into());
        self
    }

    /// Namespace of a child scope under this config
    pub fn child_namespace(&self, segment: &str) -> String {
        if self.checkpoint_ns.is_empty() {
            segment.to_string()
        } else {
            format!("{}.{}", self.checkpoint_ns, segment)
        }
    }
}

/// A checkpoint together with its identifying config, metadata, parent link
/// and any uncommitted writes
#[derive(Debug, Clone)]
pub struct CheckpointTuple {
    /// Actual config of the stored checkpoint (with resolved checkpoint_id)
    pub config: CheckpointConfig,

    /// The checkpoint itself
    pub checkpoint: Checkpoint,

    /// Metadata recorded at save time
    pub metadata: CheckpointMetadata,

    /// Config of the parent checkpoint, if any
    pub parent_config: Option<CheckpointConfig>,

    /// Writes recorded via `put_writes` that are not merged yet
    pub pending_writes: Vec<PendingWrite>,
}

impl CheckpointTuple {
    pub fn new(
        config: CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Self {
        Self {
            config,
            checkpoint,
            metadata,
            parent_config: None,
            pending_writes: Vec::new(),
        }
    }

    pub fn with_parent_config(mut self, parent: CheckpointConfig) -> Self {
        self.parent_config = Some(parent);
        self
    }

    pub fn with_pending_writes(mut self, writes: Vec<PendingWrite>) -> Self {
        self.pending_writes = writes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_creation() {
        let checkpoint = Checkpoint::empty();
        assert!(checkpoint.parent_id.is_none());
        assert!(checkpoint.channel_values.is_empty());
        assert!(checkpoint.pending_writes.is_empty());
    }

    #[test]
    fn test_checkpoint_parent_link() {
        let root = Checkpoint::empty();
        let child = Checkpoint::new(HashMap::new(), Some(root.id.clone()));
        assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
    }

    #[test]
    fn test_config_child_namespace() {
        let config = CheckpointConfig::new("t1");
        assert_eq!(config.child_namespace("researcher"), "researcher");

        let nested = config.with_namespace("researcher");
        assert_eq!(nested.child_namespace("critic"), "researcher.critic");
    }

    #[test]
    fn test_metadata_builder() {
        let metadata = CheckpointMetadata::new()
            .with_source(CheckpointSource::Input)
            .with_step(-1)
            .with_run_id("run-1");

        assert_eq!(metadata.source, Some(CheckpointSource::Input));
        assert_eq!(metadata.step, Some(-1));
        assert_eq!(metadata.run_id.as_deref(), Some("run-1"));
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let mut values = HashMap::new();
        values.insert("messages".to_string(), serde_json::json!([{"id": "m1"}]));
        let checkpoint = Checkpoint::new(values, None)
            .with_pending_writes(vec![("task".into(), "messages".into(), serde_json::json!(1))]);

        let json = serde_json::to_string(&checkpoint).unwrap();
        let restored: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.id, checkpoint.id);
        assert_eq!(restored.channel_values, checkpoint.channel_values);
        assert_eq!(restored.pending_writes, checkpoint.pending_writes);
    }
}
