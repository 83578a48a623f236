//! In-memory checkpoint backend
//!
//! Reference implementation of [`CheckpointSaver`]. Used in tests and for
//! ephemeral deployments; durable deployments use the SQLite backend.

use crate::checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple, PendingWrite,
};
use crate::error::Result;
use crate::traits::CheckpointSaver;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

type ThreadKey = (String, String); // (thread_id, checkpoint_ns)

#[derive(Clone)]
struct StoredCheckpoint {
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    writes: Vec<PendingWrite>,
}

/// Thread-safe in-memory checkpoint store.
///
/// Checkpoints are kept in insertion order per `(thread_id, ns)` pair, which
/// is also their chronological order since the runner is the single writer
/// for any given pair.
#[derive(Default)]
pub struct InMemoryCheckpointSaver {
    storage: RwLock<HashMap<ThreadKey, Vec<StoredCheckpoint>>>,
}

impl InMemoryCheckpointSaver {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(config: &CheckpointConfig) -> ThreadKey {
        (config.thread_id.clone(), config.checkpoint_ns.clone())
    }

    fn to_tuple(config: &CheckpointConfig, stored: &StoredCheckpoint) -> CheckpointTuple {
        let resolved = CheckpointConfig {
            thread_id: config.thread_id.clone(),
            checkpoint_ns: config.checkpoint_ns.clone(),
            checkpoint_id: Some(stored.checkpoint.id.clone()),
        };
        let parent_config = stored.checkpoint.parent_id.as_ref().map(|pid| {
            CheckpointConfig {
                thread_id: config.thread_id.clone(),
                checkpoint_ns: config.checkpoint_ns.clone(),
                checkpoint_id: Some(pid.clone()),
            }
        });
        let mut tuple = CheckpointTuple::new(
            resolved,
            stored.checkpoint.clone(),
            stored.metadata.clone(),
        )
        .with_pending_writes(stored.writes.clone());
        if let Some(parent) = parent_config {
            tuple = tuple.with_parent_config(parent);
        }
        tuple
    }
}

#[async_trait]
impl CheckpointSaver for InMemoryCheckpointSaver {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let storage = self
            .storage
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(checkpoints) = storage.get(&Self::key(config)) else {
            return Ok(None);
        };

        let stored = match &config.checkpoint_id {
            Some(id) => checkpoints.iter().find(|s| &s.checkpoint.id == id),
            None => checkpoints.last(),
        };
        Ok(stored.map(|s| Self::to_tuple(config, s)))
    }

    async fn list(
        &self,
        config: &CheckpointConfig,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointTuple>> {
        let storage = self
            .storage
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(checkpoints) = storage.get(&Self::key(config)) else {
            return Ok(Vec::new());
        };

        let before_id = before.and_then(|b| b.checkpoint_id.clone());
        let mut end = checkpoints.len();
        if let Some(before_id) = before_id {
            if let Some(idx) = checkpoints
                .iter()
                .position(|s| s.checkpoint.id == before_id)
            {
                end = idx;
            }
        }

        let mut tuples: Vec<_> = checkpoints[..end]
            .iter()
            .rev()
            .map(|s| Self::to_tuple(config, s))
            .collect();
        if let Some(limit) = limit {
            tuples.truncate(limit);
        }
        Ok(tuples)
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointConfig> {
        let resolved = CheckpointConfig {
            thread_id: config.thread_id.clone(),
            checkpoint_ns: config.checkpoint_ns.clone(),
            checkpoint_id: Some(checkpoint.id.clone()),
        };

        let mut storage = self
            .storage
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let checkpoints = storage.entry(Self::key(config)).or_default();
        match checkpoints
            .iter_mut()
            .find(|s| s.checkpoint.id == checkpoint.id)
        {
            Some(existing) => {
                existing.checkpoint = checkpoint;
                existing.metadata = metadata;
            }
            None => checkpoints.push(StoredCheckpoint {
                checkpoint,
                metadata,
                writes: Vec::new(),
            }),
        }
        Ok(resolved)
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<PendingWrite>,
    ) -> Result<()> {
        let Some(checkpoint_id) = &config.checkpoint_id else {
            return Err(crate::error::CheckpointError::Invalid(
                "put_writes requires a checkpoint_id".to_string(),
            ));
        };

        let mut storage = self
            .storage
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let checkpoints = storage.entry(Self::key(config)).or_default();
        let Some(stored) = checkpoints
            .iter_mut()
            .find(|s| &s.checkpoint.id == checkpoint_id)
        else {
            return Err(crate::error::CheckpointError::NotFound {
                thread_id: config.thread_id.clone(),
                checkpoint_ns: config.checkpoint_ns.clone(),
            });
        };
        stored.writes.extend(writes);
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut storage = self
            .storage
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        storage.retain(|(tid, _), _| tid != thread_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn snapshot(pairs: &[(&str, serde_json::Value)]) -> StdHashMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_put_and_get_latest() {
        let saver = InMemoryCheckpointSaver::new();
        let config = CheckpointConfig::new("t1");

        let first = Checkpoint::new(snapshot(&[("x", serde_json::json!(1))]), None);
        let first_id = first.id.clone();
        saver
            .put(&config, first, CheckpointMetadata::new().with_step(0))
            .await
            .unwrap();

        let second = Checkpoint::new(snapshot(&[("x", serde_json::json!(2))]), Some(first_id.clone()));
        saver
            .put(&config, second.clone(), CheckpointMetadata::new().with_step(1))
            .await
            .unwrap();

        let tuple = saver.get_tuple(&config).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.id, second.id);
        assert_eq!(
            tuple.parent_config.unwrap().checkpoint_id.as_deref(),
            Some(first_id.as_str())
        );
    }

    #[tokio::test]
    async fn test_get_specific_checkpoint() {
        let saver = InMemoryCheckpointSaver::new();
        let config = CheckpointConfig::new("t1");

        let first = Checkpoint::new(snapshot(&[("x", serde_json::json!(1))]), None);
        let first_id = first.id.clone();
        saver.put(&config, first, CheckpointMetadata::new()).await.unwrap();
        let second = Checkpoint::new(snapshot(&[("x", serde_json::json!(2))]), Some(first_id.clone()));
        saver.put(&config, second, CheckpointMetadata::new()).await.unwrap();

        let specific = config.clone().with_checkpoint_id(first_id.clone());
        let tuple = saver.get_tuple(&specific).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.id, first_id);
        assert_eq!(tuple.checkpoint.channel_values["x"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let saver = InMemoryCheckpointSaver::new();
        let root = CheckpointConfig::new("t1");
        let sub = CheckpointConfig::new("t1").with_namespace("researcher");

        saver
            .put(&root, Checkpoint::empty(), CheckpointMetadata::new())
            .await
            .unwrap();

        assert!(saver.get_tuple(&sub).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_newest_first_with_limit() {
        let saver = InMemoryCheckpointSaver::new();
        let config = CheckpointConfig::new("t1");

        let mut parent = None;
        let mut ids = Vec::new();
        for i in 0..4 {
            let cp = Checkpoint::new(snapshot(&[("step", serde_json::json!(i))]), parent.clone());
            ids.push(cp.id.clone());
            parent = Some(cp.id.clone());
            saver.put(&config, cp, CheckpointMetadata::new()).await.unwrap();
        }

        let listed = saver.list(&config, None, Some(2)).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].checkpoint.id, ids[3]);
        assert_eq!(listed[1].checkpoint.id, ids[2]);

        let before = config.clone().with_checkpoint_id(ids[2].clone());
        let earlier = saver.list(&config, Some(&before), None).await.unwrap();
        assert_eq!(earlier.len(), 2);
        assert_eq!(earlier[0].checkpoint.id, ids[1]);
    }

    #[tokio::test]
    async fn test_pending_writes_round_trip() {
        let saver = InMemoryCheckpointSaver::new();
        let config = CheckpointConfig::new("t1");
        let checkpoint = Checkpoint::empty();
        let resolved = saver
            .put(&config, checkpoint, CheckpointMetadata::new())
            .await
            .unwrap();

        saver
            .put_writes(
                &resolved,
                vec![("task-1".into(), "messages".into(), serde_json::json!({"id": "m1"}))],
            )
            .await
            .unwrap();

        let tuple = saver.get_tuple(&config).await.unwrap().unwrap();
        assert_eq!(tuple.pending_writes.len(), 1);
        assert_eq!(tuple.pending_writes[0].1, "messages");
    }

    #[tokio::test]
    async fn test_delete_thread() {
        let saver = InMemoryCheckpointSaver::new();
        let config = CheckpointConfig::new("t1");
        let other = CheckpointConfig::new("t2");
        saver.put(&config, Checkpoint::empty(), CheckpointMetadata::new()).await.unwrap();
        saver.put(&other, Checkpoint::empty(), CheckpointMetadata::new()).await.unwrap();

        saver.delete_thread("t1").await.unwrap();
        assert!(saver.get_tuple(&config).await.unwrap().is_none());
        assert!(saver.get_tuple(&other).await.unwrap().is_some());
    }
}
