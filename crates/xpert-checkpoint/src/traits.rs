//! Checkpoint storage trait for backend implementations
//!
//! [`CheckpointSaver`] is the single abstraction the runner depends on for
//! durability. A backend must provide single-writer semantics per
//! `(thread_id, checkpoint_ns, checkpoint_id)` and must never expose a
//! partially-written checkpoint: `put` either lands the whole tuple or
//! fails, in which case the run is marked ERROR and the previous checkpoint
//! stays valid for a later resume.

use crate::checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple, PendingWrite,
};
use crate::error::Result;
use async_trait::async_trait;

/// Core trait for checkpoint storage backends
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Fetch just the checkpoint for a config.
    ///
    /// When `config.checkpoint_id` is absent this resolves to the latest
    /// checkpoint on `(thread_id, checkpoint_ns)`.
    async fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>> {
        Ok(self.get_tuple(config).await?.map(|t| t.checkpoint))
    }

    /// Retrieve a complete checkpoint tuple: the checkpoint, its metadata,
    /// the parent config for history traversal, and any pending writes
    /// recorded against it.
    ///
    /// Returns `Ok(None)` (not an error) when no checkpoint matches.
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>>;

    /// List checkpoints for `(thread_id, checkpoint_ns)` newest first.
    ///
    /// `before` restricts the result to checkpoints created before the
    /// referenced one; `limit` caps the number of results.
    async fn list(
        &self,
        config: &CheckpointConfig,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointTuple>>;

    /// Store a checkpoint. Idempotent on the primary key: putting the same
    /// `(thread_id, ns, id)` twice overwrites with identical content rather
    /// than duplicating.
    ///
    /// Returns the config of the stored checkpoint with its resolved id.
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointConfig>;

    /// Record tentative writes for a step before they are merged into the
    /// next checkpoint. Used for replay after interrupts and crashes.
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<PendingWrite>,
    ) -> Result<()>;

    /// Delete all checkpoints and writes belonging to a thread, across all
    /// namespaces.
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;
}
