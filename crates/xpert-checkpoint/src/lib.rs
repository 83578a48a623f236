//! # xpert-checkpoint — state channels and durable checkpoints
//!
//! This crate provides the two lowest layers of the Xpert agent graph
//! runtime:
//!
//! - **Channels** ([`channels`]) — typed, mergeable slots holding the
//!   accumulated state of a run, applied atomically per scheduler step.
//! - **Checkpoints** ([`checkpoint`], [`traits`]) — durable snapshots of
//!   every channel keyed by `(thread_id, checkpoint_ns, checkpoint_id)`
//!   with parent linkage, enabling resume, replay and human-in-the-loop
//!   suspension.
//!
//! Two [`CheckpointSaver`] backends ship with the crate:
//! [`InMemoryCheckpointSaver`] for tests and ephemeral runs, and
//! [`SqliteCheckpointSaver`] for durable deployments.

pub mod channels;
pub mod checkpoint;
pub mod error;
pub mod memory;
pub mod serializer;
pub mod sqlite;
pub mod traits;

pub use channels::{
    AgentChannel, BinaryOperatorChannel, Channel, ChannelSpec, ChannelStore, LastValueChannel,
    MessagesChannel, ReducerFn, REMOVE_ALL, REMOVE_MARKER,
};
pub use checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointId, CheckpointMetadata, CheckpointSource,
    CheckpointTuple, PendingWrite,
};
pub use error::{CheckpointError, Result};
pub use memory::InMemoryCheckpointSaver;
pub use serializer::{CheckpointSerializer, JsonSerializer};
pub use sqlite::SqliteCheckpointSaver;
pub use traits::CheckpointSaver;
