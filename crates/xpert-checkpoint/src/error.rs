//! Error types for the checkpoint crate

use thiserror::Error;

/// Errors raised by channels and checkpoint backends
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// A channel rejected an update or a lookup referenced an unknown channel
    #[error("Invalid channel operation: {0}")]
    Invalid(String),

    /// Unknown channel name in an update batch
    #[error("Unknown channel '{0}'")]
    UnknownChannel(String),

    /// Serialization of a checkpoint or channel value failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The storage backend failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// The requested checkpoint does not exist
    #[error("Checkpoint not found: thread '{thread_id}', ns '{checkpoint_ns}'")]
    NotFound {
        thread_id: String,
        checkpoint_ns: String,
    },
}

impl From<sqlx::Error> for CheckpointError {
    fn from(e: sqlx::Error) -> Self {
        CheckpointError::Storage(e.to_string())
    }
}

/// Result alias for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;
