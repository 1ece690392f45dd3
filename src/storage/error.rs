//! Storage-specific error types.
//!
//! All storage operations return [`StorageError`] on failure, which can be
//! matched to determine the underlying cause (database, channel, etc.).

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    /// Failed to send command to writer actor.
    #[error("failed to send command to writer actor")]
    ChannelSend,

    /// The writer actor dropped an acknowledgement without answering.
    #[error("writer actor dropped the acknowledgement")]
    AckDropped,

    /// Buffered sample batches failed to insert and were discarded.
    #[error("{lost} samples lost ({written} written): {reason}")]
    BatchLost {
        lost: usize,
        written: usize,
        reason: String,
    },

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error (e.g., thread join failure).
    #[error("internal error: {0}")]
    Internal(String),

    /// Invalid data in database.
    #[error("invalid data: {0}")]
    InvalidData(String),
}
