//! Error types for rtsync.

use thiserror::Error;

/// Errors that can occur while handling change events.
#[derive(Debug, Error)]
pub enum SyncError {
    /// JSON serialization or deserialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Event is missing a required field or has the wrong shape
    #[error("invalid data: {0}")]
    InvalidData(String),
}
