//! Engine error types.

use std::time::Duration;
use sync_types::UpdateId;
use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced by [`SyncEngine`](crate::SyncEngine).
///
/// Channel failures are retried internally and never appear here; an
/// exhausted retry budget reaches listeners as
/// [`SyncNotification::SubscriptionFailed`](crate::SyncNotification::SubscriptionFailed).
#[derive(Debug, Error)]
pub enum EngineError {
    /// The confirmation operation rejected the write. The cache was rolled back.
    #[error("update {update_id} rejected: {reason}")]
    ConfirmationFailed {
        /// Rolled-back update.
        update_id: UpdateId,
        /// Rejection reason reported by the confirmation operation.
        reason: String,
    },

    /// No confirmation arrived in time. The cache was rolled back.
    #[error("update {update_id} not confirmed within {timeout:?}")]
    TimedOut {
        /// Rolled-back update.
        update_id: UpdateId,
        /// Pending window that elapsed.
        timeout: Duration,
    },

    /// The update was discarded by `force_refresh`.
    #[error("pending update discarded by refresh")]
    Reset,

    /// The engine was shut down before the operation resolved.
    #[error("engine shut down")]
    Shutdown,

    /// The request was rejected before anything was applied.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The engine was constructed outside a Tokio runtime.
    #[error("no tokio runtime available")]
    NoRuntime,

    /// Transport error while tearing down channels.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
