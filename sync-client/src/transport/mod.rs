//! Transport abstraction for rtsync.
//!
//! This module provides a pluggable transport layer that abstracts the
//! underlying change-notification channel (a realtime socket, a database
//! replication feed, a mock for testing).
//!
//! # Design
//!
//! The transport is channel-oriented, one channel per topic subscription:
//! - `open()` starts a channel and returns its message stream
//! - the stream carries status changes and change events, in order
//! - `close()` tears the channel down and ends the stream
//!
//! Delivery is at-least-once. The engine tolerates duplicates.
//!
//! # Example
//!
//! ```ignore
//! let transport = MockTransport::new();
//! let mut channel = transport.open(&Topic::new("orders"), EventFilter::Any).await?;
//! while let Some(message) = channel.messages.recv().await {
//!     // ChannelMessage::Status(..) or ChannelMessage::Change(..)
//! }
//! ```

mod mock;

pub use mock::MockTransport;

use async_trait::async_trait;
use sync_types::{ChangeEvent, EventFilter, Topic};
use thiserror::Error;
use tokio::sync::mpsc;

/// Identifier of one open channel.
pub type ChannelId = u64;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Channel could not be opened.
    #[error("open failed: {0}")]
    OpenFailed(String),

    /// No such channel.
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    /// Close failed.
    #[error("close failed: {0}")]
    CloseFailed(String),

    /// Request timed out.
    #[error("transport timeout")]
    Timeout,
}

/// Channel status reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Server confirmed the subscription.
    Subscribed,
    /// Channel error.
    Error(String),
    /// Channel timed out.
    TimedOut,
    /// Channel closed cleanly.
    Closed,
}

/// Message on a channel stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    /// Status change.
    Status(ChannelStatus),
    /// Change event on the channel's topic.
    Change(ChangeEvent),
}

/// An open channel.
#[derive(Debug)]
pub struct Channel {
    /// Identifier passed back to [`Transport::close`].
    pub id: ChannelId,
    /// Ordered message stream. Ends when the channel is closed.
    pub messages: mpsc::UnboundedReceiver<ChannelMessage>,
}

/// Transport trait for topic change-notification channels.
///
/// Implementations handle the underlying connection mechanism.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a channel for `topic`, delivering events that pass `filter`.
    async fn open(&self, topic: &Topic, filter: EventFilter) -> Result<Channel, TransportError>;

    /// Close a channel, releasing its server-side resources.
    async fn close(&self, channel: ChannelId) -> Result<(), TransportError>;
}
