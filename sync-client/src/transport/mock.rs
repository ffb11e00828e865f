//! Mock transport for testing.
//!
//! Channels are in-process queues. Tests push change events and status
//! changes onto every open channel of a topic and inspect what the engine
//! opened and closed.

use crate::locks::lock;
use super::{Channel, ChannelId, ChannelMessage, ChannelStatus, Transport, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use sync_types::{ChangeEvent, EventFilter, Topic};
use tokio::sync::mpsc;

/// Mock transport for testing.
///
/// Clones share state. By default every opened channel immediately reports
/// [`ChannelStatus::Subscribed`].
#[derive(Debug)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Debug)]
struct MockTransportInner {
    next_id: ChannelId,
    auto_subscribe: bool,
    channels: HashMap<ChannelId, MockChannel>,
    open_attempts: HashMap<Topic, usize>,
    closed: Vec<ChannelId>,
    fail_next_open: Option<String>,
    fail_all_opens: Option<String>,
}

#[derive(Debug)]
struct MockChannel {
    topic: Topic,
    filter: EventFilter,
    sender: mpsc::UnboundedSender<ChannelMessage>,
}

impl Default for MockTransportInner {
    fn default() -> Self {
        Self {
            next_id: 1,
            auto_subscribe: true,
            channels: HashMap::new(),
            open_attempts: HashMap::new(),
            closed: Vec::new(),
            fail_next_open: None,
            fail_all_opens: None,
        }
    }
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockTransportInner::default())),
        }
    }

    /// Create a mock whose channels stay silent until told otherwise.
    pub fn manual() -> Self {
        let transport = Self::new();
        lock(&transport.inner).auto_subscribe = false;
        transport
    }

    /// Deliver a change event to every open channel of `topic` whose filter
    /// accepts it. Returns the number of channels reached.
    pub fn emit(&self, topic: &Topic, event: ChangeEvent) -> usize {
        let inner = lock(&self.inner);
        inner
            .channels
            .values()
            .filter(|ch| &ch.topic == topic && ch.filter.matches(event.kind))
            .filter(|ch| ch.sender.send(ChannelMessage::Change(event.clone())).is_ok())
            .count()
    }

    /// Report a status change on every open channel of `topic`.
    pub fn send_status(&self, topic: &Topic, status: ChannelStatus) -> usize {
        let inner = lock(&self.inner);
        inner
            .channels
            .values()
            .filter(|ch| &ch.topic == topic)
            .filter(|ch| ch.sender.send(ChannelMessage::Status(status.clone())).is_ok())
            .count()
    }

    /// Drop every channel of `topic` without a status, ending its stream.
    pub fn sever(&self, topic: &Topic) -> usize {
        let mut inner = lock(&self.inner);
        let before = inner.channels.len();
        inner.channels.retain(|_, ch| &ch.topic != topic);
        before - inner.channels.len()
    }

    /// Cause the next open() to fail with the given error.
    pub fn fail_next_open(&self, error: &str) {
        let mut inner = lock(&self.inner);
        inner.fail_next_open = Some(error.to_string());
    }

    /// Cause every open() to fail until [`stop_failing`](Self::stop_failing).
    pub fn fail_all_opens(&self, error: &str) {
        let mut inner = lock(&self.inner);
        inner.fail_all_opens = Some(error.to_string());
    }

    /// Let open() succeed again.
    pub fn stop_failing(&self) {
        let mut inner = lock(&self.inner);
        inner.fail_next_open = None;
        inner.fail_all_opens = None;
    }

    /// Number of open() calls for `topic`, failed ones included.
    pub fn open_attempts(&self, topic: &Topic) -> usize {
        let inner = lock(&self.inner);
        inner.open_attempts.get(topic).copied().unwrap_or(0)
    }

    /// Number of currently open channels for `topic`.
    pub fn open_channels(&self, topic: &Topic) -> usize {
        let inner = lock(&self.inner);
        inner.channels.values().filter(|ch| &ch.topic == topic).count()
    }

    /// Channels closed through close(), in order.
    pub fn closed_channels(&self) -> Vec<ChannelId> {
        let inner = lock(&self.inner);
        inner.closed.clone()
    }

    /// Clear all state (channels, counters, failures).
    pub fn reset(&self) {
        let mut inner = lock(&self.inner);
        let auto_subscribe = inner.auto_subscribe;
        *inner = MockTransportInner::default();
        inner.auto_subscribe = auto_subscribe;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, topic: &Topic, filter: EventFilter) -> Result<Channel, TransportError> {
        let mut inner = lock(&self.inner);
        *inner.open_attempts.entry(topic.clone()).or_insert(0) += 1;

        // Check for forced failure
        if let Some(error) = inner.fail_next_open.take() {
            return Err(TransportError::OpenFailed(error));
        }
        if let Some(error) = &inner.fail_all_opens {
            return Err(TransportError::OpenFailed(error.clone()));
        }

        let id = inner.next_id;
        inner.next_id += 1;

        let (sender, messages) = mpsc::unbounded_channel();
        if inner.auto_subscribe {
            let _ = sender.send(ChannelMessage::Status(ChannelStatus::Subscribed));
        }
        inner.channels.insert(
            id,
            MockChannel {
                topic: topic.clone(),
                filter,
                sender,
            },
        );
        Ok(Channel { id, messages })
    }

    async fn close(&self, channel: ChannelId) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        inner
            .channels
            .remove(&channel)
            .ok_or(TransportError::UnknownChannel(channel))?;
        inner.closed.push(channel);
        Ok(())
    }
}
