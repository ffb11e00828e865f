//! Subscription registry.
//!
//! One entry per active topic, shared by every listener of that topic. The
//! entry owns the topic's lifecycle machine, its diagnostics, its listener
//! set and the handles of the tasks serving it. The registry performs no
//! I/O itself: it returns lifecycle actions and teardown bundles for the
//! engine to carry out.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use sync_core::{Action, Event, Lifecycle, SubscriptionConfig, SubscriptionStatus};
use sync_types::{EventFilter, Topic};
use tokio::task::JoinHandle;

use crate::dispatcher::SyncNotification;
use crate::transport::ChannelId;

/// Callback receiving a topic's notifications.
pub type Listener = Arc<dyn Fn(&SyncNotification) + Send + Sync>;

/// Identifies one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct TopicSubscription {
    config: SubscriptionConfig,
    lifecycle: Lifecycle,
    status: SubscriptionStatus,
    listeners: Vec<(ListenerId, Listener)>,
    channel: Option<ChannelId>,
    pump: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
}

impl TopicSubscription {
    fn new(config: SubscriptionConfig) -> Self {
        Self {
            lifecycle: Lifecycle::new(config.retry.clone()),
            status: SubscriptionStatus::new(&config),
            config,
            listeners: Vec::new(),
            channel: None,
            pump: None,
            retry_timer: None,
        }
    }

    fn step(&mut self, event: Event, now_ms: u64) -> Vec<Action> {
        let (next, actions) = self.lifecycle.clone().on_event(event);
        self.lifecycle = next;

        let status = &mut self.status;
        status.state = self.lifecycle.state();
        status.retry_count = self.lifecycle.failures();
        status.permanently_failed = self.lifecycle.is_permanently_failed();
        status.last_error = self.lifecycle.last_error().map(str::to_string);
        if actions.contains(&Action::MarkConnected) {
            status.last_connected_ms = Some(now_ms);
        }
        actions
    }
}

/// Everything needed to tear a subscription down.
#[derive(Debug)]
pub struct Teardown {
    /// Topic that was removed.
    pub topic: Topic,
    /// Channel to close, if one was open.
    pub channel: Option<ChannelId>,
    pump: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
}

impl Teardown {
    /// Abort the channel pump and any pending reconnect timer.
    pub fn abort_tasks(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }
}

/// Result of removing a listener.
#[derive(Debug)]
pub enum Removal {
    /// The topic or listener was not registered.
    NotFound,
    /// Other listeners remain on the topic.
    Remaining(usize),
    /// That was the last listener; the subscription is gone.
    Removed(Teardown),
}

/// Active subscriptions keyed by topic.
#[derive(Default)]
pub struct SubscriptionRegistry {
    topics: HashMap<Topic, TopicSubscription>,
    next_listener: u64,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("topics", &self.topics.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, creating the topic's subscription if needed.
    ///
    /// Returns the listener id and whether a new subscription was created
    /// (and so needs a channel). Joining an existing subscription keeps its
    /// original config.
    pub fn add_listener(&mut self, config: SubscriptionConfig, listener: Listener) -> (ListenerId, bool) {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;

        let mut created = false;
        let entry = self.topics.entry(config.topic.clone()).or_insert_with(|| {
            created = true;
            TopicSubscription::new(config)
        });
        entry.listeners.push((id, listener));
        entry.status.listener_count = entry.listeners.len();
        (id, created)
    }

    /// Remove a listener. The last one out removes the subscription.
    pub fn remove_listener(&mut self, topic: &Topic, id: ListenerId, now_ms: u64) -> Removal {
        let Some(entry) = self.topics.get_mut(topic) else {
            return Removal::NotFound;
        };
        let before = entry.listeners.len();
        entry.listeners.retain(|(listener_id, _)| *listener_id != id);
        if entry.listeners.len() == before {
            return Removal::NotFound;
        }
        entry.status.listener_count = entry.listeners.len();
        if !entry.listeners.is_empty() {
            return Removal::Remaining(entry.listeners.len());
        }

        entry.step(Event::ListenersGone, now_ms);
        match self.topics.remove(topic) {
            Some(entry) => Removal::Removed(Teardown {
                topic: topic.clone(),
                channel: entry.channel,
                pump: entry.pump,
                retry_timer: entry.retry_timer,
            }),
            None => Removal::NotFound,
        }
    }

    /// Feed a lifecycle event to a topic's machine.
    ///
    /// With `Some(generation)` the event is dropped unless it comes from the
    /// current channel. Returns `None` if the event was dropped.
    pub fn apply(
        &mut self,
        topic: &Topic,
        generation: Option<u64>,
        event: Event,
        now_ms: u64,
    ) -> Option<Vec<Action>> {
        let entry = self.topics.get_mut(topic)?;
        if generation.is_some_and(|g| g != entry.status.generation) {
            return None;
        }
        Some(entry.step(event, now_ms))
    }

    /// Start a new channel generation, superseding the current channel.
    ///
    /// Returns the generation and the filter to open with.
    pub fn begin_open(&mut self, topic: &Topic) -> Option<(u64, EventFilter)> {
        let entry = self.topics.get_mut(topic)?;
        entry.status.generation += 1;
        Some((entry.status.generation, entry.config.filter))
    }

    /// Record the channel opened for `generation`.
    ///
    /// Returns `false` if the generation was superseded meanwhile; the caller
    /// then owns the channel and must close it.
    pub fn attach_channel(&mut self, topic: &Topic, generation: u64, channel: ChannelId) -> bool {
        match self.topics.get_mut(topic) {
            Some(entry) if entry.status.generation == generation => {
                entry.channel = Some(channel);
                true
            }
            _ => false,
        }
    }

    /// Detach the current channel and its pump.
    pub fn detach_channel(&mut self, topic: &Topic) -> (Option<ChannelId>, Option<JoinHandle<()>>) {
        match self.topics.get_mut(topic) {
            Some(entry) => (entry.channel.take(), entry.pump.take()),
            None => (None, None),
        }
    }

    /// Store the pump task for `generation`.
    ///
    /// Hands the handle back if the generation is no longer current.
    pub fn set_pump(
        &mut self,
        topic: &Topic,
        generation: u64,
        pump: JoinHandle<()>,
    ) -> Option<JoinHandle<()>> {
        match self.topics.get_mut(topic) {
            Some(entry) if entry.status.generation == generation => {
                entry.pump.replace(pump)
            }
            _ => Some(pump),
        }
    }

    /// Store the reconnect timer, returning the one it replaces.
    ///
    /// Hands the handle back if the topic is gone.
    pub fn set_retry_timer(&mut self, topic: &Topic, timer: JoinHandle<()>) -> Option<JoinHandle<()>> {
        match self.topics.get_mut(topic) {
            Some(entry) => entry.retry_timer.replace(timer),
            None => Some(timer),
        }
    }

    /// Take the pending reconnect timer.
    pub fn take_retry_timer(&mut self, topic: &Topic) -> Option<JoinHandle<()>> {
        self.topics.get_mut(topic)?.retry_timer.take()
    }

    /// Check whether `generation` is the topic's current channel generation.
    pub fn is_current(&self, topic: &Topic, generation: u64) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|entry| entry.status.generation == generation)
    }

    /// Config the topic's subscription was created with.
    pub fn config(&self, topic: &Topic) -> Option<&SubscriptionConfig> {
        self.topics.get(topic).map(|entry| &entry.config)
    }

    /// Snapshot of a topic's listeners.
    pub fn listeners(&self, topic: &Topic) -> Vec<Listener> {
        self.topics
            .get(topic)
            .map(|entry| entry.listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    /// Diagnostics for one topic.
    pub fn status(&self, topic: &Topic) -> Option<SubscriptionStatus> {
        self.topics.get(topic).map(|entry| entry.status.clone())
    }

    /// Diagnostics for every topic, highest priority first.
    pub fn statuses(&self) -> Vec<SubscriptionStatus> {
        let mut statuses: Vec<_> = self.topics.values().map(|e| e.status.clone()).collect();
        statuses.sort_by(|a, b| (a.priority, &a.topic).cmp(&(b.priority, &b.topic)));
        statuses
    }

    /// Active topics, highest priority first.
    pub fn topics_by_priority(&self) -> Vec<Topic> {
        self.statuses().into_iter().map(|status| status.topic).collect()
    }

    /// Lifecycle state of a topic.
    #[cfg(test)]
    pub fn state(&self, topic: &Topic) -> Option<sync_core::SubscriptionState> {
        self.topics.get(topic).map(|entry| entry.lifecycle.state())
    }

    /// Check whether a topic has an active subscription.
    pub fn contains(&self, topic: &Topic) -> bool {
        self.topics.contains_key(topic)
    }

    /// Number of active subscriptions.
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    /// Check if no subscription is active.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Remove every subscription.
    pub fn drain(&mut self) -> Vec<Teardown> {
        self.topics
            .drain()
            .map(|(topic, entry)| Teardown {
                topic,
                channel: entry.channel,
                pump: entry.pump,
                retry_timer: entry.retry_timer,
            })
            .collect()
    }
}
