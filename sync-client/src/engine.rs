//! SyncEngine - the main interface for rtsync.
//!
//! This module provides [`SyncEngine`], the primary API for applications to
//! keep a local cache in sync with a server-of-record.
//!
//! # Architecture
//!
//! SyncEngine drives pure state machines (from sync-core) and interprets
//! their actions to perform the actual I/O through the [`Transport`] and
//! [`Cache`] collaborators.
//!
//! ```text
//! Transport ──► channel pump ──► ledger match ──► CacheSynchronizer ──► Dispatcher ──► listeners
//!                    │                                  ▲
//!              sync-core (lifecycle,          perform_optimistic_update
//!              backoff, ledger, health)
//! ```
//!
//! Every topic subscription owns one channel pump task and at most one
//! reconnect timer task. One task runs the ledger deadlines, one the
//! dispatcher, one the health monitor. Shared state sits behind short-lived
//! mutexes that are never held across an `.await` or a listener call.
//!
//! # Example
//!
//! ```ignore
//! use sync_client::{EngineConfig, InMemoryCache, MockTransport, SpeculativeWrite, SyncEngine};
//!
//! let engine = SyncEngine::new(EngineConfig::default(), MockTransport::new(), InMemoryCache::new())?;
//! let handle = engine.subscribe(engine.config().subscription("orders"), |n| println!("{:?}", n))?;
//!
//! let pending = engine.perform_optimistic_update(
//!     SpeculativeWrite::update("orders", "42", json!({"status": "shipped"}), json!({"status": "pending"})),
//!     Some(confirm_with(async { save_order().await })),
//! )?;
//! let outcome = pending.outcome().await?;
//! handle.unsubscribe();
//! ```

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use sync_core::{
    Action, ConnectionHealth, Event, HealthSnapshot, HealthVerdict, OptimisticLedger,
    PendingUpdate, SubscriptionConfig, SubscriptionStatus,
};
use sync_types::{now_ms, ChangeEvent, EventFilter, EventKind, Origin, Topic, UpdateId};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::cache::Cache;
use crate::config::EngineConfig;
use crate::dispatcher::{Dispatcher, SyncNotification, TIMER_SLACK};
use crate::error::EngineError;
use crate::locks::lock;
use crate::monitor::spawn_health_monitor;
use crate::optimistic::{
    ConfirmError, ConfirmFuture, OutcomeSender, SpeculativeWrite, UpdateHandle, UpdateOutcome,
};
use crate::registry::{ListenerId, Removal, SubscriptionRegistry, Teardown};
use crate::synchronizer::CacheSynchronizer;
use crate::transport::{ChannelId, ChannelMessage, ChannelStatus, Transport};

/// Diagnostics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    /// Active subscriptions, highest priority first.
    pub subscriptions: Vec<SubscriptionStatus>,
    /// Unresolved speculative writes.
    pub pending_updates: usize,
    /// Armed pending-update deadlines.
    pub live_timers: usize,
    /// Connection health aggregate.
    pub health: HealthSnapshot,
    /// Cache validity as reported by the cache.
    pub cache_valid: bool,
    /// Set once the engine was shut down.
    pub shut_down: bool,
}

/// Real-time synchronization engine.
///
/// Construct one per application at the composition root and pass it by
/// reference. All methods return immediately; outcomes arrive through
/// listeners and [`UpdateHandle`]s.
pub struct SyncEngine<T: Transport, C: Cache> {
    shared: Arc<Shared<T, C>>,
}

struct Shared<T, C> {
    config: EngineConfig,
    runtime: Handle,
    transport: T,
    synchronizer: CacheSynchronizer<C>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    pending: Mutex<PendingState>,
    ledger_wake: Notify,
    health: Mutex<ConnectionHealth>,
    dispatcher: Dispatcher,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

struct PendingState {
    ledger: OptimisticLedger,
    waiters: HashMap<UpdateId, OutcomeSender>,
}

impl<T: Transport, C: Cache> SyncEngine<T, C> {
    /// Create an engine and start its background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: EngineConfig, transport: T, cache: C) -> Result<Self, EngineError> {
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let registry = Arc::new(Mutex::new(SubscriptionRegistry::new()));
        let (dispatcher, dispatch_task) =
            Dispatcher::spawn(&runtime, config.dispatcher.debounce(), Arc::clone(&registry));

        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingState {
                ledger: OptimisticLedger::new(
                    config.ledger.timeout(),
                    config.ledger.match_window(),
                ),
                waiters: HashMap::new(),
            }),
            health: Mutex::new(ConnectionHealth::new(config.health.failure_threshold)),
            ledger_wake: Notify::new(),
            synchronizer: CacheSynchronizer::new(cache),
            tasks: Mutex::new(vec![dispatch_task]),
            closed: AtomicBool::new(false),
            runtime,
            transport,
            registry,
            dispatcher,
            config,
        });

        let ledger_task = shared.runtime.spawn(Arc::clone(&shared).run_ledger_timer());

        let weak = Arc::downgrade(&shared);
        let health_task = spawn_health_monitor(
            &shared.runtime,
            shared.config.health.clone(),
            move || weak.upgrade().map(|shared| shared.run_health_check()),
        );

        lock(&shared.tasks).extend([ledger_task, health_task]);
        info!("sync engine started");
        Ok(Self { shared })
    }

    /// Register a listener for `config.topic`.
    ///
    /// The first listener of a topic opens its channel; later listeners
    /// join the existing subscription (and its original config). The
    /// subscription lives until the last [`SubscriptionHandle`] is dropped
    /// or unsubscribed.
    pub fn subscribe<F>(
        &self,
        config: SubscriptionConfig,
        listener: F,
    ) -> Result<SubscriptionHandle, EngineError>
    where
        F: Fn(&SyncNotification) + Send + Sync + 'static,
    {
        self.shared.ensure_open()?;
        if config.topic.as_str().is_empty() {
            return Err(EngineError::InvalidRequest("empty topic".into()));
        }

        let topic = config.topic.clone();
        let (listener_id, created) = lock(&self.shared.registry).add_listener(config, Arc::new(listener));
        if created {
            info!(topic = %topic, "subscribing");
            self.shared.open_channel(&topic);
        } else {
            debug!(topic = %topic, "listener joined existing subscription");
        }

        let weak = Arc::downgrade(&self.shared);
        let engine: Weak<dyn Unsubscribe> = weak;
        Ok(SubscriptionHandle {
            topic,
            listener_id,
            engine: Some(engine),
        })
    }

    /// Apply a write speculatively and track it until it resolves.
    ///
    /// The cache and listeners see the new value before this returns. With
    /// a `confirm` future the write resolves with its result; without one it
    /// waits for a matching change event. Either way it rolls back when the
    /// pending timeout elapses first.
    pub fn perform_optimistic_update(
        &self,
        write: SpeculativeWrite,
        confirm: Option<ConfirmFuture>,
    ) -> Result<UpdateHandle, EngineError> {
        let shared = &self.shared;
        shared.ensure_open()?;
        write.validate()?;

        let SpeculativeWrite {
            topic,
            entity_id,
            kind,
            value,
            rollback,
        } = write;
        let update = PendingUpdate::new(
            topic.clone(),
            entity_id.clone(),
            kind,
            value.clone(),
            rollback.clone(),
            now_ms(),
        );
        let update_id = update.update_id;
        let (handle, waiter) = UpdateHandle::new(update_id);

        let superseded = {
            let mut guard = lock(&shared.pending);
            let state = &mut *guard;
            let superseded = state.ledger.register(update, clock());
            state.waiters.insert(update_id, waiter);
            superseded.and_then(|old| state.waiters.remove(&old.update_id).map(|w| (old.update_id, w)))
        };
        shared.ledger_wake.notify_one();

        if let Some((old_id, old_waiter)) = superseded {
            debug!(topic = %topic, entity_id = %entity_id, update_id = %old_id, "speculative write superseded");
            let _ = old_waiter.send(Ok(UpdateOutcome::Superseded));
        }

        shared
            .synchronizer
            .apply(kind, &topic, &entity_id, value.as_ref());
        shared.dispatcher.notify(ChangeEvent::speculative(
            kind,
            topic.clone(),
            &entity_id,
            rollback,
            value,
        ));
        debug!(
            topic = %topic,
            entity_id = %entity_id,
            update_id = %update_id,
            kind = kind.as_str(),
            "speculative write applied"
        );

        if let Some(confirm) = confirm {
            let weak = Arc::downgrade(shared);
            shared.runtime.spawn(async move {
                let result = confirm.await;
                if let Some(shared) = weak.upgrade() {
                    shared.resolve_confirmation(update_id, result);
                }
            });
        }

        Ok(handle)
    }

    /// Diagnostics snapshot.
    pub fn status(&self) -> EngineStatus {
        let shared = &self.shared;
        let subscriptions = lock(&shared.registry).statuses();
        let (pending_updates, live_timers) = {
            let state = lock(&shared.pending);
            (state.ledger.len(), state.ledger.live_timers())
        };
        EngineStatus {
            subscriptions,
            pending_updates,
            live_timers,
            health: lock(&shared.health).snapshot(),
            cache_valid: shared.synchronizer.cache().is_valid(),
            shut_down: shared.closed.load(Ordering::SeqCst),
        }
    }

    /// Diagnostics for one topic.
    pub fn subscription_status(&self, topic: &Topic) -> Option<SubscriptionStatus> {
        lock(&self.shared.registry).status(topic)
    }

    /// Check whether `topic` has an active subscription.
    pub fn is_subscribed(&self, topic: &Topic) -> bool {
        lock(&self.shared.registry).contains(topic)
    }

    /// Number of active topic subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        lock(&self.shared.registry).len()
    }

    /// Clear the cache and every pending write, then re-subscribe everything.
    ///
    /// Unresolved writes fail with [`EngineError::Reset`]; their speculative
    /// values are gone with the rest of the cache.
    pub fn force_refresh(&self) -> Result<(), EngineError> {
        let shared = &self.shared;
        shared.ensure_open()?;
        info!("force refresh: clearing cache and pending writes");

        for waiter in shared.drain_pending() {
            let _ = waiter.send(Err(EngineError::Reset));
        }
        shared.dispatcher.clear();
        shared.synchronizer.clear();
        lock(&shared.health).reset();

        let topics = lock(&shared.registry).topics_by_priority();
        for topic in &topics {
            shared.synchronizer.cache().invalidate_derived(topic);
        }
        shared.reconnect_all();
        Ok(())
    }

    /// Run a health check now instead of waiting for the interval.
    pub fn check_health(&self) -> HealthVerdict {
        self.shared.run_health_check()
    }

    /// Stop background tasks, close every channel and fail pending writes
    /// with [`EngineError::Shutdown`].
    ///
    /// Returns the first channel close error, after trying them all.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let mut first_error = None;
        for teardown in self.shared.stop() {
            if let Some(channel) = teardown.channel {
                if let Err(e) = self.shared.transport.close(channel).await {
                    error!(topic = %teardown.topic, channel, error = %e, "failed to close channel");
                    first_error.get_or_insert(e);
                }
            }
        }
        info!("sync engine shut down");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// The cache kept in sync.
    pub fn cache(&self) -> &C {
        self.shared.synchronizer.cache()
    }

    /// The transport (for testing).
    pub fn transport(&self) -> &T {
        &self.shared.transport
    }
}

impl<T: Transport, C: Cache> Drop for SyncEngine<T, C> {
    fn drop(&mut self) {
        for teardown in self.shared.stop() {
            if let Some(channel) = teardown.channel {
                self.shared.spawn_close(teardown.topic, channel);
            }
        }
    }
}

impl<T: Transport, C: Cache> fmt::Debug for SyncEngine<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("registry", &*lock(&self.shared.registry))
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Keeps one listener registered.
///
/// Dropping the handle unsubscribes the listener; when it was the topic's
/// last one the channel is torn down at once.
#[must_use = "dropping the handle unsubscribes the listener"]
pub struct SubscriptionHandle {
    topic: Topic,
    listener_id: ListenerId,
    engine: Option<Weak<dyn Unsubscribe>>,
}

impl SubscriptionHandle {
    /// Topic this listener is registered on.
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Unsubscribe the listener.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(engine) = self.engine.take().and_then(|weak| weak.upgrade()) {
            engine.unsubscribe(&self.topic, self.listener_id);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("topic", &self.topic)
            .field("listener_id", &self.listener_id)
            .finish()
    }
}

trait Unsubscribe: Send + Sync {
    fn unsubscribe(self: Arc<Self>, topic: &Topic, listener_id: ListenerId);
}

impl<T: Transport, C: Cache> Unsubscribe for Shared<T, C> {
    fn unsubscribe(self: Arc<Self>, topic: &Topic, listener_id: ListenerId) {
        let removal = lock(&self.registry).remove_listener(topic, listener_id, now_ms());
        match removal {
            Removal::Removed(teardown) => {
                info!(topic = %topic, "last listener left, tearing down subscription");
                self.teardown(teardown);
            }
            Removal::Remaining(listeners) => {
                debug!(topic = %topic, listeners, "listener removed");
            }
            Removal::NotFound => {}
        }
    }
}

/// Monotonic now, following Tokio's clock so paused-time tests line up.
fn clock() -> std::time::Instant {
    Instant::now().into_std()
}

impl<T: Transport, C: Cache> Shared<T, C> {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(EngineError::Shutdown)
        } else {
            Ok(())
        }
    }

    // ===== Channels and lifecycle =====

    fn open_channel(self: &Arc<Self>, topic: &Topic) {
        let opened = lock(&self.registry).begin_open(topic);
        let Some((generation, filter)) = opened else {
            return;
        };
        debug!(topic = %topic, generation, "opening channel");

        let shared = Arc::clone(self);
        let task_topic = topic.clone();
        let pump = self
            .runtime
            .spawn(async move { shared.run_channel(task_topic, generation, filter).await });

        let previous = lock(&self.registry).set_pump(topic, generation, pump);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn run_channel(self: Arc<Self>, topic: Topic, generation: u64, filter: EventFilter) {
        let channel = match self.transport.open(&topic, filter).await {
            Ok(channel) => channel,
            Err(e) => {
                self.handle_lifecycle(
                    &topic,
                    Some(generation),
                    Event::ChannelFailed {
                        error: e.to_string(),
                    },
                );
                return;
            }
        };

        let attached = lock(&self.registry).attach_channel(&topic, generation, channel.id);
        if !attached {
            debug!(topic = %topic, generation, "channel superseded while opening");
            if let Err(e) = self.transport.close(channel.id).await {
                error!(topic = %topic, channel = channel.id, error = %e, "failed to close channel");
            }
            return;
        }
        self.handle_lifecycle(&topic, Some(generation), Event::ChannelOpened);

        let mut messages = channel.messages;
        while let Some(message) = messages.recv().await {
            let current = lock(&self.registry).is_current(&topic, generation);
            if !current {
                return;
            }
            match message {
                ChannelMessage::Status(status) => {
                    let event = match status {
                        ChannelStatus::Subscribed => Event::Subscribed,
                        ChannelStatus::Error(error) => Event::ChannelFailed { error },
                        ChannelStatus::TimedOut => Event::ChannelFailed {
                            error: "channel timed out".into(),
                        },
                        ChannelStatus::Closed => Event::ChannelClosed,
                    };
                    self.handle_lifecycle(&topic, Some(generation), event);
                }
                ChannelMessage::Change(event) => self.ingest(&topic, event),
            }
        }

        self.handle_lifecycle(
            &topic,
            Some(generation),
            Event::ChannelFailed {
                error: "channel stream ended".into(),
            },
        );
    }

    fn handle_lifecycle(self: &Arc<Self>, topic: &Topic, generation: Option<u64>, event: Event) {
        debug!(topic = %topic, ?event, "lifecycle event");
        let actions = lock(&self.registry).apply(topic, generation, event, now_ms());
        for action in actions.unwrap_or_default() {
            self.execute(topic, action);
        }
    }

    fn execute(self: &Arc<Self>, topic: &Topic, action: Action) {
        match action {
            Action::OpenChannel => self.open_channel(topic),
            Action::CloseChannel => self.close_channel(topic),
            Action::StartReconnectTimer { delay, attempt } => {
                self.arm_reconnect(topic, delay, attempt)
            }
            Action::CancelReconnect => {
                let timer = lock(&self.registry).take_retry_timer(topic);
                if let Some(timer) = timer {
                    timer.abort();
                }
            }
            Action::MarkConnected => {
                lock(&self.health).record_connected();
                info!(topic = %topic, "subscription connected");
            }
            Action::RecordFailure { error } => {
                lock(&self.health).record_failure();
                warn!(topic = %topic, error = %error, "subscription channel failed");
            }
            Action::ReportPermanentFailure { failures, error } => {
                warn!(
                    topic = %topic,
                    failures,
                    error = %error,
                    "subscription failed permanently, retry budget exhausted"
                );
                self.dispatcher
                    .notify_now(SyncNotification::SubscriptionFailed {
                        topic: topic.clone(),
                        attempts: failures,
                        error,
                    });
            }
        }
    }

    fn close_channel(self: &Arc<Self>, topic: &Topic) {
        let (channel, pump) = lock(&self.registry).detach_channel(topic);
        if let Some(pump) = pump {
            pump.abort();
        }
        if let Some(channel) = channel {
            self.spawn_close(topic.clone(), channel);
        }
    }

    fn spawn_close(self: &Arc<Self>, topic: Topic, channel: ChannelId) {
        let shared = Arc::clone(self);
        self.runtime.spawn(async move {
            if let Err(e) = shared.transport.close(channel).await {
                error!(topic = %topic, channel, error = %e, "failed to close channel");
            }
        });
    }

    fn arm_reconnect(self: &Arc<Self>, topic: &Topic, delay: Duration, attempt: u32) {
        debug!(
            topic = %topic,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        let shared = Arc::clone(self);
        let task_topic = topic.clone();
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = lock(&shared.registry).take_retry_timer(&task_topic);
            shared.handle_lifecycle(&task_topic, None, Event::ReconnectTimer);
        });

        let previous = lock(&self.registry).set_retry_timer(topic, timer);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn teardown(self: &Arc<Self>, mut teardown: Teardown) {
        teardown.abort_tasks();
        if let Some(channel) = teardown.channel {
            self.spawn_close(teardown.topic, channel);
        }
    }

    fn reconnect_all(self: &Arc<Self>) {
        let topics = lock(&self.registry).topics_by_priority();
        for topic in topics {
            self.handle_lifecycle(&topic, None, Event::ForceReconnect);
        }
    }

    fn run_health_check(self: &Arc<Self>) -> HealthVerdict {
        let verdict = lock(&self.health).check(now_ms());
        if let HealthVerdict::ReconnectAll { .. } = verdict {
            self.reconnect_all();
        }
        verdict
    }

    // ===== Change events =====

    fn ingest(self: &Arc<Self>, topic: &Topic, mut event: ChangeEvent) {
        if &event.topic != topic {
            warn!(topic = %topic, event_topic = %event.topic, "dropping event delivered on another topic");
            return;
        }
        let entity_id = match event.validate() {
            Ok(id) => id,
            Err(e) => {
                warn!(topic = %topic, error = %e, "dropping malformed change event");
                return;
            }
        };
        if self.synchronizer.is_stale(topic, &entity_id, event.timestamp_ms) {
            debug!(
                topic = %topic,
                entity_id = %entity_id,
                timestamp_ms = event.timestamp_ms,
                "dropping change older than the cached entity"
            );
            return;
        }
        event.origin = Origin::Remote;

        let confirmed = {
            let mut guard = lock(&self.pending);
            let state = &mut *guard;
            state
                .ledger
                .match_event(&event)
                .map(|update| (update.update_id, state.waiters.remove(&update.update_id)))
        };
        if let Some((update_id, waiter)) = confirmed {
            debug!(
                topic = %topic,
                entity_id = %entity_id,
                update_id = %update_id,
                "speculative write confirmed by change event"
            );
            if let Some(waiter) = waiter {
                let _ = waiter.send(Ok(UpdateOutcome::Confirmed {
                    value: event.new.clone(),
                }));
            }
        }

        match self.synchronizer.apply_versioned(
            event.kind,
            topic,
            &entity_id,
            event.new.as_ref(),
            event.timestamp_ms,
        ) {
            Some(true) => {}
            Some(false) => debug!(topic = %topic, entity_id = %entity_id, "change already applied"),
            None => {
                debug!(topic = %topic, entity_id = %entity_id, "change superseded while applying");
                return;
            }
        }

        // Filters narrow what listeners see, not what the cache holds
        let accepted = lock(&self.registry)
            .config(topic)
            .is_some_and(|config| config.accepts(&event));
        if accepted {
            self.dispatcher.notify(event);
        } else {
            debug!(topic = %topic, entity_id = %entity_id, "event filtered out");
        }
    }

    // ===== Pending writes =====

    fn resolve_confirmation(&self, update_id: UpdateId, result: Result<Value, ConfirmError>) {
        let taken = {
            let mut guard = lock(&self.pending);
            let state = &mut *guard;
            let update = match &result {
                Ok(_) => state.ledger.confirm(&update_id),
                Err(_) => state.ledger.take(&update_id),
            };
            update.map(|update| (update, state.waiters.remove(&update_id)))
        };
        let Some((update, waiter)) = taken else {
            debug!(update_id = %update_id, "late confirmation ignored");
            return;
        };

        match result {
            Ok(value) => {
                let (old, new) = match update.kind {
                    EventKind::Delete => (update.rollback.clone(), None),
                    EventKind::Create | EventKind::Update => (None, Some(value.clone())),
                };
                self.synchronizer.apply(
                    update.kind,
                    &update.topic,
                    &update.entity_id,
                    new.as_ref(),
                );
                self.dispatcher.notify(ChangeEvent::for_entity(
                    update.kind,
                    update.topic.clone(),
                    &update.entity_id,
                    old,
                    new,
                    Origin::Remote,
                ));
                debug!(
                    topic = %update.topic,
                    entity_id = %update.entity_id,
                    update_id = %update_id,
                    "speculative write confirmed"
                );
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(UpdateOutcome::Confirmed { value: Some(value) }));
                }
            }
            Err(e) => {
                let reason = e.to_string();
                self.roll_back(&update, &reason);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(EngineError::ConfirmationFailed { update_id, reason }));
                }
            }
        }
    }

    async fn run_ledger_timer(self: Arc<Self>) {
        loop {
            let next = lock(&self.pending).ledger.next_deadline();
            let wake = self.ledger_wake.notified();
            match next {
                Some(deadline) => {
                    tokio::select! {
                        _ = sleep_until(Instant::from_std(deadline)) => {}
                        _ = wake => {}
                    }
                }
                None => wake.await,
            }
            self.expire_pending();
        }
    }

    fn expire_pending(&self) {
        let now = (Instant::now() + TIMER_SLACK).into_std();
        let expired: Vec<_> = {
            let mut guard = lock(&self.pending);
            let state = &mut *guard;
            state
                .ledger
                .expire(now)
                .into_iter()
                .map(|update| {
                    let waiter = state.waiters.remove(&update.update_id);
                    (update, waiter)
                })
                .collect()
        };

        let timeout = self.config.ledger.timeout();
        for (update, waiter) in expired {
            self.roll_back(&update, &format!("not confirmed within {:?}", timeout));
            if let Some(waiter) = waiter {
                let _ = waiter.send(Err(EngineError::TimedOut {
                    update_id: update.update_id,
                    timeout,
                }));
            }
        }
    }

    fn roll_back(&self, update: &PendingUpdate, reason: &str) {
        self.synchronizer
            .restore(&update.topic, &update.entity_id, update.rollback.as_ref());
        warn!(
            topic = %update.topic,
            entity_id = %update.entity_id,
            update_id = %update.update_id,
            reason,
            "speculative write rolled back"
        );
        self.dispatcher.notify_now(SyncNotification::RolledBack {
            topic: update.topic.clone(),
            entity_id: update.entity_id.clone(),
            update_id: update.update_id,
            restored: update.rollback.clone(),
            reason: reason.to_string(),
        });
    }

    fn drain_pending(&self) -> Vec<OutcomeSender> {
        let mut state = lock(&self.pending);
        state.ledger.clear();
        state.waiters.drain().map(|(_, waiter)| waiter).collect()
    }

    // ===== Shutdown =====

    fn stop(&self) -> Vec<Teardown> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        let mut teardowns = lock(&self.registry).drain();
        for teardown in &mut teardowns {
            teardown.abort_tasks();
        }
        for waiter in self.drain_pending() {
            let _ = waiter.send(Err(EngineError::Shutdown));
        }
        teardowns
    }
}
