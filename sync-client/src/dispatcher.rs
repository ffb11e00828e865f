//! Listener notification dispatcher.
//!
//! A single task owns a per-topic [`Debouncer`]. Change notifications are
//! coalesced: within one window only the last change on a topic reaches
//! listeners. Rollbacks and subscription failures skip the window but first
//! flush the topic's pending change, so a topic's listeners always see
//! notifications in arrival order.
//!
//! Listeners run on the dispatcher task with no engine lock held.

use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sync_core::Debouncer;
use sync_types::{ChangeEvent, EntityId, Topic, UpdateId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::locks::lock;
use crate::registry::SubscriptionRegistry;

/// Timer wakeups may land just short of a deadline at millisecond precision.
pub(crate) const TIMER_SLACK: Duration = Duration::from_millis(1);

/// What listeners receive.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotification {
    /// An entity changed, remotely or speculatively.
    Change(ChangeEvent),
    /// A speculative write was reverted.
    RolledBack {
        /// Topic of the entity.
        topic: Topic,
        /// Reverted entity.
        entity_id: EntityId,
        /// Update that failed.
        update_id: UpdateId,
        /// Value restored in the cache (`None`: entity removed).
        restored: Option<Value>,
        /// Why the write was reverted.
        reason: String,
    },
    /// The topic's retry budget is exhausted; no further reconnects.
    SubscriptionFailed {
        /// Failed topic.
        topic: Topic,
        /// Consecutive failed attempts.
        attempts: u32,
        /// Last channel error.
        error: String,
    },
}

impl SyncNotification {
    /// Topic the notification belongs to.
    pub fn topic(&self) -> &Topic {
        match self {
            Self::Change(event) => &event.topic,
            Self::RolledBack { topic, .. } | Self::SubscriptionFailed { topic, .. } => topic,
        }
    }
}

enum Command {
    Change(ChangeEvent),
    Immediate(SyncNotification),
    Clear,
}

/// Handle to the dispatcher task.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Change(event) => write!(f, "Change({})", event.topic),
            Self::Immediate(n) => write!(f, "Immediate({})", n.topic()),
            Self::Clear => write!(f, "Clear"),
        }
    }
}

impl Dispatcher {
    /// Spawn the dispatcher task on `runtime`.
    pub fn spawn(
        runtime: &tokio::runtime::Handle,
        window: Duration,
        registry: Arc<Mutex<SubscriptionRegistry>>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = runtime.spawn(run(rx, Debouncer::new(window), registry));
        (Self { tx }, task)
    }

    /// Queue a change notification, debounced per topic.
    pub fn notify(&self, event: ChangeEvent) {
        let _ = self.tx.send(Command::Change(event));
    }

    /// Deliver a notification without waiting for the window.
    pub fn notify_now(&self, notification: SyncNotification) {
        let _ = self.tx.send(Command::Immediate(notification));
    }

    /// Drop every pending change notification.
    pub fn clear(&self) {
        let _ = self.tx.send(Command::Clear);
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<Command>,
    mut debouncer: Debouncer<Topic, ChangeEvent>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
) {
    loop {
        let next = debouncer.next_deadline().map(Instant::from_std);
        let wake = next.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Change(event)) => {
                    let now = Instant::now().into_std();
                    debouncer.push(event.topic.clone(), event, now);
                }
                Some(Command::Immediate(notification)) => {
                    if let Some(pending) = debouncer.flush(notification.topic()) {
                        deliver(&registry, SyncNotification::Change(pending));
                    }
                    deliver(&registry, notification);
                }
                Some(Command::Clear) => debouncer.clear(),
                None => break,
            },
            _ = sleep_until(wake), if next.is_some() => {
                let now = (Instant::now() + TIMER_SLACK).into_std();
                for (_, event) in debouncer.due(now) {
                    deliver(&registry, SyncNotification::Change(event));
                }
            }
        }
    }
    tracing::debug!("dispatcher stopped");
}

fn deliver(registry: &Mutex<SubscriptionRegistry>, notification: SyncNotification) {
    let listeners = lock(registry).listeners(notification.topic());
    for listener in listeners {
        listener(&notification);
    }
}
