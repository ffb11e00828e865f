//! Optimistic update ledger for rtsync.
//!
//! This module tracks speculative writes that have been applied locally but
//! not yet confirmed by the server-of-record. Each entry carries the value to
//! restore if the write fails, and a deadline after which it is rolled back
//! automatically.
//!
//! Updates flow through the ledger in this order:
//! 1. `register()` - record the update and arm its deadline
//! 2. one of:
//!    - `confirm()` - the caller's confirmation succeeded
//!    - `match_event()` - a remote event matched the update
//!    - `take()` - the confirmation failed; caller rolls back
//!    - `expire()` - the deadline passed; caller rolls back
//!
//! Every resolution removes the entry and disarms its deadline, so a late or
//! duplicate resolution for the same id finds nothing and is a no-op.
//!
//! Remote events are matched heuristically: same topic, same entity id, same
//! kind, and a commit timestamp within `match_window` of the update's creation.
//! Unrelated writes to the same entity inside the window are indistinguishable
//! from the confirmation.

use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use sync_types::{ChangeEvent, EntityId, EventKind, Origin, Topic, UpdateId};

use crate::scheduler::DeadlineQueue;

/// Default time a speculative write may stay unconfirmed.
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(5);

/// Default tolerance between an update's creation and a matching event.
pub const DEFAULT_MATCH_WINDOW: Duration = Duration::from_secs(10);

/// A speculative mutation awaiting confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    /// Unique identifier; also keys the deadline.
    pub update_id: UpdateId,
    /// Collection the entity lives in.
    pub topic: Topic,
    /// Target entity.
    pub entity_id: EntityId,
    /// Operation kind.
    pub kind: EventKind,
    /// Proposed value (`None` for deletes).
    pub value: Option<Value>,
    /// Value to restore on failure (`None` removes the entity).
    pub rollback: Option<Value>,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    /// Set on the copy returned by a successful confirmation.
    pub confirmed: bool,
}

impl PendingUpdate {
    /// Create an unconfirmed update with a fresh id.
    pub fn new(
        topic: Topic,
        entity_id: EntityId,
        kind: EventKind,
        value: Option<Value>,
        rollback: Option<Value>,
        created_at_ms: u64,
    ) -> Self {
        Self {
            update_id: UpdateId::new(),
            topic,
            entity_id,
            kind,
            value,
            rollback,
            created_at_ms,
            confirmed: false,
        }
    }

    fn key(&self) -> LedgerKey {
        LedgerKey {
            topic: self.topic.clone(),
            entity_id: self.entity_id.clone(),
            kind: self.kind,
        }
    }
}

/// At most one unresolved update exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LedgerKey {
    topic: Topic,
    entity_id: EntityId,
    kind: EventKind,
}

/// Ledger of pending optimistic updates.
#[derive(Debug)]
pub struct OptimisticLedger {
    timeout: Duration,
    match_window_ms: u64,
    entries: HashMap<LedgerKey, PendingUpdate>,
    by_id: HashMap<UpdateId, LedgerKey>,
    timers: DeadlineQueue<UpdateId>,
}

impl OptimisticLedger {
    /// Create a ledger with the given pending timeout and match window.
    pub fn new(timeout: Duration, match_window: Duration) -> Self {
        Self {
            timeout,
            match_window_ms: match_window.as_millis() as u64,
            entries: HashMap::new(),
            by_id: HashMap::new(),
            timers: DeadlineQueue::new(),
        }
    }

    /// Record an update and arm its deadline at `now + timeout`.
    ///
    /// If an unresolved update exists for the same topic, entity and kind it
    /// is superseded: its deadline is disarmed and it is returned so the
    /// caller can resolve its waiter. The new entry's rollback value wins.
    pub fn register(&mut self, update: PendingUpdate, now: Instant) -> Option<PendingUpdate> {
        let key = update.key();
        let update_id = update.update_id;

        let superseded = self.entries.insert(key.clone(), update);
        if let Some(old) = &superseded {
            self.by_id.remove(&old.update_id);
            self.timers.cancel(&old.update_id);
        }

        self.by_id.insert(update_id, key);
        self.timers.schedule(update_id, now + self.timeout);
        superseded
    }

    /// Remove an update by id, disarming its deadline.
    ///
    /// Returns `None` if it was already resolved or superseded.
    pub fn take(&mut self, update_id: &UpdateId) -> Option<PendingUpdate> {
        let key = self.by_id.remove(update_id)?;
        self.timers.cancel(update_id);
        self.entries.remove(&key)
    }

    /// Resolve an update as confirmed.
    pub fn confirm(&mut self, update_id: &UpdateId) -> Option<PendingUpdate> {
        self.take(update_id).map(|mut update| {
            update.confirmed = true;
            update
        })
    }

    /// Find and confirm the pending update a remote event corresponds to.
    ///
    /// Speculative events and events without an entity id never match.
    pub fn match_event(&mut self, event: &ChangeEvent) -> Option<PendingUpdate> {
        if event.origin != Origin::Remote {
            return None;
        }
        let key = LedgerKey {
            topic: event.topic.clone(),
            entity_id: event.entity_id()?,
            kind: event.kind,
        };
        let candidate = self.entries.get(&key)?;
        if candidate.created_at_ms.abs_diff(event.timestamp_ms) > self.match_window_ms {
            return None;
        }
        let update_id = candidate.update_id;
        self.confirm(&update_id)
    }

    /// Remove and return every update whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<PendingUpdate> {
        self.timers
            .pop_expired(now)
            .into_iter()
            .filter_map(|update_id| {
                let key = self.by_id.remove(&update_id)?;
                self.entries.remove(&key)
            })
            .collect()
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Check whether an update is still unresolved.
    pub fn contains(&self, update_id: &UpdateId) -> bool {
        self.by_id.contains_key(update_id)
    }

    /// Number of unresolved updates.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of armed deadlines. Always equals `len()`.
    pub fn live_timers(&self) -> usize {
        self.timers.len()
    }

    /// Drop every pending update, returning them for the caller to resolve.
    pub fn clear(&mut self) -> Vec<PendingUpdate> {
        self.timers.clear();
        self.by_id.clear();
        self.entries.drain().map(|(_, update)| update).collect()
    }
}

impl Default for OptimisticLedger {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_TIMEOUT, DEFAULT_MATCH_WINDOW)
    }
}
