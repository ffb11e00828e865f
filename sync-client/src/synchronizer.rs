//! Translates events into cache mutations.
//!
//! Creates and updates upsert, deletes remove. Every mutation that changes
//! the cache invalidates derived queries over the topic's collection.
//! Applying the same operation twice leaves the cache as the first
//! application did and signals nothing the second time.
//!
//! Remote events are versioned by their commit timestamp. The last timestamp
//! applied to an entity is kept, deletes included, and anything older is
//! stale.

use dashmap::DashMap;
use serde_json::Value;
use sync_types::{ChangeEvent, EntityId, EventKind, SyncError, Topic};

use crate::cache::Cache;

/// Sole writer to the cache.
#[derive(Debug)]
pub struct CacheSynchronizer<C> {
    cache: C,
    versions: DashMap<(Topic, EntityId), u64>,
}

impl<C: Cache> CacheSynchronizer<C> {
    /// Wrap a cache.
    pub fn new(cache: C) -> Self {
        Self {
            cache,
            versions: DashMap::new(),
        }
    }

    /// Apply one operation. Returns `true` if the cache changed.
    ///
    /// A create or update without a value changes nothing.
    pub fn apply(&self, kind: EventKind, topic: &Topic, id: &EntityId, value: Option<&Value>) -> bool {
        let changed = match kind {
            EventKind::Create | EventKind::Update => match value {
                Some(value) => self.write(topic, id, value),
                None => false,
            },
            EventKind::Delete => self.cache.remove(topic, id).is_some(),
        };
        if changed {
            self.cache.invalidate_derived(topic);
        }
        changed
    }

    /// Whether a remote change committed at `timestamp_ms` predates the last
    /// one applied to this entity.
    pub fn is_stale(&self, topic: &Topic, id: &EntityId, timestamp_ms: u64) -> bool {
        self.versions
            .get(&(topic.clone(), id.clone()))
            .is_some_and(|applied| *applied > timestamp_ms)
    }

    /// Apply a remote change committed at `timestamp_ms`.
    ///
    /// Returns `None` for a stale event, which leaves the cache untouched.
    pub fn apply_versioned(
        &self,
        kind: EventKind,
        topic: &Topic,
        id: &EntityId,
        value: Option<&Value>,
        timestamp_ms: u64,
    ) -> Option<bool> {
        {
            let mut applied = self
                .versions
                .entry((topic.clone(), id.clone()))
                .or_insert(timestamp_ms);
            if *applied > timestamp_ms {
                return None;
            }
            *applied = timestamp_ms;
        }
        Some(self.apply(kind, topic, id, value))
    }

    /// Apply a change event, addressing the entity by its record id.
    ///
    /// Stale events change nothing.
    pub fn apply_event(&self, event: &ChangeEvent) -> Result<bool, SyncError> {
        let id = event.validate()?;
        Ok(self
            .apply_versioned(event.kind, &event.topic, &id, event.new.as_ref(), event.timestamp_ms)
            .unwrap_or(false))
    }

    /// Put back a snapshot taken before a speculative write.
    ///
    /// `None` means the entity did not exist and is removed.
    pub fn restore(&self, topic: &Topic, id: &EntityId, snapshot: Option<&Value>) -> bool {
        match snapshot {
            Some(value) => self.apply(EventKind::Update, topic, id, Some(value)),
            None => self.apply(EventKind::Delete, topic, id, None),
        }
    }

    /// Current cached value of an entity.
    pub fn snapshot(&self, topic: &Topic, id: &EntityId) -> Option<Value> {
        self.cache.get(topic, id)
    }

    /// Drop every cached entity and forget applied versions.
    pub fn clear(&self) {
        self.cache.clear();
        self.versions.clear();
    }

    /// The wrapped cache.
    pub fn cache(&self) -> &C {
        &self.cache
    }

    fn write(&self, topic: &Topic, id: &EntityId, value: &Value) -> bool {
        if self.cache.get(topic, id).as_ref() == Some(value) {
            return false;
        }
        self.cache.upsert(topic, id, value.clone());
        true
    }
}
