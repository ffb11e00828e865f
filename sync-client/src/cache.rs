//! Cache collaborator.
//!
//! The engine never owns entity storage. It mutates whatever implements
//! [`Cache`] through the [`CacheSynchronizer`](crate::CacheSynchronizer),
//! which is the only writer. [`InMemoryCache`] is a concurrent map for tests,
//! the CLI and applications without a query layer.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sync_types::{EntityId, Topic};

/// Entity store the engine keeps in sync.
///
/// Collections are keyed by topic name.
pub trait Cache: Send + Sync + 'static {
    /// Read an entity.
    fn get(&self, collection: &Topic, id: &EntityId) -> Option<Value>;

    /// Insert or replace an entity.
    fn upsert(&self, collection: &Topic, id: &EntityId, value: Value);

    /// Remove an entity, returning what was stored.
    fn remove(&self, collection: &Topic, id: &EntityId) -> Option<Value>;

    /// Signal that derived queries over `collection` are stale.
    fn invalidate_derived(&self, collection: &Topic);

    /// Check whether the cache is usable.
    fn is_valid(&self) -> bool;

    /// Drop every entity.
    fn clear(&self);
}

/// In-memory [`Cache`] backed by a [`DashMap`].
///
/// Clones share state. Invalidations are counted per collection so callers
/// can observe derived-query signals.
#[derive(Debug, Clone)]
pub struct InMemoryCache {
    inner: Arc<CacheInner>,
}

#[derive(Debug)]
struct CacheInner {
    entities: DashMap<(Topic, EntityId), Value>,
    invalidations: DashMap<Topic, u64>,
    valid: AtomicBool,
}

impl InMemoryCache {
    /// Create an empty, valid cache.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entities: DashMap::new(),
                invalidations: DashMap::new(),
                valid: AtomicBool::new(true),
            }),
        }
    }

    /// Number of cached entities across all collections.
    pub fn len(&self) -> usize {
        self.inner.entities.len()
    }

    /// Check if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.inner.entities.is_empty()
    }

    /// Number of entities in one collection.
    pub fn collection_len(&self, collection: &Topic) -> usize {
        self.inner
            .entities
            .iter()
            .filter(|entry| &entry.key().0 == collection)
            .count()
    }

    /// How many times `collection` was invalidated.
    pub fn invalidations(&self, collection: &Topic) -> u64 {
        self.inner
            .invalidations
            .get(collection)
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// Mark the cache usable or not.
    pub fn set_valid(&self, valid: bool) {
        self.inner.valid.store(valid, Ordering::SeqCst);
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache for InMemoryCache {
    fn get(&self, collection: &Topic, id: &EntityId) -> Option<Value> {
        self.inner
            .entities
            .get(&(collection.clone(), id.clone()))
            .map(|entry| entry.value().clone())
    }

    fn upsert(&self, collection: &Topic, id: &EntityId, value: Value) {
        self.inner
            .entities
            .insert((collection.clone(), id.clone()), value);
    }

    fn remove(&self, collection: &Topic, id: &EntityId) -> Option<Value> {
        self.inner
            .entities
            .remove(&(collection.clone(), id.clone()))
            .map(|(_, value)| value)
    }

    fn invalidate_derived(&self, collection: &Topic) {
        *self
            .inner
            .invalidations
            .entry(collection.clone())
            .or_insert(0) += 1;
    }

    fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.inner.entities.clear();
    }
}
