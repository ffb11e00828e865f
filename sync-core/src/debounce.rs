//! Trailing-edge debouncer.
//!
//! Each key holds its latest value and a single deadline. Pushing again
//! within the window replaces the value and re-arms the same deadline, so a
//! burst of N pushes produces one delivery carrying the last value.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use crate::scheduler::DeadlineQueue;

/// Default debounce window.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

/// Per-key trailing-edge debouncer.
#[derive(Debug)]
pub struct Debouncer<K, V> {
    window: Duration,
    latest: HashMap<K, V>,
    deadlines: DeadlineQueue<K>,
}

impl<K: Clone + Eq + Hash, V> Debouncer<K, V> {
    /// Create a debouncer with the given window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            latest: HashMap::new(),
            deadlines: DeadlineQueue::new(),
        }
    }

    /// Record `value` for `key` and (re)arm its deadline at `now + window`.
    ///
    /// Returns the value it replaced, if any.
    pub fn push(&mut self, key: K, value: V, now: Instant) -> Option<V> {
        self.deadlines.schedule(key.clone(), now + self.window);
        self.latest.insert(key, value)
    }

    /// Remove and return every value whose window has elapsed.
    pub fn due(&mut self, now: Instant) -> Vec<(K, V)> {
        self.deadlines
            .pop_expired(now)
            .into_iter()
            .filter_map(|key| self.latest.remove(&key).map(|value| (key, value)))
            .collect()
    }

    /// Take the pending value for `key` immediately, disarming its deadline.
    pub fn flush(&mut self, key: &K) -> Option<V> {
        self.deadlines.cancel(key);
        self.latest.remove(key)
    }

    /// Earliest deadline across all keys.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.deadlines.next_deadline()
    }

    /// Number of keys with a pending value.
    pub fn pending(&self) -> usize {
        self.latest.len()
    }

    /// Drop every pending value.
    pub fn clear(&mut self) {
        self.deadlines.clear();
        self.latest.clear();
    }
}

impl<K: Clone + Eq + Hash, V> Default for Debouncer<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn burst_collapses_to_last_value() {
        let base = Instant::now();
        let mut debouncer = Debouncer::new(ms(100));

        debouncer.push("orders", 1, base);
        debouncer.push("orders", 2, base + ms(30));
        debouncer.push("orders", 3, base + ms(60));

        assert!(debouncer.due(base + ms(100)).is_empty());
        assert_eq!(debouncer.due(base + ms(160)), vec![("orders", 3)]);
        assert_eq!(debouncer.pending(), 0);
    }

    #[test]
    fn keys_are_independent() {
        let base = Instant::now();
        let mut debouncer = Debouncer::new(ms(100));

        debouncer.push("orders", 1, base);
        debouncer.push("users", 10, base + ms(50));

        assert_eq!(debouncer.due(base + ms(100)), vec![("orders", 1)]);
        assert_eq!(debouncer.due(base + ms(150)), vec![("users", 10)]);
    }

    #[test]
    fn push_returns_replaced_value() {
        let base = Instant::now();
        let mut debouncer = Debouncer::new(ms(100));

        assert_eq!(debouncer.push("k", "a", base), None);
        assert_eq!(debouncer.push("k", "b", base), Some("a"));
    }

    #[test]
    fn flush_delivers_early_and_disarms() {
        let base = Instant::now();
        let mut debouncer = Debouncer::new(ms(100));
        debouncer.push("orders", 1, base);

        assert_eq!(debouncer.flush(&"orders"), Some(1));
        assert!(debouncer.next_deadline().is_none());
        assert!(debouncer.due(base + ms(500)).is_empty());
    }

    #[test]
    fn next_deadline_tracks_latest_push() {
        let base = Instant::now();
        let mut debouncer: Debouncer<&str, u8> = Debouncer::new(ms(100));
        assert!(debouncer.next_deadline().is_none());

        debouncer.push("orders", 1, base);
        debouncer.push("orders", 2, base + ms(40));
        assert_eq!(debouncer.next_deadline(), Some(base + ms(140)));
    }

    #[test]
    fn clear_drops_pending() {
        let base = Instant::now();
        let mut debouncer = Debouncer::new(ms(100));
        debouncer.push("a", 1, base);
        debouncer.push("b", 2, base);
        debouncer.clear();

        assert_eq!(debouncer.pending(), 0);
        assert!(debouncer.due(base + ms(200)).is_empty());
    }
}
