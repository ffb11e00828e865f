//! Keyed deadline queue.
//!
//! One min-heap of deadlines replaces one OS timer per pending item. Each key
//! holds at most one live deadline: rescheduling a key supersedes its previous
//! entry, which stays in the heap as a tombstone and is skipped when popped.
//!
//! The queue never reads a clock; callers pass `now`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::time::Instant;

/// Min-heap of deadlines keyed by `K`.
#[derive(Debug)]
pub struct DeadlineQueue<K> {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    /// Sequence number -> key, for heap entries that may still be live.
    slots: HashMap<u64, K>,
    /// Key -> (deadline, sequence) of its single live entry.
    live: HashMap<K, (Instant, u64)>,
    next_seq: u64,
}

impl<K: Clone + Eq + Hash> DeadlineQueue<K> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            slots: HashMap::new(),
            live: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Arm (or re-arm) the deadline for `key`.
    ///
    /// Returns `true` if this replaced an existing live deadline.
    pub fn schedule(&mut self, key: K, deadline: Instant) -> bool {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let replaced = match self.live.insert(key.clone(), (deadline, seq)) {
            Some((_, old_seq)) => {
                self.slots.remove(&old_seq);
                true
            }
            None => false,
        };
        self.slots.insert(seq, key);
        self.heap.push(Reverse((deadline, seq)));
        self.compact_if_sparse();
        replaced
    }

    /// Disarm the deadline for `key`. Returns `true` if one was live.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.live.remove(key) {
            Some((_, seq)) => {
                self.slots.remove(&seq);
                self.compact_if_sparse();
                true
            }
            None => false,
        }
    }

    /// Check whether `key` has a live deadline.
    pub fn contains(&self, key: &K) -> bool {
        self.live.contains_key(key)
    }

    /// Deadline armed for `key`.
    pub fn deadline_of(&self, key: &K) -> Option<Instant> {
        self.live.get(key).map(|(deadline, _)| *deadline)
    }

    /// Earliest live deadline.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.drop_tombstones();
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Remove and return every key whose deadline is at or before `now`,
    /// earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<K> {
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, seq))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(key) = self.slots.remove(&seq) {
                self.live.remove(&key);
                expired.push(key);
            }
        }
        expired
    }

    /// Number of live deadlines.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Check if no deadline is live.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Disarm everything.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.slots.clear();
        self.live.clear();
    }

    fn drop_tombstones(&mut self) {
        while let Some(Reverse((_, seq))) = self.heap.peek() {
            if self.slots.contains_key(seq) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Rebuild the heap once tombstones outnumber live entries.
    fn compact_if_sparse(&mut self) {
        if self.heap.len() > 64 && self.heap.len() > self.live.len() * 2 {
            let slots = &self.slots;
            let heap = std::mem::take(&mut self.heap);
            self.heap = heap
                .into_iter()
                .filter(|Reverse((_, seq))| slots.contains_key(seq))
                .collect();
        }
    }
}

impl<K: Clone + Eq + Hash> Default for DeadlineQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(base: Instant, millis: u64) -> Instant {
        base + Duration::from_millis(millis)
    }

    #[test]
    fn pops_in_deadline_order() {
        let base = Instant::now();
        let mut queue = DeadlineQueue::new();
        queue.schedule("b", at(base, 20));
        queue.schedule("a", at(base, 10));
        queue.schedule("c", at(base, 30));

        assert_eq!(queue.pop_expired(at(base, 25)), vec!["a", "b"]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_deadline(), Some(at(base, 30)));
    }

    #[test]
    fn nothing_expires_before_deadline() {
        let base = Instant::now();
        let mut queue = DeadlineQueue::new();
        queue.schedule(1u32, at(base, 100));

        assert!(queue.pop_expired(at(base, 99)).is_empty());
        assert_eq!(queue.pop_expired(at(base, 100)), vec![1]);
    }

    #[test]
    fn reschedule_keeps_single_live_deadline() {
        let base = Instant::now();
        let mut queue = DeadlineQueue::new();

        assert!(!queue.schedule("k", at(base, 10)));
        assert!(queue.schedule("k", at(base, 50)));
        assert_eq!(queue.len(), 1);

        // The superseded deadline does not fire
        assert!(queue.pop_expired(at(base, 20)).is_empty());
        assert_eq!(queue.next_deadline(), Some(at(base, 50)));
        assert_eq!(queue.pop_expired(at(base, 60)), vec!["k"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn cancel_disarms() {
        let base = Instant::now();
        let mut queue = DeadlineQueue::new();
        queue.schedule("k", at(base, 10));

        assert!(queue.cancel(&"k"));
        assert!(!queue.cancel(&"k"));
        assert!(queue.next_deadline().is_none());
        assert!(queue.pop_expired(at(base, 100)).is_empty());
    }

    #[test]
    fn compaction_preserves_live_entries() {
        let base = Instant::now();
        let mut queue = DeadlineQueue::new();
        for i in 0..500u64 {
            queue.schedule("hot", at(base, i));
        }
        queue.schedule("cold", at(base, 1000));

        assert_eq!(queue.len(), 2);
        assert!(queue.heap.len() < 500);
        assert_eq!(queue.deadline_of(&"hot"), Some(at(base, 499)));
        assert_eq!(queue.pop_expired(at(base, 2000)), vec!["hot", "cold"]);
    }

    #[test]
    fn clear_empties_queue() {
        let base = Instant::now();
        let mut queue = DeadlineQueue::new();
        queue.schedule(1u8, at(base, 1));
        queue.schedule(2u8, at(base, 2));
        queue.clear();

        assert!(queue.is_empty());
        assert!(queue.pop_expired(at(base, 10)).is_empty());
    }
}
