//! LRU eviction of primary entries.
//!
//! The node keeps one access-ordered index over every entry it owns as
//! primary. Touching, inserting and popping are O(1) (hash index plus an
//! intrusive linked list), so eviction runs inline on the write path.

use lru::LruCache;

use super::entry::SessionId;

pub struct EvictionPolicy {
    /// Session -> partition, ordered from most to least recently accessed.
    recency: LruCache<SessionId, u32>,
    capacity: usize,
}

impl EvictionPolicy {
    pub fn new(capacity: usize) -> Self {
        Self {
            recency: LruCache::unbounded(),
            capacity: capacity.max(1),
        }
    }

    /// Marks `id` as the most recently accessed entry.
    pub fn touch(&mut self, id: &SessionId, partition: u32) {
        if self.recency.get(id).is_none() {
            self.recency.put(id.clone(), partition);
        }
    }

    /// Tracks a new primary entry and returns the entries that must be
    /// evicted to get back under capacity, least recently used first.
    pub fn admit(&mut self, id: &SessionId, partition: u32) -> Vec<(SessionId, u32)> {
        self.recency.put(id.clone(), partition);
        self.overflow()
    }

    /// Drains entries above capacity, never the one accessed last.
    pub fn overflow(&mut self) -> Vec<(SessionId, u32)> {
        let mut victims = Vec::new();
        while self.recency.len() > self.capacity {
            match self.recency.pop_lru() {
                Some(victim) => victims.push(victim),
                None => break,
            }
        }
        victims
    }

    pub fn remove(&mut self, id: &SessionId) {
        self.recency.pop(id);
    }

    /// Forgets every entry of `partition`, e.g. after losing primary ownership.
    pub fn forget_partition(&mut self, partition: u32) {
        let stale: Vec<SessionId> = self
            .recency
            .iter()
            .filter(|(_, p)| **p == partition)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            self.recency.pop(&id);
        }
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.recency.contains(id)
    }

    pub fn len(&self) -> usize {
        self.recency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recency.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> SessionId {
        SessionId(name.to_string())
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut policy = EvictionPolicy::new(3);
        assert!(policy.admit(&id("a"), 0).is_empty());
        assert!(policy.admit(&id("b"), 1).is_empty());
        assert!(policy.admit(&id("c"), 2).is_empty());

        // "a" is the oldest, but it was just read.
        policy.touch(&id("a"), 0);

        let victims = policy.admit(&id("d"), 3);
        assert_eq!(victims, vec![(id("b"), 1)]);
        assert!(policy.contains(&id("a")));
        assert_eq!(policy.len(), 3);
    }

    #[test]
    fn test_touch_of_untracked_entry_admits_it() {
        let mut policy = EvictionPolicy::new(2);
        policy.touch(&id("promoted"), 7);
        assert!(policy.contains(&id("promoted")));
        assert_eq!(policy.len(), 1);
    }

    #[test]
    fn test_overflow_after_promotion_drains_oldest() {
        let mut policy = EvictionPolicy::new(2);
        for name in ["a", "b", "c", "d"] {
            policy.touch(&id(name), 1);
        }
        let victims = policy.overflow();
        assert_eq!(victims, vec![(id("a"), 1), (id("b"), 1)]);
    }

    #[test]
    fn test_remove_and_forget_partition() {
        let mut policy = EvictionPolicy::new(10);
        policy.admit(&id("a"), 1);
        policy.admit(&id("b"), 2);
        policy.admit(&id("c"), 2);

        policy.remove(&id("a"));
        assert!(!policy.contains(&id("a")));

        policy.forget_partition(2);
        assert!(policy.is_empty());
    }
}
