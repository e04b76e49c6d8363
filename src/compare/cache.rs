//! Sharded LRU memo for comparator scores.
//!
//! Keys are `(comparator_id, left_value, right_value)` hashes computed at
//! preprocessing time. Shard count and per-shard capacity are bounded by
//! configuration; eviction is least-recently-used with lazy invalidation of
//! stale recency entries.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Cache key: comparator id hash plus the two value hashes in canonical
/// order (comparators are symmetric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub comparator: u64,
    pub left: u64,
    pub right: u64,
}

impl CacheKey {
    pub fn new(comparator: u64, a: u64, b: u64) -> Self {
        let (left, right) = if a <= b { (a, b) } else { (b, a) };
        Self {
            comparator,
            left,
            right,
        }
    }
}

struct Shard {
    entries: HashMap<CacheKey, (f64, u64)>,
    recency: VecDeque<(CacheKey, u64)>,
    capacity: usize,
}

impl Shard {
    fn get(&mut self, key: &CacheKey, tick: u64) -> Option<f64> {
        let (value, stamp) = self.entries.get_mut(key)?;
        *stamp = tick;
        let value = *value;
        self.recency.push_back((*key, tick));
        Some(value)
    }

    fn insert(&mut self, key: CacheKey, value: f64, tick: u64) {
        self.entries.insert(key, (value, tick));
        self.recency.push_back((key, tick));
        while self.entries.len() > self.capacity {
            match self.recency.pop_front() {
                Some((candidate, stamp)) => {
                    // Stale recency entries are skipped; only a front entry
                    // whose stamp matches the live one is truly the LRU.
                    if self
                        .entries
                        .get(&candidate)
                        .map(|(_, live)| *live == stamp)
                        .unwrap_or(false)
                    {
                        self.entries.remove(&candidate);
                    }
                }
                None => break,
            }
        }
    }
}

/// Concurrent comparator cache with per-shard locks.
pub struct ComparatorCache {
    shards: Vec<Mutex<Shard>>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ComparatorCache {
    pub fn new(shard_count: usize, capacity_per_shard: usize) -> Self {
        let shard_count = shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| {
                Mutex::new(Shard {
                    entries: HashMap::new(),
                    recency: VecDeque::new(),
                    capacity: capacity_per_shard.max(1),
                })
            })
            .collect();
        Self {
            shards,
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn shard_for(&self, key: &CacheKey) -> &Mutex<Shard> {
        let index = (key.comparator ^ key.left ^ key.right) as usize % self.shards.len();
        &self.shards[index]
    }

    pub fn get(&self, key: &CacheKey) -> Option<f64> {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        let result = self.shard_for(key).lock().unwrap().get(key, tick);
        match result {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    pub fn insert(&self, key: CacheKey, value: f64) {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        self.shard_for(&key).lock().unwrap().insert(key, value, tick);
    }

    /// (hits, misses) since construction.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap().entries.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_keys_collapse() {
        let a = CacheKey::new(7, 1, 2);
        let b = CacheKey::new(7, 2, 1);
        assert_eq!(a, b);
    }

    #[test]
    fn hit_after_insert() {
        let cache = ComparatorCache::new(4, 16);
        let key = CacheKey::new(1, 10, 20);
        assert_eq!(cache.get(&key), None);
        cache.insert(key, 0.75);
        assert_eq!(cache.get(&key), Some(0.75));
        let (hits, misses) = cache.stats();
        assert_eq!((hits, misses), (1, 1));
    }

    #[test]
    fn capacity_is_bounded_and_lru_survives() {
        let cache = ComparatorCache::new(1, 4);
        for i in 0..4u64 {
            cache.insert(CacheKey::new(1, i, i + 100), i as f64);
        }
        // Touch key 0 so it is the most recently used.
        assert!(cache.get(&CacheKey::new(1, 0, 100)).is_some());
        for i in 4..7u64 {
            cache.insert(CacheKey::new(1, i, i + 100), i as f64);
        }
        assert!(cache.len() <= 4);
        // The freshly touched key outlives the untouched ones.
        assert!(cache.get(&CacheKey::new(1, 0, 100)).is_some());
        assert!(cache.get(&CacheKey::new(1, 1, 101)).is_none());
    }
}
