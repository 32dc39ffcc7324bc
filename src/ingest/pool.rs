// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Concurrent string interning for high-duplication decoder fields.
//!
//! Addresses and protocol labels repeat millions of times in a capture but only
//! take a few thousand distinct values. Every chunk-parsing task of one run
//! shares a single [`StringPool`] so each distinct value is allocated once.
//!
//! Entries live in hash buckets: a hash maps to the list of distinct strings
//! that produced it, and a lookup only hits on exact content equality. Two
//! strings with the same hash therefore both stay deduplicated instead of the
//! second one missing the cache forever.
use dashmap::DashMap;
use serde::Serialize;
use std::hash::{BuildHasher, RandomState};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Snapshot of pool effectiveness counters.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct StringPool<S = RandomState> {
    buckets: DashMap<u64, Vec<Arc<str>>>,
    hasher: S,
    entries: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StringPool<RandomState> {
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }
}

impl Default for StringPool<RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: BuildHasher> StringPool<S> {
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            buckets: DashMap::new(),
            hasher,
            entries: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the canonical shared instance equal to `text`, allocating it on first sight.
    pub fn intern(&self, text: &str) -> Arc<str> {
        let hash = self.hasher.hash_one(text);

        // Fast path under the shard read lock.
        if let Some(bucket) = self.buckets.get(&hash) {
            if let Some(found) = bucket.iter().find(|s| s.as_ref() == text) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Arc::clone(found);
            }
        }

        // Another task may have inserted it between the two locks.
        let mut bucket = self.buckets.entry(hash).or_default();
        if let Some(found) = bucket.iter().find(|s| s.as_ref() == text) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(found);
        }

        let canonical: Arc<str> = Arc::from(text);
        bucket.push(Arc::clone(&canonical));
        self.entries.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
        canonical
    }

    /// Number of distinct strings held.
    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::Hasher;
    use std::thread;

    /// Sends every string to the same bucket.
    #[derive(Clone, Default)]
    struct CollidingState;

    struct CollidingHasher;

    impl Hasher for CollidingHasher {
        fn finish(&self) -> u64 {
            42
        }
        fn write(&mut self, _bytes: &[u8]) {}
    }

    impl BuildHasher for CollidingState {
        type Hasher = CollidingHasher;
        fn build_hasher(&self) -> CollidingHasher {
            CollidingHasher
        }
    }

    #[test]
    fn test_intern_returns_shared_instance() {
        let pool = StringPool::new();
        let a = pool.intern("192.168.1.1");
        let b = pool.intern(&String::from("192.168.1.1"));
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);
        assert_eq!(
            pool.stats(),
            PoolStats {
                entries: 1,
                hits: 1,
                misses: 1
            }
        );
    }

    #[test]
    fn test_distinct_strings_are_distinct() {
        let pool = StringPool::new();
        let a = pool.intern("TCP");
        let b = pool.intern("UDP");
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
        assert!(!pool.is_empty());
    }

    #[test]
    fn test_colliding_hashes_still_deduplicate() {
        let pool = StringPool::with_hasher(CollidingState);
        let a1 = pool.intern("10.0.0.1");
        let b1 = pool.intern("10.0.0.2");
        let a2 = pool.intern("10.0.0.1");
        let b2 = pool.intern("10.0.0.2");

        assert_eq!(&*a1, "10.0.0.1");
        assert_eq!(&*b1, "10.0.0.2");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(Arc::ptr_eq(&b1, &b2));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.stats().hits, 2);
    }

    #[test]
    fn test_concurrent_interning_converges() {
        let pool = Arc::new(StringPool::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    (0..1000)
                        .map(|i| pool.intern(&format!("10.0.{}.{}", i % 4, i % 16)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<Vec<Arc<str>>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(pool.len(), 16);

        // Every thread got the very same instance for a given value.
        for i in 0..1000 {
            for other in &results[1..] {
                assert!(Arc::ptr_eq(&results[0][i], &other[i]));
            }
        }
    }

    #[test]
    fn test_pools_are_isolated() {
        let first = StringPool::new();
        let second = StringPool::new();
        let a = first.intern("ff02::1");
        let b = second.intern("ff02::1");
        assert_eq!(a, b);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }
}
