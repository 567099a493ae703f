use lru::LruCache;
use ringmap::set::RingSet;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Bounded insert-order set. Admitting a key past capacity evicts the oldest.
pub struct FifoSet<K> {
    set: RingSet<K>,
}

impl<K: Hash + Eq> FifoSet<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            set: RingSet::with_capacity(capacity),
        }
    }

    /// Returns false when the key was already present.
    pub fn insert(&mut self, key: K) -> bool {
        if self.set.contains(&key) {
            return false;
        }

        if self.set.len() == self.set.capacity() {
            self.set.pop_front();
        }

        self.set.insert(key);
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.set.contains(key)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Bounded LRU cache with an optional per-entry TTL. Entries past their
/// deadline read as absent and are dropped on access.
pub struct TtlCache<K: Hash + Eq, V> {
    inner: LruCache<K, (V, Option<Instant>)>,
    ttl: Option<Duration>,
}

impl<K: Hash + Eq, V> TtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            inner: LruCache::new(NonZeroUsize::new(capacity).expect("capacity must be non-zero")),
            ttl,
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        let deadline = self.ttl.map(|ttl| Instant::now() + ttl);
        self.inner.put(key, (value, deadline));
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        let expired = matches!(self.inner.get(key), Some((_, Some(deadline))) if *deadline <= Instant::now());
        if expired {
            self.inner.pop(key);
            return None;
        }
        self.inner.get(key).map(|(value, _)| value)
    }

    pub fn contains(&mut self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
