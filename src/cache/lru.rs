//! LRU Cache - In-Memory Size-Bounded Backend
//!
//! # Design
//!
//! - [`SizedLru`] is a recency-ordered map bounded by total bytes, where an
//!   entry costs `len(key) + value size`. It is not synchronized; owners
//!   wrap it in a mutex. The purge set reuses it for URL timestamps.
//! - [`LruCache`] is the [`CacheInterface`] backend: one mutex around a
//!   `SizedLru<Bytes>`. Lookups deliver synchronously on the caller thread
//!   after the mutex is released.
//! - Inserting an entry larger than the whole cache is refused and drops
//!   any previous value for that key, so a stale entry never outlives a
//!   rejected update.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use lru::LruCache as LinkedLru;
use parking_lot::Mutex;
use tracing::debug;

use crate::cache::interface::{deliver, CacheCallback, CacheInterface, KeyState};

/// Values with a byte cost
pub trait LruValue: Clone + PartialEq {
    fn size_bytes(&self) -> usize;
}

impl LruValue for Bytes {
    fn size_bytes(&self) -> usize {
        self.len()
    }
}

impl LruValue for i64 {
    fn size_bytes(&self) -> usize {
        std::mem::size_of::<i64>()
    }
}

/// Byte-bounded recency-ordered map
pub struct SizedLru<V: LruValue> {
    map: LinkedLru<String, V>,
    max_bytes: usize,
    current_bytes: usize,
    num_hits: u64,
    num_misses: u64,
    num_inserts: u64,
    num_identical_reinserts: u64,
    num_deletes: u64,
    num_evictions: u64,
}

impl<V: LruValue> SizedLru<V> {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            map: LinkedLru::unbounded(),
            max_bytes,
            current_bytes: 0,
            num_hits: 0,
            num_misses: 0,
            num_inserts: 0,
            num_identical_reinserts: 0,
            num_deletes: 0,
            num_evictions: 0,
        }
    }

    fn entry_size(key: &str, value: &V) -> usize {
        key.len() + value.size_bytes()
    }

    /// Look up and mark most recently used
    pub fn get(&mut self, key: &str) -> Option<&V> {
        match self.map.get(key) {
            Some(value) => {
                self.num_hits += 1;
                Some(value)
            }
            None => {
                self.num_misses += 1;
                None
            }
        }
    }

    /// Look up without touching recency or counters
    pub fn peek(&self, key: &str) -> Option<&V> {
        self.map.peek(key)
    }

    pub fn put(&mut self, key: &str, value: V) -> bool {
        self.put_evicting(key, value, |_, _| {})
    }

    /// Insert, reporting each entry evicted to make room. Returns false if
    /// the entry alone exceeds the capacity.
    pub fn put_evicting<F>(&mut self, key: &str, value: V, mut on_evict: F) -> bool
    where
        F: FnMut(&str, &V),
    {
        let size = Self::entry_size(key, &value);
        if size > self.max_bytes {
            debug!(key, size, max_bytes = self.max_bytes, "Entry exceeds LRU capacity");
            self.remove(key);
            return false;
        }

        if let Some(existing) = self.map.get(key) {
            if *existing == value {
                self.num_identical_reinserts += 1;
                return true;
            }
        }
        self.remove(key);

        self.map.put(key.to_string(), value);
        self.current_bytes += size;
        self.num_inserts += 1;

        while self.current_bytes > self.max_bytes {
            match self.map.pop_lru() {
                Some((evicted_key, evicted)) => {
                    self.current_bytes -= Self::entry_size(&evicted_key, &evicted);
                    self.num_evictions += 1;
                    on_evict(&evicted_key, &evicted);
                }
                None => break,
            }
        }
        true
    }

    fn remove(&mut self, key: &str) -> Option<V> {
        let old = self.map.pop(key)?;
        self.current_bytes -= Self::entry_size(key, &old);
        Some(old)
    }

    pub fn delete(&mut self, key: &str) -> bool {
        let removed = self.remove(key).is_some();
        if removed {
            self.num_deletes += 1;
        }
        removed
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.current_bytes = 0;
    }

    pub fn clear_stats(&mut self) {
        self.num_hits = 0;
        self.num_misses = 0;
        self.num_inserts = 0;
        self.num_identical_reinserts = 0;
        self.num_deletes = 0;
        self.num_evictions = 0;
    }

    /// Entries from least to most recently used
    pub fn iter_oldest_first(&self) -> impl Iterator<Item = (&String, &V)> {
        self.map.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.current_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn num_hits(&self) -> u64 {
        self.num_hits
    }

    pub fn num_misses(&self) -> u64 {
        self.num_misses
    }

    pub fn num_inserts(&self) -> u64 {
        self.num_inserts
    }

    pub fn num_identical_reinserts(&self) -> u64 {
        self.num_identical_reinserts
    }

    pub fn num_deletes(&self) -> u64 {
        self.num_deletes
    }

    pub fn num_evictions(&self) -> u64 {
        self.num_evictions
    }
}

impl<V: LruValue> Clone for SizedLru<V> {
    fn clone(&self) -> Self {
        let mut map = LinkedLru::unbounded();
        for (key, value) in self.map.iter().rev() {
            map.put(key.clone(), value.clone());
        }
        Self {
            map,
            max_bytes: self.max_bytes,
            current_bytes: self.current_bytes,
            num_hits: self.num_hits,
            num_misses: self.num_misses,
            num_inserts: self.num_inserts,
            num_identical_reinserts: self.num_identical_reinserts,
            num_deletes: self.num_deletes,
            num_evictions: self.num_evictions,
        }
    }
}

// =============================================================================
// Cache Backend
// =============================================================================

/// In-memory [`CacheInterface`] backend
pub struct LruCache {
    lru: Mutex<SizedLru<Bytes>>,
    shut_down: AtomicBool,
}

impl LruCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            lru: Mutex::new(SizedLru::new(max_bytes)),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn format_name() -> String {
        "LRUCache".to_string()
    }

    pub fn num_elements(&self) -> usize {
        self.lru.lock().len()
    }

    pub fn size_bytes(&self) -> usize {
        self.lru.lock().size_bytes()
    }

    pub fn max_bytes(&self) -> usize {
        self.lru.lock().max_bytes()
    }

    pub fn num_hits(&self) -> u64 {
        self.lru.lock().num_hits()
    }

    pub fn num_misses(&self) -> u64 {
        self.lru.lock().num_misses()
    }

    pub fn num_inserts(&self) -> u64 {
        self.lru.lock().num_inserts()
    }

    pub fn num_identical_reinserts(&self) -> u64 {
        self.lru.lock().num_identical_reinserts()
    }

    pub fn num_deletes(&self) -> u64 {
        self.lru.lock().num_deletes()
    }

    pub fn num_evictions(&self) -> u64 {
        self.lru.lock().num_evictions()
    }

    /// Whether `key` is present, without touching recency or counters
    pub fn contains(&self, key: &str) -> bool {
        self.lru.lock().peek(key).is_some()
    }

    pub fn clear(&self) {
        self.lru.lock().clear();
    }

    pub fn clear_stats(&self) {
        self.lru.lock().clear_stats();
    }
}

impl CacheInterface for LruCache {
    fn get(&self, key: &str, callback: Box<dyn CacheCallback>) {
        let value = if self.shut_down.load(Ordering::Acquire) {
            None
        } else {
            self.lru.lock().get(key).cloned()
        };
        match value {
            Some(value) => deliver(callback, key, KeyState::Available, Some(value)),
            None => deliver(callback, key, KeyState::NotFound, None),
        }
    }

    fn put(&self, key: &str, value: Bytes) {
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        self.lru.lock().put(key, value);
    }

    fn delete(&self, key: &str) {
        self.lru.lock().delete(key);
    }

    fn name(&self) -> String {
        Self::format_name()
    }

    fn is_blocking(&self) -> bool {
        true
    }

    fn shut_down(&self) {
        self.shut_down.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::get_now;

    #[test]
    fn test_put_get_delete() {
        let cache = LruCache::new(100);
        cache.put("Name", Bytes::from_static(b"Value"));
        assert_eq!(cache.size_bytes(), 9);

        let result = get_now(&cache, "Name");
        assert_eq!(result.state(), Some(KeyState::Available));
        assert_eq!(result.value_str(), "Value");
        assert_eq!(cache.num_hits(), 1);

        assert_eq!(get_now(&cache, "Other").state(), Some(KeyState::NotFound));
        assert_eq!(cache.num_misses(), 1);

        cache.delete("Name");
        assert_eq!(get_now(&cache, "Name").state(), Some(KeyState::NotFound));
        assert_eq!(cache.num_deletes(), 1);
        assert_eq!(cache.size_bytes(), 0);
    }

    #[test]
    fn test_eviction_oldest_first() {
        // Each entry is 2 + 3 = 5 bytes.
        let cache = LruCache::new(15);
        cache.put("k1", Bytes::from_static(b"aaa"));
        cache.put("k2", Bytes::from_static(b"bbb"));
        cache.put("k3", Bytes::from_static(b"ccc"));
        // Touch k1 so k2 becomes the oldest.
        assert_eq!(get_now(&cache, "k1").state(), Some(KeyState::Available));
        cache.put("k4", Bytes::from_static(b"ddd"));

        assert_eq!(cache.num_evictions(), 1);
        assert!(cache.contains("k1"));
        assert!(!cache.contains("k2"));
        assert!(cache.contains("k3"));
        assert!(cache.contains("k4"));
        assert_eq!(cache.size_bytes(), 15);
    }

    #[test]
    fn test_identical_reinsert_and_replace() {
        let cache = LruCache::new(100);
        cache.put("k", Bytes::from_static(b"v1"));
        cache.put("k", Bytes::from_static(b"v1"));
        assert_eq!(cache.num_inserts(), 1);
        assert_eq!(cache.num_identical_reinserts(), 1);

        cache.put("k", Bytes::from_static(b"v22"));
        assert_eq!(cache.num_inserts(), 2);
        assert_eq!(cache.size_bytes(), 4);
        assert_eq!(get_now(&cache, "k").value_str(), "v22");
    }

    #[test]
    fn test_oversized_entry_drops_previous_value() {
        let cache = LruCache::new(10);
        cache.put("k", Bytes::from_static(b"small"));
        cache.put("k", Bytes::from_static(b"much too large"));
        assert_eq!(get_now(&cache, "k").state(), Some(KeyState::NotFound));
        assert_eq!(cache.size_bytes(), 0);
    }

    #[test]
    fn test_shut_down() {
        let cache = LruCache::new(100);
        cache.put("k", Bytes::from_static(b"v"));
        cache.shut_down();
        assert_eq!(get_now(&cache, "k").state(), Some(KeyState::NotFound));
        cache.put("k2", Bytes::from_static(b"v"));
        assert_eq!(cache.num_elements(), 1);
    }

    #[test]
    fn test_sized_lru_eviction_callback_and_clone() {
        let mut lru: SizedLru<i64> = SizedLru::new(20);
        let mut evicted = Vec::new();
        // Each entry is 2 + 8 = 10 bytes.
        lru.put_evicting("u1", 1, |k, v| evicted.push((k.to_string(), *v)));
        lru.put_evicting("u2", 2, |k, v| evicted.push((k.to_string(), *v)));
        lru.put_evicting("u3", 3, |k, v| evicted.push((k.to_string(), *v)));
        assert_eq!(evicted, vec![("u1".to_string(), 1)]);

        let copy = lru.clone();
        let keys: Vec<&String> = copy.iter_oldest_first().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["u2", "u3"]);
        assert_eq!(copy.size_bytes(), 20);
    }
}
