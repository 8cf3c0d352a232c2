//! Purge Set
//!
//! In-memory model of cache invalidations: one global timestamp plus a
//! byte-bounded LRU of per-URL timestamps.
//!
//! An entry written at `ts` is valid iff `ts` is newer than both the global
//! timestamp and the URL's own purge timestamp (0 when absent). When the
//! LRU evicts a URL, the global timestamp is raised to the evicted URL's
//! timestamp so the eviction can never revive a purged entry; it can only
//! purge more than asked.

use tracing::debug;

use crate::cache::lru::SizedLru;

/// Global timestamp before any purge
pub const INITIAL_TIMESTAMP_MS: i64 = -1;

/// Default byte budget of the per-URL map
pub const DEFAULT_MAX_BYTES: usize = 1_000_000;

/// Global plus per-URL invalidation timestamps
#[derive(Clone)]
pub struct PurgeSet {
    global_invalidation_timestamp_ms: i64,
    lru: SizedLru<i64>,
}

impl PurgeSet {
    pub fn new() -> Self {
        Self::with_max_bytes(DEFAULT_MAX_BYTES)
    }

    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self {
            global_invalidation_timestamp_ms: INITIAL_TIMESTAMP_MS,
            lru: SizedLru::new(max_bytes),
        }
    }

    pub fn global_invalidation_timestamp_ms(&self) -> i64 {
        self.global_invalidation_timestamp_ms
    }

    /// Whether an entry for `url` written at `timestamp_ms` survives
    pub fn is_valid(&self, url: &str, timestamp_ms: i64) -> bool {
        let per_url = self.lru.peek(url).copied().unwrap_or(0);
        timestamp_ms > self.global_invalidation_timestamp_ms && timestamp_ms > per_url
    }

    /// Record a purge of `url` at `timestamp_ms`. Timestamps already covered
    /// by the global one are not stored. Returns false for negative input.
    pub fn put(&mut self, url: &str, timestamp_ms: i64) -> bool {
        if timestamp_ms < 0 {
            return false;
        }
        if timestamp_ms <= self.global_invalidation_timestamp_ms {
            return true;
        }
        let timestamp_ms = match self.lru.peek(url) {
            Some(&existing) if existing >= timestamp_ms => return true,
            _ => timestamp_ms,
        };
        let mut evicted_max = INITIAL_TIMESTAMP_MS;
        let inserted = self.lru.put_evicting(url, timestamp_ms, |evicted_url, &ts| {
            debug!(url = evicted_url, ts, "Purge set evicted URL");
            evicted_max = evicted_max.max(ts);
        });
        if !inserted {
            // A URL too long to track is covered by purging everything.
            evicted_max = evicted_max.max(timestamp_ms);
        }
        self.update_global_invalidation_timestamp_ms(evicted_max);
        true
    }

    /// Raise the global timestamp; lower values are ignored
    pub fn update_global_invalidation_timestamp_ms(&mut self, timestamp_ms: i64) -> bool {
        if timestamp_ms > self.global_invalidation_timestamp_ms {
            self.global_invalidation_timestamp_ms = timestamp_ms;
            true
        } else {
            false
        }
    }

    /// Fold `other` into this set
    pub fn merge(&mut self, other: &PurgeSet) {
        self.update_global_invalidation_timestamp_ms(other.global_invalidation_timestamp_ms);
        for (url, &ts) in other.lru.iter_oldest_first() {
            self.put(url, ts);
        }
    }

    /// Per-URL entries from least to most recently updated
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.lru
            .iter_oldest_first()
            .map(|(url, &ts)| (url.as_str(), ts))
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.is_empty()
    }

    pub fn max_bytes(&self) -> usize {
        self.lru.max_bytes()
    }

    pub fn clear(&mut self) {
        self.global_invalidation_timestamp_ms = INITIAL_TIMESTAMP_MS;
        self.lru.clear();
    }
}

impl Default for PurgeSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for PurgeSet {
    fn eq(&self, other: &Self) -> bool {
        self.global_invalidation_timestamp_ms == other.global_invalidation_timestamp_ms
            && self.lru.len() == other.lru.len()
            && self
                .lru
                .iter_oldest_first()
                .all(|(url, ts)| other.lru.peek(url) == Some(ts))
    }
}

impl std::fmt::Debug for PurgeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PurgeSet")
            .field("global_ms", &self.global_invalidation_timestamp_ms)
            .field("urls", &self.iter().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_initially_everything_valid() {
        let set = PurgeSet::new();
        assert!(set.is_valid("a", 1));
        assert!(set.is_valid("a", 0) == false);
        assert_eq!(set.global_invalidation_timestamp_ms(), INITIAL_TIMESTAMP_MS);
    }

    #[test]
    fn test_global_and_per_url() {
        let mut set = PurgeSet::new();
        set.update_global_invalidation_timestamp_ms(400_000);
        set.put("a", 500_000);
        assert!(!set.is_valid("a", 499_999));
        assert!(set.is_valid("a", 500_001));
        assert!(!set.is_valid("b", 399_999));
        assert!(set.is_valid("b", 400_001));
    }

    #[test]
    fn test_put_keeps_newest_and_ignores_covered() {
        let mut set = PurgeSet::new();
        set.put("a", 200);
        set.put("a", 100);
        assert!(!set.is_valid("a", 150));

        set.update_global_invalidation_timestamp_ms(300);
        set.put("b", 250);
        assert_eq!(set.len(), 1);
        assert!(!set.put("c", -5));
    }

    #[test]
    fn test_eviction_raises_global() {
        // "u1" + 8 bytes = 10 bytes per entry
        let mut set = PurgeSet::with_max_bytes(20);
        set.put("u1", 100);
        set.put("u2", 200);
        set.put("u3", 300);
        assert_eq!(set.len(), 2);
        assert_eq!(set.global_invalidation_timestamp_ms(), 100);
        assert!(!set.is_valid("u1", 100));
        assert!(set.is_valid("u1", 101));
    }

    #[test]
    fn test_merge_and_equality() {
        let mut a = PurgeSet::new();
        a.put("x", 10);
        a.update_global_invalidation_timestamp_ms(5);
        let mut b = PurgeSet::new();
        b.put("y", 20);
        b.put("x", 30);
        b.update_global_invalidation_timestamp_ms(7);

        a.merge(&b);
        assert_eq!(a.global_invalidation_timestamp_ms(), 7);
        assert!(!a.is_valid("x", 30));
        assert!(!a.is_valid("y", 20));

        let mut c = PurgeSet::new();
        c.update_global_invalidation_timestamp_ms(7);
        c.put("y", 20);
        c.put("x", 30);
        assert_eq!(a, c);
        c.put("z", 1_000);
        assert_ne!(a, c);
    }

    proptest! {
        #[test]
        fn test_validity_matches_definition(
            global in 0i64..1000,
            per_url in proptest::option::of(0i64..1000),
            ts in 0i64..1000,
        ) {
            let mut set = PurgeSet::new();
            set.update_global_invalidation_timestamp_ms(global);
            if let Some(p) = per_url {
                set.put("url", p);
            }
            let stored = if per_url.map_or(false, |p| p > global) { per_url.unwrap_or(0) } else { 0 };
            let expected = ts > global && ts > stored;
            prop_assert_eq!(set.is_valid("url", ts), expected);
        }
    }
}
