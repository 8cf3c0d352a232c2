//! Write-Through Cache
//!
//! Two-tier composition of cache primitives.
//!
//! # Architecture
//!
//! ```text
//!   get(k) ──▶ L1 ──hit──▶ deliver
//!               │
//!             miss / rejected
//!               ▼
//!              L2 ──hit──▶ reinsert into L1 (size cap permitting) ──▶ deliver
//!               │
//!             miss ──▶ deliver NotFound
//! ```
//!
//! Puts go to L2, and to L1 unless `len(key) + len(value)` exceeds the L1
//! limit. Deletes go to both. A candidate the caller rejects at L1 falls
//! through to L2, so the caller's validation hook runs once per level.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::cache::interface::{CacheCallback, CacheInterface, KeyState};

/// L1 size limit meaning "no limit"
pub const UNLIMITED: i64 = -1;

/// L1/L2 composition
pub struct WriteThroughCache {
    cache1: Arc<dyn CacheInterface>,
    cache2: Arc<dyn CacheInterface>,
    cache1_limit: Arc<AtomicI64>,
}

impl WriteThroughCache {
    pub fn new(cache1: Arc<dyn CacheInterface>, cache2: Arc<dyn CacheInterface>) -> Self {
        Self {
            cache1,
            cache2,
            cache1_limit: Arc::new(AtomicI64::new(UNLIMITED)),
        }
    }

    /// Largest `len(key) + len(value)` stored in L1; [`UNLIMITED`] for none
    pub fn set_cache1_limit(&self, limit: i64) {
        self.cache1_limit.store(limit, Ordering::Relaxed);
    }

    pub fn cache1_limit(&self) -> i64 {
        self.cache1_limit.load(Ordering::Relaxed)
    }

    pub fn cache1(&self) -> &Arc<dyn CacheInterface> {
        &self.cache1
    }

    pub fn cache2(&self) -> &Arc<dyn CacheInterface> {
        &self.cache2
    }

    pub fn format_name(cache1: &str, cache2: &str) -> String {
        format!("WriteThroughCache(L1={},L2={})", cache1, cache2)
    }
}

fn put_in_cache1(cache1: &dyn CacheInterface, limit: i64, key: &str, value: Bytes) {
    if limit == UNLIMITED || (key.len() + value.len()) as i64 <= limit {
        cache1.put(key, value);
    }
}

impl CacheInterface for WriteThroughCache {
    fn get(&self, key: &str, callback: Box<dyn CacheCallback>) {
        self.cache1.get(
            key,
            Box::new(Cache1Callback {
                key: key.to_string(),
                inner: callback,
                cache1: self.cache1.clone(),
                cache2: self.cache2.clone(),
                cache1_limit: self.cache1_limit.clone(),
            }),
        );
    }

    fn put(&self, key: &str, value: Bytes) {
        put_in_cache1(self.cache1.as_ref(), self.cache1_limit(), key, value.clone());
        self.cache2.put(key, value);
    }

    fn delete(&self, key: &str) {
        self.cache1.delete(key);
        self.cache2.delete(key);
    }

    fn name(&self) -> String {
        Self::format_name(&self.cache1.name(), &self.cache2.name())
    }

    fn is_blocking(&self) -> bool {
        self.cache1.is_blocking() && self.cache2.is_blocking()
    }

    fn is_healthy(&self) -> bool {
        self.cache1.is_healthy() && self.cache2.is_healthy()
    }

    fn shut_down(&self) {
        self.cache1.shut_down();
        self.cache2.shut_down();
    }
}

struct Cache1Callback {
    key: String,
    inner: Box<dyn CacheCallback>,
    cache1: Arc<dyn CacheInterface>,
    cache2: Arc<dyn CacheInterface>,
    cache1_limit: Arc<AtomicI64>,
}

impl CacheCallback for Cache1Callback {
    fn validate_candidate(&mut self, key: &str, state: KeyState, value: Option<&Bytes>) -> bool {
        self.inner.validate_candidate(key, state, value)
    }

    fn done(self: Box<Self>, state: KeyState, value: Option<Bytes>) {
        let this = *self;
        if state == KeyState::Available {
            this.inner.done(state, value);
            return;
        }
        let cache2 = this.cache2.clone();
        cache2.get(
            &this.key.clone(),
            Box::new(Cache2Callback {
                key: this.key,
                inner: this.inner,
                cache1: this.cache1,
                cache1_limit: this.cache1_limit,
            }),
        );
    }
}

struct Cache2Callback {
    key: String,
    inner: Box<dyn CacheCallback>,
    cache1: Arc<dyn CacheInterface>,
    cache1_limit: Arc<AtomicI64>,
}

impl CacheCallback for Cache2Callback {
    fn validate_candidate(&mut self, key: &str, state: KeyState, value: Option<&Bytes>) -> bool {
        self.inner.validate_candidate(key, state, value)
    }

    fn done(self: Box<Self>, state: KeyState, value: Option<Bytes>) {
        if let (KeyState::Available, Some(v)) = (state, &value) {
            let limit = self.cache1_limit.load(Ordering::Relaxed);
            put_in_cache1(self.cache1.as_ref(), limit, &self.key, v.clone());
        }
        self.inner.done(state, value);
    }
}
