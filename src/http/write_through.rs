//! Write-Through HTTP Cache
//!
//! Two HTTP caches sharing one settings object.
//!
//! # Architecture
//!
//! ```text
//!   find ──▶ L1 ──found──▶ caller
//!             │
//!           miss (keep L1 fallback, stats deferred)
//!             ▼
//!            L2 ──found──▶ reinsert into L1 (size limit permitting) ──▶ caller
//!             │
//!           miss ──▶ L2 fallback, else L1 fallback ──▶ caller
//! ```
//!
//! Puts are prepared once and written to L2, then to L1 when
//! `len(key) + len(fragment) + len(value)` is below the L1 size limit.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::cache::interface::CacheInterface;
use crate::http::callback::{DoneFn, HttpCacheCallback};
use crate::http::fetch_status::{FetchResponseStatus, FindResult};
use crate::http::headers::{RequestProperties, ResponseHeaders};
use crate::http::http_cache::{HttpCache, HttpCacheInterface, HttpCacheSettings};
use crate::http::value::HttpValue;
use crate::stats::Statistics;
use crate::util::hasher::ContentHasher;
use crate::util::timer::Timer;

/// L1 size limit meaning "no limit"
pub const UNLIMITED: i64 = -1;

/// L1/L2 HTTP cache
pub struct WriteThroughHttpCache {
    cache1: HttpCache,
    cache2: HttpCache,
    cache1_size_limit: Arc<AtomicI64>,
}

impl WriteThroughHttpCache {
    pub fn new(
        cache1: Arc<dyn CacheInterface>,
        cache2: Arc<dyn CacheInterface>,
        timer: Arc<dyn Timer>,
        hasher: Arc<dyn ContentHasher>,
        stats: &dyn Statistics,
    ) -> Self {
        Self::with_settings(
            cache1,
            cache2,
            timer,
            hasher,
            Arc::new(HttpCacheSettings::default()),
            stats,
        )
    }

    pub fn with_settings(
        cache1: Arc<dyn CacheInterface>,
        cache2: Arc<dyn CacheInterface>,
        timer: Arc<dyn Timer>,
        hasher: Arc<dyn ContentHasher>,
        settings: Arc<HttpCacheSettings>,
        stats: &dyn Statistics,
    ) -> Self {
        Self {
            cache1: HttpCache::with_settings(
                cache1,
                timer.clone(),
                hasher.clone(),
                settings.clone(),
                stats,
            ),
            cache2: HttpCache::with_settings(cache2, timer, hasher, settings, stats),
            cache1_size_limit: Arc::new(AtomicI64::new(UNLIMITED)),
        }
    }

    pub fn cache1(&self) -> &HttpCache {
        &self.cache1
    }

    pub fn cache2(&self) -> &HttpCache {
        &self.cache2
    }

    pub fn set_cache1_size_limit(&self, limit: i64) {
        self.cache1_size_limit.store(limit, Ordering::Relaxed);
    }

    pub fn cache1_size_limit(&self) -> i64 {
        self.cache1_size_limit.load(Ordering::Relaxed)
    }

    pub fn set_version(&self, version: u32) {
        self.settings().set_version(version);
    }

    fn put_in_cache1(&self, key: &str, fragment: &str, start_us: i64, value: &HttpValue) {
        put_in_cache1(&self.cache1, self.cache1_size_limit(), key, fragment, start_us, value);
    }
}

fn put_in_cache1(
    cache1: &HttpCache,
    limit: i64,
    key: &str,
    fragment: &str,
    start_us: i64,
    value: &HttpValue,
) {
    let size = (key.len() + fragment.len() + value.size()) as i64;
    if limit == UNLIMITED || size < limit {
        cache1.put_internal(key, fragment, start_us, value);
    } else {
        debug!(key, size, limit, "Skipping L1 for oversized value");
    }
}

fn deliver(user_done: Option<DoneFn>, result: FindResult, callback: HttpCacheCallback) {
    if let Some(done) = user_done {
        done(result, callback);
    }
}

impl HttpCacheInterface for WriteThroughHttpCache {
    fn find(&self, key: &str, fragment: &str, mut callback: HttpCacheCallback) {
        let user_done = callback.take_on_done();
        callback.set_update_stats_on_failure(false);

        let cache1 = self.cache1.clone();
        let cache2 = self.cache2.clone();
        let limit = self.cache1_size_limit.clone();
        let key_owned = key.to_string();
        let fragment_owned = fragment.to_string();

        callback.set_on_done(Box::new(move |result: FindResult, mut cb: HttpCacheCallback| {
            if result.is_found() {
                deliver(user_done, result, cb);
                return;
            }
            let fallback1 = std::mem::take(&mut cb.fallback_http_value);
            cb.set_update_stats_on_failure(true);
            let (key, fragment) = (key_owned.clone(), fragment_owned.clone());
            cb.set_on_done(Box::new(move |result: FindResult, mut cb: HttpCacheCallback| {
                if result.is_found() {
                    let start_us = cache1.timer().now_us();
                    put_in_cache1(
                        &cache1,
                        limit.load(Ordering::Relaxed),
                        &key,
                        &fragment,
                        start_us,
                        &cb.http_value,
                    );
                } else if cb.fallback_http_value.is_empty() && !fallback1.is_empty() {
                    cb.fallback_http_value = fallback1;
                    cache1.cache_fallbacks().add(1);
                }
                deliver(user_done, result, cb);
            }));
            cache2.find(&key_owned, &fragment_owned, cb);
        }));
        self.cache1.find(key, fragment, callback);
    }

    fn put(
        &self,
        key: &str,
        fragment: &str,
        request: RequestProperties,
        respect_vary_on_resources: bool,
        headers: &mut ResponseHeaders,
        body: &[u8],
    ) -> bool {
        let start_us = self.cache1.timer().now_us();
        let value = match self.cache1.prepare_put(
            key,
            fragment,
            request,
            respect_vary_on_resources,
            headers,
            body,
        ) {
            Some(value) => value,
            None => return false,
        };
        self.cache2.put_internal(key, fragment, start_us, &value);
        self.put_in_cache1(key, fragment, start_us, &value);
        self.cache1.add_insert();
        true
    }

    fn delete(&self, key: &str, fragment: &str) {
        self.cache1.delete(key, fragment);
        self.cache2.delete(key, fragment);
    }

    fn remember_failure(&self, key: &str, fragment: &str, fetch_status: FetchResponseStatus) {
        let start_us = self.cache1.timer().now_us();
        if let Some(value) = self.cache1.prepare_failure(key, fragment, fetch_status) {
            self.cache2.put_internal(key, fragment, start_us, &value);
            self.put_in_cache1(key, fragment, start_us, &value);
            self.cache1.add_insert();
        }
    }

    fn settings(&self) -> &Arc<HttpCacheSettings> {
        self.cache1.settings()
    }

    fn name(&self) -> String {
        format!(
            "WriteThroughHTTPCache(L1={},L2={})",
            self.cache1.cache().name(),
            self.cache2.cache().name()
        )
    }
}
