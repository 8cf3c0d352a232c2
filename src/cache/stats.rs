//! Cache Stats Wrapper
//!
//! Instruments any cache primitive with hit/miss/insert/delete counters
//! and latency and size histograms, without changing its behavior.

use std::sync::Arc;

use bytes::Bytes;

use crate::cache::interface::{CacheCallback, CacheInterface, KeyCallback, KeyState};
use crate::error::Result;
use crate::stats::{Histogram, Statistics, Variable};
use crate::util::timer::Timer;

const GET_COUNT_HITS: &str = "_get_count_hits";
const GET_COUNT_MISSES: &str = "_get_count_misses";
const GET_LATENCY_US: &str = "_get_latency_us";
const INSERT_COUNT: &str = "_insert_count";
const INSERT_SIZE_BYTES: &str = "_insert_size_bytes";
const DELETES: &str = "_deletes";

/// Statistics-recording wrapper; every statistic is named `<prefix>_...`
pub struct CacheStats {
    prefix: String,
    cache: Arc<dyn CacheInterface>,
    timer: Arc<dyn Timer>,
    hits: Arc<dyn Variable>,
    misses: Arc<dyn Variable>,
    get_latency_us: Arc<dyn Histogram>,
    inserts: Arc<dyn Variable>,
    insert_size_bytes: Arc<dyn Histogram>,
    deletes: Arc<dyn Variable>,
}

impl CacheStats {
    pub fn new(
        prefix: impl Into<String>,
        cache: Arc<dyn CacheInterface>,
        timer: Arc<dyn Timer>,
        stats: &dyn Statistics,
    ) -> Self {
        let prefix = prefix.into();
        let name = |suffix: &str| format!("{}{}", prefix, suffix);
        Self {
            hits: stats.get_variable(&name(GET_COUNT_HITS)),
            misses: stats.get_variable(&name(GET_COUNT_MISSES)),
            get_latency_us: stats.get_histogram(&name(GET_LATENCY_US)),
            inserts: stats.get_variable(&name(INSERT_COUNT)),
            insert_size_bytes: stats.get_histogram(&name(INSERT_SIZE_BYTES)),
            deletes: stats.get_variable(&name(DELETES)),
            prefix,
            cache,
            timer,
        }
    }

    pub fn init_stats(prefix: &str, stats: &dyn Statistics) -> Result<()> {
        stats.add_variable(&format!("{}{}", prefix, GET_COUNT_HITS))?;
        stats.add_variable(&format!("{}{}", prefix, GET_COUNT_MISSES))?;
        stats.add_histogram(&format!("{}{}", prefix, GET_LATENCY_US))?;
        stats.add_variable(&format!("{}{}", prefix, INSERT_COUNT))?;
        stats.add_histogram(&format!("{}{}", prefix, INSERT_SIZE_BYTES))?;
        stats.add_variable(&format!("{}{}", prefix, DELETES))?;
        Ok(())
    }

    pub fn format_name(prefix: &str, cache: &str) -> String {
        format!("Stats(prefix={},cache={})", prefix, cache)
    }

    fn wrap(&self, callback: Box<dyn CacheCallback>) -> Box<dyn CacheCallback> {
        Box::new(StatsCallback {
            inner: callback,
            start_us: self.timer.now_us(),
            timer: self.timer.clone(),
            hits: self.hits.clone(),
            misses: self.misses.clone(),
            get_latency_us: self.get_latency_us.clone(),
        })
    }
}

impl CacheInterface for CacheStats {
    fn get(&self, key: &str, callback: Box<dyn CacheCallback>) {
        self.cache.get(key, self.wrap(callback));
    }

    fn multi_get(&self, request: Vec<KeyCallback>) {
        let wrapped = request
            .into_iter()
            .map(|kc| KeyCallback::new(kc.key, self.wrap(kc.callback)))
            .collect();
        self.cache.multi_get(wrapped);
    }

    fn put(&self, key: &str, value: Bytes) {
        self.inserts.add(1);
        self.insert_size_bytes.add(value.len() as f64);
        self.cache.put(key, value);
    }

    fn delete(&self, key: &str) {
        self.deletes.add(1);
        self.cache.delete(key);
    }

    fn name(&self) -> String {
        Self::format_name(&self.prefix, &self.cache.name())
    }

    fn is_blocking(&self) -> bool {
        self.cache.is_blocking()
    }

    fn is_healthy(&self) -> bool {
        self.cache.is_healthy()
    }

    fn shut_down(&self) {
        self.cache.shut_down();
    }
}

struct StatsCallback {
    inner: Box<dyn CacheCallback>,
    start_us: i64,
    timer: Arc<dyn Timer>,
    hits: Arc<dyn Variable>,
    misses: Arc<dyn Variable>,
    get_latency_us: Arc<dyn Histogram>,
}

impl CacheCallback for StatsCallback {
    fn validate_candidate(&mut self, key: &str, state: KeyState, value: Option<&Bytes>) -> bool {
        self.inner.validate_candidate(key, state, value)
    }

    fn done(self: Box<Self>, state: KeyState, value: Option<Bytes>) {
        let elapsed_us = self.timer.now_us() - self.start_us;
        self.get_latency_us.add(elapsed_us as f64);
        if state == KeyState::Available {
            self.hits.add(1);
        } else {
            self.misses.add(1);
        }
        self.inner.done(state, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::delay_cache::DelayCache;
    use crate::cache::lru::LruCache;
    use crate::cache::testing::{get_now, RecordingCallback};
    use crate::stats::SimpleStats;
    use crate::util::timer::MockTimer;

    #[test]
    fn test_counts_and_latency() {
        let timer = Arc::new(MockTimer::default());
        let stats = SimpleStats::new(timer.clone());
        CacheStats::init_stats("test", &stats).unwrap();
        let lru = Arc::new(LruCache::new(1000));
        let delay = Arc::new(DelayCache::new(lru));
        let cache = CacheStats::new("test", delay.clone(), timer.clone(), &stats);

        cache.put("k", Bytes::from_static(b"value"));
        assert_eq!(get_now(&cache, "k").value_str(), "value");
        assert_eq!(get_now(&cache, "missing").state(), Some(KeyState::NotFound));

        delay.delay_key("k");
        let cb = RecordingCallback::new();
        let result = cb.result();
        cache.get("k", Box::new(cb));
        timer.advance_us(250);
        delay.release_key("k");
        assert!(result.called());

        cache.delete("k");

        assert_eq!(stats.get_variable("test_get_count_hits").get(), 2);
        assert_eq!(stats.get_variable("test_get_count_misses").get(), 1);
        assert_eq!(stats.get_variable("test_insert_count").get(), 1);
        assert_eq!(stats.get_variable("test_deletes").get(), 1);
        let latency = stats.get_histogram("test_get_latency_us");
        assert_eq!(latency.count(), 3);
        assert_eq!(latency.maximum(), 250.0);
        assert_eq!(stats.get_histogram("test_insert_size_bytes").average(), 5.0);
    }

    #[test]
    fn test_name() {
        let stats = SimpleStats::new(Arc::new(MockTimer::default()));
        let cache = CacheStats::new(
            "l1",
            Arc::new(LruCache::new(10)),
            Arc::new(MockTimer::default()),
            &stats,
        );
        assert_eq!(cache.name(), "Stats(prefix=l1,cache=LRUCache)");
    }
}
