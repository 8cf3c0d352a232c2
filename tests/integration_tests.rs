//! PageCache Integration Tests
//!
//! Cross-module scenarios:
//! - HTTP cache over the primitive stack (put/find, fallback, fragments, versions)
//! - Write-through composition at the primitive and HTTP levels
//! - Batcher coalescing and its parallelism bound
//! - Purge file sharing between contexts
//! - Corruption detection below the HTTP layer
//! - Full stack assembly from configuration

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use proptest::prelude::*;

use pagecache::cache::testing::{get_now, CallbackResult, RecordingCallback};
use pagecache::cache::{
    CacheBatcher, CacheBatcherConfig, CacheInterface, CompressedCache, DelayCache, KeyState,
    LruCache, PurgeContext, PurgeOptions, WriteThroughCache,
};
use pagecache::http::headers::names::*;
use pagecache::http::testing::find_now;
use pagecache::http::{
    FetchResponseStatus, FindResult, HttpCache, HttpCacheCallback, HttpCacheInterface,
    RequestContext, RequestProperties, ResponseHeaders, WriteThroughHttpCache,
};
use pagecache::stats::{SimpleStats, Statistics};
use pagecache::util::file_system::MemFileSystem;
use pagecache::util::hasher::MockHasher;
use pagecache::util::named_lock::MemLockManager;
use pagecache::util::timer::{MockTimer, Timer};

const START_DATE: &str = "Sun, 16 Dec 1979 02:27:45 GMT";

fn response_headers(cache_control: &str) -> ResponseHeaders {
    let mut h = ResponseHeaders::with_status(200);
    h.add("name", "value");
    h.add(CACHE_CONTROL, cache_control);
    h.add(DATE, START_DATE);
    h
}

fn new_callback() -> HttpCacheCallback {
    HttpCacheCallback::new(RequestContext::new(true))
}

fn body_of(cb: &HttpCacheCallback) -> String {
    String::from_utf8_lossy(&cb.http_value.contents().unwrap()).into_owned()
}

// =============================================================================
// HTTP Cache
// =============================================================================

mod http_cache_tests {
    use super::*;

    struct Fixture {
        timer: Arc<MockTimer>,
        stats: Arc<SimpleStats>,
        cache: HttpCache,
    }

    fn fixture() -> Fixture {
        let timer = Arc::new(MockTimer::default());
        let stats = Arc::new(SimpleStats::new(timer.clone()));
        HttpCache::init_stats(stats.as_ref()).unwrap();
        let cache = HttpCache::new(
            Arc::new(LruCache::new(1_000_000)),
            timer.clone(),
            Arc::new(MockHasher::new()),
            stats.as_ref(),
        );
        Fixture {
            timer,
            stats,
            cache,
        }
    }

    fn put(cache: &dyn HttpCacheInterface, key: &str, fragment: &str, mut h: ResponseHeaders, body: &str) {
        assert!(cache.put(
            key,
            fragment,
            RequestProperties::default(),
            false,
            &mut h,
            body.as_bytes()
        ));
    }

    #[test]
    fn test_simple_put_get() {
        let f = fixture();
        let url = "http://www.test.com/";
        put(&f.cache, url, "www.test.com", response_headers("max-age=300"), "content");

        let (result, cb) = find_now(&f.cache, url, "www.test.com", new_callback());
        assert_eq!(result, FindResult::found());
        assert_eq!(cb.response_headers.lookup1("name"), Some("value"));
        assert_eq!(cb.response_headers.lookup1(ETAG), Some("W/\"0\""));
        assert_eq!(body_of(&cb), "content");

        f.timer.advance_ms(301 * 1000);
        let (result, cb) = find_now(&f.cache, url, "www.test.com", new_callback());
        assert_eq!(result, FindResult::not_found());
        assert!(cb.http_value.is_empty());
        let fallback = cb.fallback_http_value.contents().unwrap();
        assert_eq!(&fallback[..], b"content");

        let rejecting = new_callback().with_is_cache_valid(|_, _| false);
        let (result, cb) = find_now(&f.cache, url, "www.test.com", rejecting);
        assert_eq!(result, FindResult::not_found());
        assert!(cb.fallback_http_value.is_empty());
    }

    #[test]
    fn test_cookies_stripped() {
        let f = fixture();
        let url = "http://www.test.com/";
        let mut h = response_headers("max-age=300");
        h.add(SET_COOKIE, "cookies!");
        put(&f.cache, url, "", h, "content");

        let (result, cb) = find_now(&f.cache, url, "", new_callback());
        assert!(result.is_found());
        assert!(cb.response_headers.lookup(SET_COOKIE).is_empty());
    }

    #[test]
    fn test_fragments() {
        let f = fixture();
        put(&f.cache, "http://x/", "fragA", response_headers("max-age=300"), "a");
        let (result, _) = find_now(&f.cache, "http://x/", "fragB", new_callback());
        assert_eq!(result, FindResult::not_found());
    }

    #[test]
    fn test_versioning() {
        let f = fixture();
        put(&f.cache, "http://x/", "", response_headers("max-age=300"), "a");
        f.cache.set_version(2);
        let (result, _) = find_now(&f.cache, "http://x/", "", new_callback());
        assert_eq!(result, FindResult::not_found());
    }

    #[test]
    fn test_remembered_failure_expires() {
        let f = fixture();
        let url = "http://www.test.com/missing";
        f.cache
            .remember_failure(url, "", FetchResponseStatus::UncacheableError);
        let ttl_ms = f
            .cache
            .settings()
            .failure_caching_ttl_sec(FetchResponseStatus::UncacheableError)
            * 1000;

        f.timer.advance_ms(ttl_ms - 1);
        assert_eq!(
            find_now(&f.cache, url, "", new_callback()).0,
            FindResult::recent_failure(FetchResponseStatus::UncacheableError)
        );
        f.timer.advance_ms(2);
        assert_eq!(
            find_now(&f.cache, url, "", new_callback()).0,
            FindResult::not_found()
        );
    }

    #[test]
    fn test_counters() {
        let f = fixture();
        let url = "http://www.test.com/";
        put(&f.cache, url, "", response_headers("max-age=300"), "content");
        find_now(&f.cache, url, "", new_callback());
        find_now(&f.cache, "http://www.test.com/other", "", new_callback());
        let stat = |name: &str| f.stats.get_variable(name).get();
        assert_eq!(stat("cache_inserts"), 1);
        assert_eq!(stat("cache_hits"), 1);
        assert_eq!(stat("cache_misses"), 1);
        assert_eq!(stat("cache_backend_hits"), 1);
        assert_eq!(stat("cache_backend_misses"), 1);
    }

    #[test]
    fn test_find_async_blocking() {
        let f = fixture();
        let url = "http://www.test.com/blocking";
        put(&f.cache, url, "", response_headers("max-age=300"), "content");
        let (result, cb) =
            tokio_test::block_on(f.cache.find_async(url, "", new_callback())).unwrap();
        assert!(result.is_found());
        assert_eq!(body_of(&cb), "content");
    }

    proptest! {
        #[test]
        fn prop_put_then_find_returns_body(body in "[ -~]{0,200}", max_age in 1i64..100_000) {
            let f = fixture();
            let url = "http://www.test.com/prop";
            put(&f.cache, url, "", response_headers(&format!("max-age={}", max_age)), &body);

            let (result, cb) = find_now(&f.cache, url, "", new_callback());
            prop_assert!(result.is_found());
            prop_assert_eq!(body_of(&cb), body.clone());
            prop_assert!(cb.response_headers.has(ETAG));
            let expected_cache_control = format!("max-age={}", max_age);
            prop_assert!(cb.response_headers.has_value(CACHE_CONTROL, &expected_cache_control));

            f.timer.advance_ms(max_age * 1000 + 1);
            let (result, cb) = find_now(&f.cache, url, "", new_callback());
            prop_assert_eq!(result, FindResult::not_found());
            prop_assert_eq!(&cb.fallback_http_value.contents().unwrap()[..], body.as_bytes());
        }

        #[test]
        fn prop_version_bump_hides_everything(keys in proptest::collection::hash_set("[a-z]{1,8}", 1..10), version in 0u32..100) {
            let f = fixture();
            f.cache.set_version(version);
            for key in &keys {
                put(&f.cache, &format!("http://x.com/{}", key), "", response_headers("max-age=300"), key);
            }
            f.cache.set_version(version + 1);
            for key in &keys {
                let (result, _) = find_now(&f.cache, &format!("http://x.com/{}", key), "", new_callback());
                prop_assert_eq!(result, FindResult::not_found());
            }
        }
    }
}

// =============================================================================
// Write-Through
// =============================================================================

mod write_through_tests {
    use super::*;

    const KEY: &str = "http://www.example.com/some/path/key1";

    #[test]
    fn test_primitive_size_cap() {
        assert_eq!(KEY.len(), 37);
        let l1 = Arc::new(LruCache::new(1000));
        let l2 = Arc::new(LruCache::new(1000));
        let cache = WriteThroughCache::new(l1.clone(), l2.clone());
        cache.set_cache1_limit((KEY.len() + "Name".len()) as i64);

        cache.put(KEY, Bytes::from_static(b"Name"));
        assert!(l1.contains(KEY));
        assert!(l2.contains(KEY));

        let big_key = "http://www.example.com/some/path/key2";
        cache.put(big_key, Bytes::from_static(b"TooBigForCache1"));
        assert!(!l1.contains(big_key));
        assert!(l2.contains(big_key));

        assert_eq!(get_now(&cache, KEY).value_str(), "Name");
        assert_eq!(l1.num_hits(), 1);
        assert_eq!(get_now(&cache, big_key).value_str(), "TooBigForCache1");
        assert_eq!(l2.num_hits(), 1);
    }

    #[test]
    fn test_l2_hit_fills_l1() {
        let l1 = Arc::new(LruCache::new(1000));
        let l2 = Arc::new(LruCache::new(1000));
        let cache = WriteThroughCache::new(l1.clone(), l2.clone());
        l2.put(KEY, Bytes::from_static(b"value"));
        assert_eq!(get_now(&cache, KEY).value_str(), "value");
        assert!(l1.contains(KEY));
    }

    #[test]
    fn test_http_size_limit() {
        let timer = Arc::new(MockTimer::default());
        let stats = Arc::new(SimpleStats::new(timer.clone()));
        HttpCache::init_stats(stats.as_ref()).unwrap();
        let l1 = Arc::new(LruCache::new(100_000));
        let l2 = Arc::new(LruCache::new(100_000));
        let cache = WriteThroughHttpCache::new(
            l1.clone(),
            l2.clone(),
            timer.clone(),
            Arc::new(MockHasher::new()),
            stats.as_ref(),
        );

        let mut h = response_headers("max-age=300");
        cache.put(KEY, "", RequestProperties::default(), false, &mut h, b"Name");
        let small_size = get_now(l2.as_ref(), KEY).value().unwrap().len();
        cache.delete(KEY, "");
        l2.clear_stats();
        cache.set_cache1_size_limit((KEY.len() + small_size + 1) as i64);

        let big_key = "http://www.example.com/some/path/key2";
        let mut h = response_headers("max-age=300");
        cache.put(KEY, "", RequestProperties::default(), false, &mut h, b"Name");
        let mut h = response_headers("max-age=300");
        cache.put(big_key, "", RequestProperties::default(), false, &mut h, b"TooBigForCache1");
        assert!(l1.contains(KEY));
        assert!(!l1.contains(big_key));
        assert!(l2.contains(big_key));

        let (result, cb) = find_now(&cache, KEY, "", new_callback());
        assert!(result.is_found());
        assert_eq!(body_of(&cb), "Name");
        assert_eq!(l2.num_hits(), 0);

        let (result, cb) = find_now(&cache, big_key, "", new_callback());
        assert!(result.is_found());
        assert_eq!(body_of(&cb), "TooBigForCache1");
        assert_eq!(l2.num_hits(), 1);
        assert!(!l1.contains(big_key));
    }
}

// =============================================================================
// Batcher
// =============================================================================

mod batcher_tests {
    use super::*;

    fn start_get(cache: &dyn CacheInterface, key: &str) -> CallbackResult {
        let cb = RecordingCallback::new();
        let result = cb.result();
        cache.get(key, Box::new(cb));
        result
    }

    fn setup(max_parallel_lookups: usize) -> (Arc<LruCache>, Arc<DelayCache>, CacheBatcher) {
        let stats = SimpleStats::new(Arc::new(MockTimer::default()));
        CacheBatcher::init_stats(&stats).unwrap();
        let lru = Arc::new(LruCache::new(10_000));
        let delay = Arc::new(DelayCache::new(lru.clone()));
        let batcher = CacheBatcher::with_config(
            delay.clone(),
            CacheBatcherConfig {
                max_parallel_lookups,
                max_pending_gets: 1_000_000,
            },
            &stats,
        );
        (lru, delay, batcher)
    }

    #[test]
    fn test_coalesce_then_queue() {
        let (lru, delay, batcher) = setup(1);
        lru.put("k1", Bytes::from_static(b"v1"));
        lru.put("k2", Bytes::from_static(b"v2"));
        delay.delay_key("k1");
        delay.delay_key("k2");

        let cb1 = start_get(&batcher, "k1");
        let cb2 = start_get(&batcher, "k1");
        let cb3 = start_get(&batcher, "k2");
        assert_eq!(batcher.num_in_flight_keys(), 1);
        assert_eq!(batcher.num_queued_keys(), 1);

        delay.release_key("k1");
        assert_eq!(cb1.value_str(), "v1");
        assert_eq!(cb2.value_str(), "v1");
        assert!(!cb3.called());
        assert_eq!(delay.num_held("k2"), 1);

        delay.release_key("k2");
        assert_eq!(cb3.value_str(), "v2");
        assert_eq!(lru.num_hits(), 2);
    }

    #[test]
    fn test_coalesced_miss_then_fill() {
        let (lru, delay, batcher) = setup(2);
        delay.delay_key("k");
        let waiters: Vec<_> = (0..5).map(|_| start_get(&batcher, "k")).collect();
        assert_eq!(delay.num_held("k"), 1);
        delay.release_key("k");
        for waiter in &waiters {
            assert_eq!(waiter.state(), Some(KeyState::NotFound));
        }
        assert_eq!(lru.num_misses(), 1);

        batcher.put("k", Bytes::from_static(b"filled"));
        assert_eq!(get_now(&batcher, "k").value_str(), "filled");
    }

    proptest! {
        #[test]
        fn prop_in_flight_groups_bounded(
            max_parallel in 1usize..4,
            keys in proptest::collection::vec(0usize..6, 1..40),
        ) {
            let (lru, delay, batcher) = setup(max_parallel);
            let names: Vec<String> = (0..6).map(|i| format!("k{}", i)).collect();
            for name in &names {
                lru.put(name, Bytes::from(name.clone()));
                delay.delay_key(name);
            }

            let mut results = Vec::new();
            for &k in &keys {
                results.push((k, start_get(&batcher, &names[k])));
                prop_assert!(batcher.num_in_flight_groups() <= max_parallel);
            }

            for _ in 0..names.len() * 2 {
                for name in &names {
                    delay.release_key(name);
                    prop_assert!(batcher.num_in_flight_groups() <= max_parallel);
                }
            }
            prop_assert_eq!(batcher.num_pending_gets(), 0);
            for (k, result) in &results {
                prop_assert_eq!(result.value_str(), names[*k].clone());
            }
        }
    }
}

// =============================================================================
// Purge
// =============================================================================

mod purge_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PURGE_FILE: &str = "/cache/cache.flush";

    struct Fixture {
        timer: Arc<MockTimer>,
        fs: Arc<MemFileSystem>,
        stats: Arc<SimpleStats>,
        locks: MemLockManager,
    }

    impl Fixture {
        fn new() -> Self {
            let timer = Arc::new(MockTimer::default());
            let stats = Arc::new(SimpleStats::new(timer.clone()));
            PurgeContext::init_stats(stats.as_ref()).unwrap();
            Self {
                fs: Arc::new(MemFileSystem::new(timer.clone())),
                locks: MemLockManager::new(timer.clone()),
                timer,
                stats,
            }
        }

        fn context(&self) -> Arc<PurgeContext> {
            Arc::new(PurgeContext::new(
                PURGE_FILE,
                self.fs.clone(),
                self.timer.clone(),
                &self.locks,
                PurgeOptions::default(),
                self.stats.as_ref(),
            ))
        }
    }

    #[test]
    fn test_purge_file_semantics() {
        let f = Fixture::new();
        f.fs.write_raw(Path::new(PURGE_FILE), b"400000\n500000 a\n");
        let context = f.context();
        context.poll_file_system();
        assert!(!context.is_valid("a", 499_999));
        assert!(context.is_valid("a", 500_001));
        assert!(!context.is_valid("b", 399_999));
        assert!(context.is_valid("b", 400_001));
    }

    #[test]
    fn test_purge_reaches_http_cache_in_other_process() {
        let f = Fixture::new();
        let writer = f.context();
        let reader = f.context();

        let stats = SimpleStats::new(f.timer.clone());
        let cache = HttpCache::new(
            Arc::new(LruCache::new(100_000)),
            f.timer.clone(),
            Arc::new(MockHasher::new()),
            &stats,
        );
        cache.set_purge_context(Some(reader));
        let url = "http://www.test.com/purged";
        let mut h = response_headers("max-age=300");
        assert!(cache.put(url, "", RequestProperties::default(), false, &mut h, b"body"));
        assert!(find_now(&cache, url, "", new_callback()).0.is_found());

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        writer.add_purge_url(
            url,
            f.timer.now_ms(),
            Box::new(move |ok, _| {
                assert!(ok);
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let (result, cb) = find_now(&cache, url, "", new_callback());
        assert_eq!(result, FindResult::not_found());
        assert!(cb.fallback_http_value.is_empty());

        // Entries written after the purge are valid again.
        f.timer.advance_ms(1_000);
        let mut h = ResponseHeaders::with_status(200);
        h.set_date_and_caching(f.timer.now_ms(), 300_000);
        assert!(cache.put(url, "", RequestProperties::default(), false, &mut h, b"fresh"));
        let (result, cb) = find_now(&cache, url, "", new_callback());
        assert!(result.is_found());
        assert_eq!(body_of(&cb), "fresh");
    }

    #[test]
    fn test_round_trip_preserves_entries() {
        let f = Fixture::new();
        let writer = f.context();
        let ok = || -> pagecache::cache::PurgeCallback { Box::new(|ok, reason| assert!(ok, "{}", reason)) };
        writer.set_cache_purge_global_timestamp_ms(1_000, ok());
        writer.add_purge_url("a", 2_000, ok());
        writer.add_purge_url("b", 3_000, ok());

        let reader = f.context();
        reader.poll_file_system();
        let set = reader.purge_set();
        assert_eq!(set.global_invalidation_timestamp_ms(), 1_000);
        let mut entries: Vec<(String, i64)> =
            set.iter().map(|(url, ts)| (url.to_string(), ts)).collect();
        entries.sort();
        assert_eq!(entries, vec![("a".to_string(), 2_000), ("b".to_string(), 3_000)]);
    }
}

// =============================================================================
// Corruption
// =============================================================================

mod corruption_tests {
    use super::*;

    proptest! {
        #[test]
        fn prop_single_bit_flip_is_a_miss(
            body in "[a-z ]{1,300}",
            level in 0u32..10,
            bit in any::<prop::sample::Index>(),
        ) {
            let timer = Arc::new(MockTimer::default());
            let stats = SimpleStats::new(timer.clone());
            let lru = Arc::new(LruCache::new(100_000));
            let compressed = Arc::new(CompressedCache::new(lru.clone(), &stats));
            compressed.set_compression_level(level);
            let cache = HttpCache::new(compressed.clone(), timer, Arc::new(MockHasher::new()), &stats);

            let url = "http://www.test.com/corrupt";
            let mut h = response_headers("max-age=300");
            prop_assert!(cache.put(url, "", RequestProperties::default(), false, &mut h, body.as_bytes()));
            prop_assert!(find_now(&cache, url, "", new_callback()).0.is_found());

            let stored = get_now(lru.as_ref(), url).value().unwrap();
            let mut mutated = stored.to_vec();
            let bit = bit.index(mutated.len() * 8);
            mutated[bit / 8] ^= 1 << (bit % 8);
            lru.put(url, Bytes::from(mutated));

            let (result, _) = find_now(&cache, url, "", new_callback());
            prop_assert_eq!(result, FindResult::not_found());
            prop_assert_eq!(compressed.corrupt_payloads(), 1);
        }
    }
}

// =============================================================================
// Full Stack
// =============================================================================

mod system_tests {
    use super::*;
    use pagecache::config::CacheSystemConfig;
    use pagecache::system::{CacheSystem, SystemDependencies};

    fn build(yaml: &str) -> (Arc<MockTimer>, CacheSystem) {
        let timer = Arc::new(MockTimer::default());
        let deps = SystemDependencies {
            timer: timer.clone(),
            stats: Arc::new(SimpleStats::new(timer.clone())),
            file_system: Arc::new(MemFileSystem::new(timer.clone())),
            hasher: Arc::new(MockHasher::new()),
        };
        let config = CacheSystemConfig::from_yaml_str(yaml).unwrap();
        (timer, CacheSystem::with_dependencies(config, deps).unwrap())
    }

    #[test]
    fn test_two_tier_compressed_stack() {
        let (timer, system) = build(
            r#"
lru:
  l1_max_bytes: 100000
  l2_max_bytes: 1000000
http:
  compression_level: 9
"#,
        );
        let url = "http://www.test.com/style.css";
        let mut h = response_headers("max-age=300");
        h.add(CONTENT_TYPE, "text/css");
        let css = ".a { color: red }\n".repeat(40);
        let http = system.http_cache();
        assert!(http.put(url, "", RequestProperties::default(), false, &mut h, css.as_bytes()));

        let plain_client = HttpCacheCallback::new(RequestContext::new(false));
        let (result, cb) = find_now(http.as_ref(), url, "", plain_client);
        assert!(result.is_found());
        assert!(!cb.response_headers.is_gzipped());
        assert_eq!(body_of(&cb), css);

        system.l1().clear();
        let (result, _) = find_now(http.as_ref(), url, "", new_callback());
        assert!(result.is_found());
        assert!(system.l1().contains(url));

        timer.advance_ms(301 * 1000);
        let (result, cb) = find_now(http.as_ref(), url, "", new_callback());
        assert_eq!(result, FindResult::not_found());
        assert!(!cb.fallback_http_value.is_empty());
    }

    #[tokio::test]
    async fn test_find_async_through_stack() {
        let (_, system) = build("{}");
        let url = "http://www.test.com/async";
        let mut h = response_headers("max-age=300");
        system
            .http_cache()
            .put(url, "", RequestProperties::default(), false, &mut h, b"async body");

        let (result, cb) = system
            .http_cache()
            .find_async(url, "", new_callback())
            .await
            .unwrap();
        assert!(result.is_found());
        assert_eq!(body_of(&cb), "async body");

        system.shut_down();
        let (result, _) = system
            .http_cache()
            .find_async(url, "", new_callback())
            .await
            .unwrap();
        assert_eq!(result, FindResult::not_found());
    }
}
