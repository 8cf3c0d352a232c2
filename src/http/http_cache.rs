//! HTTP Cache
//!
//! HTTP semantics layered on a cache primitive: cacheability on put,
//! freshness and fallback on find, remembered fetch failures, Vary and
//! override-TTL handling, synthesized Etags, versioning and fragments.
//!
//! # Architecture
//!
//! ```text
//!   find(url, fragment, cb)
//!        │  key = version_prefix + fragment + "/" + url
//!        ▼
//!   ┌──────────────┐  validate_candidate (once per level)  ┌─────────────┐
//!   │ CacheInterface│ ───────────────────────────────────▶ │ FindCallback │
//!   └──────────────┘                                       └──────┬──────┘
//!                                  parse ▸ proxy-cacheable ▸ IsCacheValid
//!                                  ▸ override TTL ▸ expiry / IsFresh ▸ purge
//!                                         │
//!                         found / recent failure / miss (+ fallback)
//!                                         ▼
//!                                 HttpCacheCallback::done
//! ```
//!
//! # Design
//!
//! - Settings live in [`HttpCacheSettings`], shared by reference between
//!   the two tiers of a [`WriteThroughHttpCache`] so a single mutation
//!   reaches both.
//! - Validation runs inside the primitive's candidate hook, so a stale or
//!   rejected entry at L1 falls through to L2 of a primitive write-through
//!   stack without an extra round trip.
//! - Errors never escape: parse failures are backend misses, gzip failures
//!   keep the value as stored.
//!
//! [`WriteThroughHttpCache`]: crate::http::WriteThroughHttpCache

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::interface::{CacheCallback, CacheInterface, KeyState};
use crate::cache::purge_context::PurgeContext;
use crate::error::{Error, Result};
use crate::http::callback::HttpCacheCallback;
use crate::http::fetch_status::{
    decode_failure_caching_status, encode_failure_caching_status, FailureCachingTtlSec,
    FetchResponseStatus, FindResult,
};
use crate::http::gzip::{gzip_value, ungzip_value_if_compressed};
use crate::http::headers::names::ETAG;
use crate::http::headers::{
    RequestProperties, ResponseHeaders, DEFAULT_IMPLICIT_CACHE_TTL_MS, HTTP_OK,
};
use crate::http::value::HttpValue;
use crate::stats::{Statistics, Variable};
use crate::util::hasher::ContentHasher;
use crate::util::timer::Timer;
use crate::util::wildcard::WildcardGroup;

pub const CACHE_TIME_US: &str = "cache_time_us";
pub const CACHE_HITS: &str = "cache_hits";
pub const CACHE_MISSES: &str = "cache_misses";
pub const CACHE_BACKEND_HITS: &str = "cache_backend_hits";
pub const CACHE_BACKEND_MISSES: &str = "cache_backend_misses";
pub const CACHE_FALLBACKS: &str = "cache_fallbacks";
pub const CACHE_EXPIRATIONS: &str = "cache_expirations";
pub const CACHE_INSERTS: &str = "cache_inserts";
pub const CACHE_DELETES: &str = "cache_deletes";
pub const CACHE_SYNTHESIZED_ETAGS: &str = "cache_synthesized_etags";

/// Content length limit meaning "no limit"
pub const CACHE_SIZE_UNLIMITED: i64 = -1;

// =============================================================================
// Options
// =============================================================================

/// One entry of the cacheable-URL rule list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlRule {
    Allow(String),
    Disallow(String),
}

/// HTTP cache options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpCacheOptions {
    /// Cache everything, ignoring expiry and cacheability
    pub force_caching: bool,
    /// Refuse HTML fetched over https
    pub disable_html_caching_on_https: bool,
    /// Drop puts of non-200 responses, including remembered failures
    pub ignore_failure_puts: bool,
    /// Gzip level for compressible bodies; 0 stores bodies inflated
    pub compression_level: u32,
    /// TTL for default-cacheable responses without caching headers
    pub implicit_cache_ttl_ms: i64,
    /// Largest cacheable body; -1 for unlimited
    pub max_cacheable_response_content_length: i64,
    /// How long each failure class is remembered
    pub failure_caching_ttl_sec: FailureCachingTtlSec,
    /// Key version; entries under other versions are unreachable
    pub version: Option<u32>,
    /// Number of cache levels a find consults
    pub cache_levels: u32,
    /// Allow/disallow rules gating which URLs may be cached, written as
    /// `- allow: "<pattern>"` entries
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub cacheable_urls: Vec<UrlRule>,
}

impl Default for HttpCacheOptions {
    fn default() -> Self {
        Self {
            force_caching: false,
            disable_html_caching_on_https: false,
            ignore_failure_puts: false,
            compression_level: 0,
            implicit_cache_ttl_ms: DEFAULT_IMPLICIT_CACHE_TTL_MS,
            max_cacheable_response_content_length: CACHE_SIZE_UNLIMITED,
            failure_caching_ttl_sec: FailureCachingTtlSec::default(),
            version: None,
            cache_levels: 1,
            cacheable_urls: Vec::new(),
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Mutable settings shared by every tier of an HTTP cache
#[derive(Debug)]
pub struct HttpCacheSettings {
    force_caching: AtomicBool,
    disable_html_caching_on_https: AtomicBool,
    ignore_failure_puts: AtomicBool,
    compression_level: AtomicU32,
    implicit_cache_ttl_ms: AtomicI64,
    max_cacheable_response_content_length: AtomicI64,
    failure_caching_ttl_sec: RwLock<FailureCachingTtlSec>,
    version_prefix: RwLock<String>,
    cacheable_urls: RwLock<WildcardGroup>,
    purge_context: RwLock<Option<Arc<PurgeContext>>>,
}

impl Default for HttpCacheSettings {
    fn default() -> Self {
        Self::from_options(&HttpCacheOptions::default())
    }
}

impl HttpCacheSettings {
    pub fn from_options(options: &HttpCacheOptions) -> Self {
        let mut cacheable_urls = WildcardGroup::new();
        for rule in &options.cacheable_urls {
            match rule {
                UrlRule::Allow(pattern) => cacheable_urls.allow(pattern),
                UrlRule::Disallow(pattern) => cacheable_urls.disallow(pattern),
            }
        }
        let settings = Self {
            force_caching: AtomicBool::new(options.force_caching),
            disable_html_caching_on_https: AtomicBool::new(options.disable_html_caching_on_https),
            ignore_failure_puts: AtomicBool::new(options.ignore_failure_puts),
            compression_level: AtomicU32::new(options.compression_level.min(9)),
            implicit_cache_ttl_ms: AtomicI64::new(options.implicit_cache_ttl_ms),
            max_cacheable_response_content_length: AtomicI64::new(CACHE_SIZE_UNLIMITED),
            failure_caching_ttl_sec: RwLock::new(options.failure_caching_ttl_sec),
            version_prefix: RwLock::new(String::new()),
            cacheable_urls: RwLock::new(cacheable_urls),
            purge_context: RwLock::new(None),
        };
        settings.set_max_cacheable_response_content_length(
            options.max_cacheable_response_content_length,
        );
        if let Some(version) = options.version {
            settings.set_version(version);
        }
        settings
    }

    pub fn force_caching(&self) -> bool {
        self.force_caching.load(Ordering::Relaxed)
    }

    pub fn set_force_caching(&self, force: bool) {
        self.force_caching.store(force, Ordering::Relaxed);
    }

    pub fn disable_html_caching_on_https(&self) -> bool {
        self.disable_html_caching_on_https.load(Ordering::Relaxed)
    }

    pub fn set_disable_html_caching_on_https(&self, disable: bool) {
        self.disable_html_caching_on_https
            .store(disable, Ordering::Relaxed);
    }

    pub fn ignore_failure_puts(&self) -> bool {
        self.ignore_failure_puts.load(Ordering::Relaxed)
    }

    /// Drop later non-200 puts; entries already stored stay
    pub fn set_ignore_failure_puts(&self) {
        self.ignore_failure_puts.store(true, Ordering::Relaxed);
    }

    pub fn compression_level(&self) -> u32 {
        self.compression_level.load(Ordering::Relaxed)
    }

    pub fn set_compression_level(&self, level: u32) {
        self.compression_level.store(level.min(9), Ordering::Relaxed);
    }

    pub fn implicit_cache_ttl_ms(&self) -> i64 {
        self.implicit_cache_ttl_ms.load(Ordering::Relaxed)
    }

    pub fn set_implicit_cache_ttl_ms(&self, ttl_ms: i64) {
        self.implicit_cache_ttl_ms.store(ttl_ms, Ordering::Relaxed);
    }

    pub fn max_cacheable_response_content_length(&self) -> i64 {
        self.max_cacheable_response_content_length
            .load(Ordering::Relaxed)
    }

    /// Values below [`CACHE_SIZE_UNLIMITED`] are ignored
    pub fn set_max_cacheable_response_content_length(&self, length: i64) {
        if length >= CACHE_SIZE_UNLIMITED {
            self.max_cacheable_response_content_length
                .store(length, Ordering::Relaxed);
        } else {
            warn!(length, "Ignoring invalid max cacheable content length");
        }
    }

    pub fn is_cacheable_body_size(&self, size: usize) -> bool {
        let max = self.max_cacheable_response_content_length();
        max == CACHE_SIZE_UNLIMITED || (size as i64) <= max
    }

    pub fn failure_caching_ttl_sec(&self, fetch_status: FetchResponseStatus) -> i64 {
        self.failure_caching_ttl_sec.read().get(fetch_status)
    }

    pub fn set_failure_caching_ttl_sec(&self, fetch_status: FetchResponseStatus, ttl_sec: i64) {
        self.failure_caching_ttl_sec
            .write()
            .set(fetch_status, ttl_sec);
    }

    pub fn version_prefix(&self) -> String {
        self.version_prefix.read().clone()
    }

    /// Move every key under `v<version>/`, orphaning older entries
    pub fn set_version(&self, version: u32) {
        *self.version_prefix.write() = format!("v{}/", version);
    }

    pub fn set_cacheable_urls(&self, group: WildcardGroup) {
        *self.cacheable_urls.write() = group;
    }

    pub fn is_url_cacheable(&self, url: &str) -> bool {
        self.cacheable_urls.read().matches(url, true)
    }

    pub fn purge_context(&self) -> Option<Arc<PurgeContext>> {
        self.purge_context.read().clone()
    }

    pub fn set_purge_context(&self, context: Option<Arc<PurgeContext>>) {
        *self.purge_context.write() = context;
    }
}

// =============================================================================
// Interface
// =============================================================================

/// Operations shared by single-tier and write-through HTTP caches
pub trait HttpCacheInterface: Send + Sync {
    /// Look up `key` under `fragment`; `callback` is delivered exactly once
    fn find(&self, key: &str, fragment: &str, callback: HttpCacheCallback);

    /// Store a response; false when it was rejected as uncacheable
    #[allow(clippy::too_many_arguments)]
    fn put(
        &self,
        key: &str,
        fragment: &str,
        request: RequestProperties,
        respect_vary_on_resources: bool,
        headers: &mut ResponseHeaders,
        body: &[u8],
    ) -> bool;

    fn delete(&self, key: &str, fragment: &str);

    /// Remember that fetching `key` failed with `fetch_status`
    fn remember_failure(&self, key: &str, fragment: &str, fetch_status: FetchResponseStatus);

    fn settings(&self) -> &Arc<HttpCacheSettings>;

    fn name(&self) -> String;

    /// Store a serialized response
    fn put_value(
        &self,
        key: &str,
        fragment: &str,
        request: RequestProperties,
        respect_vary_on_resources: bool,
        value: &HttpValue,
    ) -> bool {
        let (mut headers, body) = match value.headers().and_then(|h| Ok((h, value.contents()?))) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(key, error = %e, "Refusing to put unparseable HTTP value");
                return false;
            }
        };
        self.put(key, fragment, request, respect_vary_on_resources, &mut headers, &body)
    }

    /// Find as a future. Replaces any `on_done` hook set on `callback`.
    fn find_async(
        &self,
        key: &str,
        fragment: &str,
        callback: HttpCacheCallback,
    ) -> BoxFuture<'static, Result<(FindResult, HttpCacheCallback)>> {
        let (tx, rx) = oneshot::channel();
        let callback = callback.on_done(move |result, cb| {
            let _ = tx.send((result, cb));
        });
        self.find(key, fragment, callback);
        async move { rx.await.map_err(|_| Error::ShutDown) }.boxed()
    }
}

// =============================================================================
// HTTP Cache
// =============================================================================

struct HttpCacheStats {
    cache_time_us: Arc<dyn Variable>,
    hits: Arc<dyn Variable>,
    misses: Arc<dyn Variable>,
    backend_hits: Arc<dyn Variable>,
    backend_misses: Arc<dyn Variable>,
    fallbacks: Arc<dyn Variable>,
    expirations: Arc<dyn Variable>,
    inserts: Arc<dyn Variable>,
    deletes: Arc<dyn Variable>,
    synthesized_etags: Arc<dyn Variable>,
}

struct HttpCacheInner {
    cache: Arc<dyn CacheInterface>,
    timer: Arc<dyn Timer>,
    hasher: Arc<dyn ContentHasher>,
    settings: Arc<HttpCacheSettings>,
    cache_levels: AtomicU32,
    stats: HttpCacheStats,
}

/// HTTP cache over one cache primitive
#[derive(Clone)]
pub struct HttpCache {
    inner: Arc<HttpCacheInner>,
}

impl HttpCache {
    pub fn new(
        cache: Arc<dyn CacheInterface>,
        timer: Arc<dyn Timer>,
        hasher: Arc<dyn ContentHasher>,
        stats: &dyn Statistics,
    ) -> Self {
        Self::with_settings(cache, timer, hasher, Arc::new(HttpCacheSettings::default()), stats)
    }

    /// Build over `settings`, which may be shared with other tiers
    pub fn with_settings(
        cache: Arc<dyn CacheInterface>,
        timer: Arc<dyn Timer>,
        hasher: Arc<dyn ContentHasher>,
        settings: Arc<HttpCacheSettings>,
        stats: &dyn Statistics,
    ) -> Self {
        Self {
            inner: Arc::new(HttpCacheInner {
                cache,
                timer,
                hasher,
                settings,
                cache_levels: AtomicU32::new(1),
                stats: HttpCacheStats {
                    cache_time_us: stats.get_variable(CACHE_TIME_US),
                    hits: stats.get_variable(CACHE_HITS),
                    misses: stats.get_variable(CACHE_MISSES),
                    backend_hits: stats.get_variable(CACHE_BACKEND_HITS),
                    backend_misses: stats.get_variable(CACHE_BACKEND_MISSES),
                    fallbacks: stats.get_variable(CACHE_FALLBACKS),
                    expirations: stats.get_variable(CACHE_EXPIRATIONS),
                    inserts: stats.get_variable(CACHE_INSERTS),
                    deletes: stats.get_variable(CACHE_DELETES),
                    synthesized_etags: stats.get_variable(CACHE_SYNTHESIZED_ETAGS),
                },
            }),
        }
    }

    pub fn init_stats(stats: &dyn Statistics) -> Result<()> {
        for name in [
            CACHE_TIME_US,
            CACHE_HITS,
            CACHE_MISSES,
            CACHE_BACKEND_HITS,
            CACHE_BACKEND_MISSES,
            CACHE_FALLBACKS,
            CACHE_EXPIRATIONS,
            CACHE_INSERTS,
            CACHE_DELETES,
            CACHE_SYNTHESIZED_ETAGS,
        ] {
            stats.add_variable(name)?;
        }
        Ok(())
    }

    pub fn format_name(cache: &str) -> String {
        format!("HTTPCache({})", cache)
    }

    /// Format a synthesized Etag for `hash`
    pub fn format_etag(hash: &str) -> String {
        format!("W/\"{}\"", hash)
    }

    pub fn cache(&self) -> &Arc<dyn CacheInterface> {
        &self.inner.cache
    }

    pub fn timer(&self) -> &Arc<dyn Timer> {
        &self.inner.timer
    }

    /// Number of primitive levels each find validates; stats are updated
    /// at the last one
    pub fn set_cache_levels(&self, levels: u32) {
        self.inner.cache_levels.store(levels.max(1), Ordering::Relaxed);
    }

    pub fn cache_levels(&self) -> u32 {
        self.inner.cache_levels.load(Ordering::Relaxed)
    }

    pub fn set_version(&self, version: u32) {
        self.inner.settings.set_version(version);
    }

    pub fn set_purge_context(&self, context: Option<Arc<PurgeContext>>) {
        self.inner.settings.set_purge_context(context);
    }

    /// Storage key of `key` under `fragment`
    pub fn composite_key(&self, key: &str, fragment: &str) -> String {
        self.inner.composite_key(key, fragment)
    }

    pub fn is_expired(&self, headers: &ResponseHeaders) -> bool {
        self.inner.is_expired(headers, self.inner.timer.now_ms())
    }

    pub fn cache_fallbacks(&self) -> &Arc<dyn Variable> {
        &self.inner.stats.fallbacks
    }

    pub(crate) fn add_insert(&self) {
        self.inner.stats.inserts.add(1);
    }

    pub(crate) fn add_delete(&self) {
        self.inner.stats.deletes.add(1);
    }

    /// Run every put-side check and header rewrite, returning the value to
    /// store, or `None` if the response must not be cached
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn prepare_put(
        &self,
        key: &str,
        fragment: &str,
        request: RequestProperties,
        respect_vary_on_resources: bool,
        headers: &mut ResponseHeaders,
        body: &[u8],
    ) -> Option<HttpValue> {
        let inner = &self.inner;
        let settings = &inner.settings;
        if !inner.may_cache_url(key, headers) {
            return None;
        }
        headers.set_implicit_cache_ttl_ms(settings.implicit_cache_ttl_ms());
        let now_ms = inner.timer.now_ms();
        let cacheable = !inner.is_expired(headers, now_ms)
            && headers.is_proxy_cacheable(request, respect_vary_on_resources)
            && settings.is_cacheable_body_size(body.len());
        if !cacheable && !settings.force_caching() {
            debug!(key, fragment, "Not caching uncacheable response");
            return None;
        }
        if headers.status_code() != HTTP_OK && settings.ignore_failure_puts() {
            return None;
        }

        headers.sanitize();
        if !headers.has(ETAG) {
            let hash = inner.hasher.hash(body);
            headers.add(ETAG, &Self::format_etag(&hash));
            inner.stats.synthesized_etags.add(1);
        }
        match HttpValue::encode(headers, body) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, fragment, error = %e, "Failed to serialize HTTP value");
                None
            }
        }
    }

    /// Value recording a failed fetch, or `None` if it must not be stored
    pub(crate) fn prepare_failure(
        &self,
        key: &str,
        fragment: &str,
        fetch_status: FetchResponseStatus,
    ) -> Option<HttpValue> {
        let code = encode_failure_caching_status(fetch_status)?;
        let ttl_sec = self.inner.settings.failure_caching_ttl_sec(fetch_status);
        let mut headers = ResponseHeaders::with_status(code);
        headers.set_date_and_caching(self.inner.timer.now_ms(), ttl_sec * 1000);
        self.prepare_put(key, fragment, RequestProperties::default(), true, &mut headers, b"")
    }

    /// Apply the body gzip policy and write to the primitive
    pub(crate) fn put_internal(&self, key: &str, fragment: &str, start_us: i64, value: &HttpValue) {
        let inner = &self.inner;
        let value = inner.apply_gzip_policy(value);
        inner
            .cache
            .put(&inner.composite_key(key, fragment), value.share());
        inner
            .stats
            .cache_time_us
            .add((inner.timer.now_us() - start_us).max(0));
    }
}

impl HttpCacheInner {
    fn composite_key(&self, key: &str, fragment: &str) -> String {
        let prefix = self.settings.version_prefix();
        if fragment.is_empty() {
            format!("{}{}", prefix, key)
        } else {
            format!("{}{}/{}", prefix, fragment, key)
        }
    }

    fn is_expired(&self, headers: &ResponseHeaders, now_ms: i64) -> bool {
        !self.settings.force_caching() && headers.cache_expiration_time_ms() <= now_ms
    }

    fn may_cache_url(&self, key: &str, headers: &ResponseHeaders) -> bool {
        let url = match url::Url::parse(key) {
            Ok(url) => url,
            Err(_) => return false,
        };
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        if !self.settings.is_url_cacheable(key) {
            return false;
        }
        !(self.settings.disable_html_caching_on_https()
            && url.scheme() == "https"
            && headers.is_html_like())
    }

    fn is_purge_valid(&self, key: &str, headers: &ResponseHeaders) -> bool {
        match self.settings.purge_context() {
            Some(purge) => purge.is_valid(key, headers.date_ms().unwrap_or(0)),
            None => true,
        }
    }

    fn apply_gzip_policy(&self, value: &HttpValue) -> HttpValue {
        let level = self.settings.compression_level();
        let headers = match value.headers() {
            Ok(headers) => headers,
            Err(_) => return value.clone(),
        };
        if level != 0 {
            let compressible = headers
                .determine_content_type()
                .map_or(false, |t| t.is_compressible());
            if compressible && !headers.is_gzipped() {
                let mut headers = headers;
                match gzip_value(level, value, &mut headers) {
                    Ok(gzipped) => return gzipped,
                    Err(e) => warn!(error = %e, "Storing body uncompressed"),
                }
            }
        } else if headers.is_gzipped() {
            match ungzip_value_if_compressed(value) {
                Ok((inflated, _)) => return inflated,
                Err(e) => warn!(error = %e, "Storing gzipped body as-is"),
            }
        }
        value.clone()
    }

    fn update_stats(&self, backend_hit: bool, result: FindResult, has_fallback: bool, is_expired: bool) {
        let stats = &self.stats;
        if backend_hit {
            stats.backend_hits.add(1);
        } else {
            stats.backend_misses.add(1);
        }
        if result.is_found() {
            stats.hits.add(1);
        } else {
            stats.misses.add(1);
            if has_fallback {
                stats.fallbacks.add(1);
            }
            if is_expired {
                stats.expirations.add(1);
            }
        }
    }
}

impl HttpCacheInterface for HttpCache {
    fn find(&self, key: &str, fragment: &str, callback: HttpCacheCallback) {
        if let Some(purge) = self.inner.settings.purge_context() {
            purge.poll_file_system();
        }
        let find = FindCallback {
            key: key.to_string(),
            fragment: fragment.to_string(),
            inner: self.inner.clone(),
            callback: Some(callback),
            result: FindResult::not_found(),
            start_us: self.inner.timer.now_us(),
            cache_level: 0,
        };
        self.inner
            .cache
            .get(&self.inner.composite_key(key, fragment), Box::new(find));
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
        let start_us = self.inner.timer.now_us();
        match self.prepare_put(key, fragment, request, respect_vary_on_resources, headers, body) {
            Some(value) => {
                self.put_internal(key, fragment, start_us, &value);
                self.add_insert();
                true
            }
            None => false,
        }
    }

    fn delete(&self, key: &str, fragment: &str) {
        self.add_delete();
        self.inner
            .cache
            .delete(&self.inner.composite_key(key, fragment));
    }

    fn remember_failure(&self, key: &str, fragment: &str, fetch_status: FetchResponseStatus) {
        let start_us = self.inner.timer.now_us();
        if let Some(value) = self.prepare_failure(key, fragment, fetch_status) {
            self.put_internal(key, fragment, start_us, &value);
            self.add_insert();
        }
    }

    fn settings(&self) -> &Arc<HttpCacheSettings> {
        &self.inner.settings
    }

    fn name(&self) -> String {
        Self::format_name(&self.inner.cache.name())
    }
}

// =============================================================================
// Find Callback
// =============================================================================

struct FindCallback {
    key: String,
    fragment: String,
    inner: Arc<HttpCacheInner>,
    callback: Option<HttpCacheCallback>,
    result: FindResult,
    start_us: i64,
    cache_level: u32,
}

impl CacheCallback for FindCallback {
    fn validate_candidate(&mut self, _key: &str, state: KeyState, value: Option<&Bytes>) -> bool {
        self.cache_level += 1;
        let inner = &self.inner;
        let callback = match self.callback.as_mut() {
            Some(callback) => callback,
            None => return false,
        };
        let now_us = inner.timer.now_us();
        let now_ms = now_us / 1000;
        let force = inner.settings.force_caching();
        let accepts_gzip = callback.request_context().accepts_gzip();
        let mut is_expired = false;

        let parsed = match (state, value) {
            (KeyState::Available, Some(bytes)) => match HttpValue::link_with_headers(bytes.clone()) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    warn!(key = %self.key, fragment = %self.fragment, error = %e, "Unparseable cache entry");
                    None
                }
            },
            _ => None,
        };
        let backend_hit = parsed.is_some();

        if let Some((http_value, mut headers)) = parsed {
            headers.set_implicit_cache_ttl_ms(inner.settings.implicit_cache_ttl_ms());
            let request = callback.request_properties();
            let respect_vary = callback.respect_vary_on_resources();
            let usable = (force || headers.is_proxy_cacheable(request, respect_vary))
                && callback.is_cache_valid(&self.key, &headers)
                && !headers.sanitize();
            if usable {
                let override_ttl_ms = callback.override_cache_ttl_ms(&self.key);
                if override_ttl_ms > 0 {
                    headers.force_caching(override_ttl_ms);
                }
                is_expired = inner.is_expired(&headers, now_ms);
                let purged = !inner.is_purge_valid(&self.key, &headers);
                let mut valid_and_fresh = !is_expired && !purged && callback.is_fresh(&headers);

                if let Some(fetch_status) = decode_failure_caching_status(headers.status_code()) {
                    if override_ttl_ms > 0 && fetch_status == FetchResponseStatus::Uncacheable200 {
                        valid_and_fresh = false;
                    }
                    if valid_and_fresh {
                        self.result = FindResult::recent_failure(fetch_status);
                        debug!(
                            key = %self.key,
                            fragment = %self.fragment,
                            remaining_sec = (headers.cache_expiration_time_ms() - self.start_us / 1000) / 1000,
                            "Remembering recent failure"
                        );
                    }
                } else if valid_and_fresh {
                    self.result = FindResult::found();
                    callback.fallback_http_value.clear();
                    callback.http_value = http_value;
                    if headers.update_cache_headers_if_force_cached() {
                        let rebuilt = callback
                            .http_value
                            .contents()
                            .and_then(|body| HttpValue::encode(&headers, &body));
                        match rebuilt {
                            Ok(value) => callback.http_value = value,
                            Err(e) => warn!(key = %self.key, error = %e, "Failed to rewrite forced headers"),
                        }
                    }
                } else if purged {
                    debug!(key = %self.key, fragment = %self.fragment, "Cache entry purged");
                } else if force || headers.is_proxy_cacheable(request, respect_vary) {
                    callback.fallback_http_value = if accepts_gzip {
                        http_value
                    } else {
                        ungzip_value_if_compressed(&http_value)
                            .map(|(inflated, _)| inflated)
                            .unwrap_or(http_value)
                    };
                }
                callback.response_headers = headers;
            }
        }

        let elapsed_us = (now_us - self.start_us).max(0);
        inner.stats.cache_time_us.add(elapsed_us);
        callback.report_latency_ms(elapsed_us / 1000);
        let found = self.result.is_found();
        let last_level = self.cache_level >= inner.cache_levels.load(Ordering::Relaxed);
        if found || (last_level && callback.update_stats_on_failure()) {
            inner.update_stats(
                backend_hit,
                self.result,
                !callback.fallback_http_value.is_empty(),
                is_expired,
            );
            if is_expired && !found {
                debug!(key = %self.key, fragment = %self.fragment, "Cache entry is expired");
            }
        }

        if !found {
            callback.response_headers.clear();
            callback.http_value.clear();
        } else if !accepts_gzip && callback.response_headers.is_gzipped() {
            match ungzip_value_if_compressed(&callback.http_value) {
                Ok((inflated, headers)) => {
                    callback.http_value = inflated;
                    callback.response_headers = headers;
                }
                Err(e) => warn!(key = %self.key, error = %e, "Serving gzipped body"),
            }
        }
        self.start_us = now_us;
        found
    }

    fn done(self: Box<Self>, _state: KeyState, _value: Option<Bytes>) {
        let mut this = *self;
        if let Some(callback) = this.callback.take() {
            callback.done(this.result);
        }
    }
}
