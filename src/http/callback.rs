//! HTTP Cache Callback
//!
//! The per-find aggregate: output slots the cache fills, the request it
//! serves, and the hooks consulted while validating candidates. Hooks are
//! plain closures supplied by the caller; defaults accept everything and
//! apply no TTL override.

use std::fmt;
use std::sync::Arc;

use crate::http::fetch_status::FindResult;
use crate::http::headers::{RequestProperties, ResponseHeaders};
use crate::http::request_context::RequestContext;
use crate::http::value::HttpValue;

pub type CacheValidFn = Arc<dyn Fn(&str, &ResponseHeaders) -> bool + Send + Sync>;
pub type FreshFn = Arc<dyn Fn(&ResponseHeaders) -> bool + Send + Sync>;
pub type OverrideTtlFn = Arc<dyn Fn(&str) -> i64 + Send + Sync>;
pub type DoneFn = Box<dyn FnOnce(FindResult, HttpCacheCallback) + Send>;

/// Caller state for one HTTP cache find
pub struct HttpCacheCallback {
    /// Found value
    pub http_value: HttpValue,
    /// Stale value offered on a miss
    pub fallback_http_value: HttpValue,
    /// Headers of the found value
    pub response_headers: ResponseHeaders,
    request_context: Arc<RequestContext>,
    request_properties: RequestProperties,
    respect_vary_on_resources: bool,
    is_cache_valid: Option<CacheValidFn>,
    is_fresh: Option<FreshFn>,
    override_cache_ttl_ms: Option<OverrideTtlFn>,
    latency_level: u32,
    update_stats_on_failure: bool,
    on_done: Option<DoneFn>,
}

impl HttpCacheCallback {
    pub fn new(request_context: Arc<RequestContext>) -> Self {
        Self {
            http_value: HttpValue::new(),
            fallback_http_value: HttpValue::new(),
            response_headers: ResponseHeaders::new(),
            request_context,
            request_properties: RequestProperties::default(),
            respect_vary_on_resources: false,
            is_cache_valid: None,
            is_fresh: None,
            override_cache_ttl_ms: None,
            latency_level: 0,
            update_stats_on_failure: true,
            on_done: None,
        }
    }

    pub fn with_request_properties(mut self, properties: RequestProperties) -> Self {
        self.request_properties = properties;
        self
    }

    pub fn with_respect_vary_on_resources(mut self, respect: bool) -> Self {
        self.respect_vary_on_resources = respect;
        self
    }

    pub fn with_is_cache_valid<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &ResponseHeaders) -> bool + Send + Sync + 'static,
    {
        self.is_cache_valid = Some(Arc::new(f));
        self
    }

    pub fn with_is_fresh<F>(mut self, f: F) -> Self
    where
        F: Fn(&ResponseHeaders) -> bool + Send + Sync + 'static,
    {
        self.is_fresh = Some(Arc::new(f));
        self
    }

    pub fn with_override_cache_ttl_ms<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> i64 + Send + Sync + 'static,
    {
        self.override_cache_ttl_ms = Some(Arc::new(f));
        self
    }

    /// Receive the result and the callback back once the find completes
    pub fn on_done<F>(mut self, f: F) -> Self
    where
        F: FnOnce(FindResult, HttpCacheCallback) + Send + 'static,
    {
        self.on_done = Some(Box::new(f));
        self
    }

    pub fn request_context(&self) -> &Arc<RequestContext> {
        &self.request_context
    }

    pub fn request_properties(&self) -> RequestProperties {
        self.request_properties
    }

    pub fn respect_vary_on_resources(&self) -> bool {
        self.respect_vary_on_resources
    }

    pub fn is_cache_valid(&self, key: &str, headers: &ResponseHeaders) -> bool {
        self.is_cache_valid.as_ref().map_or(true, |f| f(key, headers))
    }

    pub fn is_fresh(&self, headers: &ResponseHeaders) -> bool {
        self.is_fresh.as_ref().map_or(true, |f| f(headers))
    }

    /// TTL to force on a found entry; non-positive means none
    pub fn override_cache_ttl_ms(&self, key: &str) -> i64 {
        self.override_cache_ttl_ms.as_ref().map_or(-1, |f| f(key))
    }

    /// Record one cache level's latency: the first report goes to the L1
    /// slot, the second to the L2 slot
    pub fn report_latency_ms(&mut self, latency_ms: i64) {
        self.latency_level += 1;
        match self.latency_level {
            1 => self.request_context.set_http_cache_latency_ms(latency_ms),
            2 => self.request_context.set_l2_http_cache_latency_ms(latency_ms),
            _ => {}
        }
    }

    /// Whether a miss at the last cache level updates the hit/miss counters
    pub fn update_stats_on_failure(&self) -> bool {
        self.update_stats_on_failure
    }

    pub(crate) fn set_update_stats_on_failure(&mut self, update: bool) {
        self.update_stats_on_failure = update;
    }

    pub(crate) fn take_on_done(&mut self) -> Option<DoneFn> {
        self.on_done.take()
    }

    pub(crate) fn set_on_done(&mut self, on_done: DoneFn) {
        self.on_done = Some(on_done);
    }

    /// Deliver the result
    pub fn done(mut self, result: FindResult) {
        if let Some(on_done) = self.on_done.take() {
            on_done(result, self);
        }
    }
}

impl fmt::Debug for HttpCacheCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpCacheCallback")
            .field("http_value_size", &self.http_value.size())
            .field("fallback_size", &self.fallback_http_value.size())
            .field("accepts_gzip", &self.request_context.accepts_gzip())
            .field("request_properties", &self.request_properties)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_default_hooks() {
        let cb = HttpCacheCallback::new(RequestContext::new(true));
        let headers = ResponseHeaders::new();
        assert!(cb.is_cache_valid("k", &headers));
        assert!(cb.is_fresh(&headers));
        assert!(cb.override_cache_ttl_ms("k") <= 0);
    }

    #[test]
    fn test_custom_hooks() {
        let cb = HttpCacheCallback::new(RequestContext::new(true))
            .with_is_cache_valid(|key, _| key != "bad")
            .with_override_cache_ttl_ms(|key| if key.ends_with(".css") { 1000 } else { -1 });
        let headers = ResponseHeaders::new();
        assert!(!cb.is_cache_valid("bad", &headers));
        assert!(cb.is_cache_valid("good", &headers));
        assert_eq!(cb.override_cache_ttl_ms("a.css"), 1000);
    }

    #[test]
    fn test_latency_levels() {
        let ctx = RequestContext::new(false);
        let mut cb = HttpCacheCallback::new(ctx.clone());
        cb.report_latency_ms(3);
        cb.report_latency_ms(7);
        cb.report_latency_ms(11);
        let timing = ctx.timing_info();
        assert_eq!(timing.http_cache_latency_ms, Some(3));
        assert_eq!(timing.l2_http_cache_latency_ms, Some(7));
    }

    #[test]
    fn test_done_hands_back_callback() {
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let cb = HttpCacheCallback::new(RequestContext::new(true))
            .on_done(move |result, cb| *s.lock() = Some((result, cb.http_value.is_empty())));
        cb.done(FindResult::not_found());
        assert_eq!(*seen.lock(), Some((FindResult::not_found(), true)));
    }
}
