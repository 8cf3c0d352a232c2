//! Per-request context handed to HTTP cache lookups.

use std::sync::Arc;

use parking_lot::Mutex;

/// Latencies observed while serving one request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestTimingInfo {
    pub http_cache_latency_ms: Option<i64>,
    pub l2_http_cache_latency_ms: Option<i64>,
}

/// What the cache needs to know about the request it serves
#[derive(Debug, Default)]
pub struct RequestContext {
    accepts_gzip: bool,
    timing: Mutex<RequestTimingInfo>,
}

impl RequestContext {
    pub fn new(accepts_gzip: bool) -> Arc<Self> {
        Arc::new(Self {
            accepts_gzip,
            timing: Mutex::new(RequestTimingInfo::default()),
        })
    }

    pub fn accepts_gzip(&self) -> bool {
        self.accepts_gzip
    }

    pub fn set_http_cache_latency_ms(&self, latency_ms: i64) {
        self.timing.lock().http_cache_latency_ms = Some(latency_ms);
    }

    pub fn set_l2_http_cache_latency_ms(&self, latency_ms: i64) {
        self.timing.lock().l2_http_cache_latency_ms = Some(latency_ms);
    }

    pub fn timing_info(&self) -> RequestTimingInfo {
        *self.timing.lock()
    }
}
