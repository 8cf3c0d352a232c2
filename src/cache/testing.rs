//! Test doubles for cache primitives.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::cache::interface::{CacheCallback, CacheInterface, KeyState};

#[derive(Debug, Default)]
struct Recorded {
    called: bool,
    state: Option<KeyState>,
    value: Option<Bytes>,
    validate_calls: usize,
}

/// Shared view of what a [`RecordingCallback`] received
#[derive(Debug, Clone, Default)]
pub struct CallbackResult {
    inner: Arc<Mutex<Recorded>>,
}

impl CallbackResult {
    pub fn called(&self) -> bool {
        self.inner.lock().called
    }

    pub fn state(&self) -> Option<KeyState> {
        self.inner.lock().state
    }

    pub fn value(&self) -> Option<Bytes> {
        self.inner.lock().value.clone()
    }

    /// Delivered value as text; empty when none
    pub fn value_str(&self) -> String {
        self.value()
            .map(|v| String::from_utf8_lossy(&v).into_owned())
            .unwrap_or_default()
    }

    pub fn validate_calls(&self) -> usize {
        self.inner.lock().validate_calls
    }
}

/// Callback recording its outcome, optionally rejecting one value or key
pub struct RecordingCallback {
    result: CallbackResult,
    invalid_value: Option<Bytes>,
    invalid_key: Option<String>,
    reject_misses: bool,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self {
            result: CallbackResult::default(),
            invalid_value: None,
            invalid_key: None,
            reject_misses: false,
        }
    }

    /// Reject candidates whose value equals `value`
    pub fn with_invalid_value(mut self, value: &str) -> Self {
        self.invalid_value = Some(Bytes::copy_from_slice(value.as_bytes()));
        self
    }

    /// Reject every candidate for `key`
    pub fn with_invalid_key(mut self, key: &str) -> Self {
        self.invalid_key = Some(key.to_string());
        self
    }

    /// Reject candidates that carry no value
    pub fn with_rejected_misses(mut self) -> Self {
        self.reject_misses = true;
        self
    }

    pub fn result(&self) -> CallbackResult {
        self.result.clone()
    }
}

impl Default for RecordingCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheCallback for RecordingCallback {
    fn validate_candidate(&mut self, key: &str, state: KeyState, value: Option<&Bytes>) -> bool {
        self.result.inner.lock().validate_calls += 1;
        if state != KeyState::Available {
            return !self.reject_misses;
        }
        if self.invalid_key.as_deref() == Some(key) {
            return false;
        }
        !matches!((&self.invalid_value, value), (Some(bad), Some(v)) if bad == v)
    }

    fn done(self: Box<Self>, state: KeyState, value: Option<Bytes>) {
        let mut recorded = self.result.inner.lock();
        assert!(!recorded.called, "callback delivered twice");
        recorded.called = true;
        recorded.state = Some(state);
        recorded.value = value;
    }
}

/// Look up `key` on a cache that delivers synchronously
pub fn get_now(cache: &dyn CacheInterface, key: &str) -> CallbackResult {
    let cb = RecordingCallback::new();
    let result = cb.result();
    cache.get(key, Box::new(cb));
    result
}
