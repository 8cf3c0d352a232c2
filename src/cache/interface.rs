//! Cache primitive interface
//!
//! Every cache layer (LRU backend, compressed wrapper, stats wrapper,
//! write-through composition, batcher, async adapter) implements
//! [`CacheInterface`], so layers stack by wrapping one another.
//!
//! # Callback contract
//!
//! - `done` fires exactly once per `get`, possibly on the caller's thread
//!   before `get` returns.
//! - Before `done`, the primitive offers the candidate to
//!   `validate_candidate`. A rejection downgrades the outcome to
//!   [`KeyState::NotFound`] with no value, letting wrappers discard corrupt
//!   payloads without an extra round trip.

use bytes::Bytes;

/// Outcome of a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyState {
    /// Value found
    Available,
    /// Key absent
    NotFound,
    /// Request dropped because the cache is saturated
    Overload,
    /// Transport failure reaching a remote cache
    NetworkError,
    /// Remote cache did not answer in time
    Timeout,
}

impl KeyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyState::Available => "available",
            KeyState::NotFound => "not_found",
            KeyState::Overload => "overload",
            KeyState::NetworkError => "network_error",
            KeyState::Timeout => "timeout",
        }
    }
}

/// Receiver of a single lookup result
pub trait CacheCallback: Send {
    /// Inspect a candidate before delivery; `false` turns the lookup into a
    /// miss. Called for every outcome, not only `Available`.
    fn validate_candidate(&mut self, _key: &str, _state: KeyState, _value: Option<&Bytes>) -> bool {
        true
    }

    /// Final delivery
    fn done(self: Box<Self>, state: KeyState, value: Option<Bytes>);
}

/// A key paired with the callback awaiting it
pub struct KeyCallback {
    pub key: String,
    pub callback: Box<dyn CacheCallback>,
}

impl KeyCallback {
    pub fn new(key: impl Into<String>, callback: Box<dyn CacheCallback>) -> Self {
        Self {
            key: key.into(),
            callback,
        }
    }
}

/// Uniform capability set of a cache layer
pub trait CacheInterface: Send + Sync {
    /// Look up `key`; `callback` fires exactly once
    fn get(&self, key: &str, callback: Box<dyn CacheCallback>);

    /// Look up several keys; the default issues one `get` per key
    fn multi_get(&self, request: Vec<KeyCallback>) {
        for KeyCallback { key, callback } in request {
            self.get(&key, callback);
        }
    }

    fn put(&self, key: &str, value: Bytes);

    fn delete(&self, key: &str);

    /// Descriptive name including wrapped layers
    fn name(&self) -> String;

    /// Whether `get` delivers before returning
    fn is_blocking(&self) -> bool;

    fn is_healthy(&self) -> bool {
        true
    }

    /// Fail outstanding lookups and ignore later writes
    fn shut_down(&self);
}

/// Offer the candidate to the callback, then deliver the possibly
/// downgraded result
pub fn deliver(
    mut callback: Box<dyn CacheCallback>,
    key: &str,
    state: KeyState,
    value: Option<Bytes>,
) {
    if callback.validate_candidate(key, state, value.as_ref()) {
        callback.done(state, value);
    } else {
        callback.done(KeyState::NotFound, None);
    }
}

/// Deliver `NotFound` to every callback in a multi-get request
pub fn report_multi_get_not_found(request: Vec<KeyCallback>) {
    for KeyCallback { key, callback } in request {
        deliver(callback, &key, KeyState::NotFound, None);
    }
}

/// Adapter turning a closure into a [`CacheCallback`] that accepts every
/// candidate
pub struct FnCallback<F>(F)
where
    F: FnOnce(KeyState, Option<Bytes>) + Send;

impl<F> FnCallback<F>
where
    F: FnOnce(KeyState, Option<Bytes>) + Send + 'static,
{
    pub fn boxed(f: F) -> Box<dyn CacheCallback> {
        Box::new(FnCallback(f))
    }
}

impl<F> CacheCallback for FnCallback<F>
where
    F: FnOnce(KeyState, Option<Bytes>) + Send,
{
    fn done(self: Box<Self>, state: KeyState, value: Option<Bytes>) {
        (self.0)(state, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::RecordingCallback;

    #[test]
    fn test_deliver_downgrades_rejected_candidates() {
        let cb = RecordingCallback::new().with_invalid_value("bad");
        let result = cb.result();
        deliver(Box::new(cb), "k", KeyState::Available, Some(Bytes::from_static(b"bad")));
        assert!(result.called());
        assert_eq!(result.state(), Some(KeyState::NotFound));
        assert!(result.value().is_none());
        assert_eq!(result.validate_calls(), 1);

        let cb = RecordingCallback::new().with_invalid_value("bad");
        let result = cb.result();
        deliver(Box::new(cb), "k", KeyState::Available, Some(Bytes::from_static(b"good")));
        assert_eq!(result.state(), Some(KeyState::Available));
        assert_eq!(result.value_str(), "good");
    }

    #[test]
    fn test_report_multi_get_not_found() {
        let a = RecordingCallback::new();
        let b = RecordingCallback::new();
        let (ra, rb) = (a.result(), b.result());
        report_multi_get_not_found(vec![
            KeyCallback::new("a", Box::new(a)),
            KeyCallback::new("b", Box::new(b)),
        ]);
        assert_eq!(ra.state(), Some(KeyState::NotFound));
        assert_eq!(rb.state(), Some(KeyState::NotFound));
    }

    #[test]
    fn test_fn_callback() {
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(None));
        let s = seen.clone();
        deliver(
            FnCallback::boxed(move |state, _| *s.lock() = Some(state)),
            "k",
            KeyState::Timeout,
            None,
        );
        assert_eq!(*seen.lock(), Some(KeyState::Timeout));
    }
}
