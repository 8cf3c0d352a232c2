//! Delay Cache
//!
//! Test wrapper that holds back delivery for chosen keys until they are
//! released, turning a synchronous backend into one whose lookups are
//! outstanding for as long as a test needs. Candidate validation still
//! runs immediately; only `done` is deferred.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::cache::interface::{CacheCallback, CacheInterface, KeyState};

struct HeldDelivery {
    callback: Box<dyn CacheCallback>,
    state: KeyState,
    value: Option<Bytes>,
}

#[derive(Default)]
struct DelayState {
    delayed_keys: HashSet<String>,
    held: HashMap<String, Vec<HeldDelivery>>,
}

/// Wrapper deferring delivery of delayed keys
pub struct DelayCache {
    cache: Arc<dyn CacheInterface>,
    state: Arc<Mutex<DelayState>>,
}

impl DelayCache {
    pub fn new(cache: Arc<dyn CacheInterface>) -> Self {
        Self {
            cache,
            state: Arc::new(Mutex::new(DelayState::default())),
        }
    }

    /// Hold back deliveries for `key` from now on
    pub fn delay_key(&self, key: &str) {
        self.state.lock().delayed_keys.insert(key.to_string());
    }

    /// Stop delaying `key` and deliver everything held for it, in order
    pub fn release_key(&self, key: &str) {
        let held = {
            let mut state = self.state.lock();
            state.delayed_keys.remove(key);
            state.held.remove(key).unwrap_or_default()
        };
        for delivery in held {
            delivery.callback.done(delivery.state, delivery.value);
        }
    }

    /// Number of deliveries waiting on `key`
    pub fn num_held(&self, key: &str) -> usize {
        self.state.lock().held.get(key).map_or(0, Vec::len)
    }
}

impl CacheInterface for DelayCache {
    fn get(&self, key: &str, callback: Box<dyn CacheCallback>) {
        let delayed = self.state.lock().delayed_keys.contains(key);
        if delayed {
            self.cache.get(
                key,
                Box::new(DelayCallback {
                    key: key.to_string(),
                    inner: callback,
                    state: self.state.clone(),
                }),
            );
        } else {
            self.cache.get(key, callback);
        }
    }

    fn put(&self, key: &str, value: Bytes) {
        self.cache.put(key, value);
    }

    fn delete(&self, key: &str) {
        self.cache.delete(key);
    }

    fn name(&self) -> String {
        format!("DelayCache({})", self.cache.name())
    }

    fn is_blocking(&self) -> bool {
        false
    }

    fn shut_down(&self) {
        self.cache.shut_down();
    }
}

struct DelayCallback {
    key: String,
    inner: Box<dyn CacheCallback>,
    state: Arc<Mutex<DelayState>>,
}

impl CacheCallback for DelayCallback {
    fn validate_candidate(&mut self, key: &str, state: KeyState, value: Option<&Bytes>) -> bool {
        self.inner.validate_candidate(key, state, value)
    }

    fn done(self: Box<Self>, state: KeyState, value: Option<Bytes>) {
        let DelayCallback {
            key,
            inner,
            state: shared,
        } = *self;
        let mut guard = shared.lock();
        if guard.delayed_keys.contains(&key) {
            guard.held.entry(key).or_default().push(HeldDelivery {
                callback: inner,
                state,
                value,
            });
        } else {
            drop(guard);
            inner.done(state, value);
        }
    }
}
