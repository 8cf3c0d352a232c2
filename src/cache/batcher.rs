//! Cache Batcher
//!
//! Bounds concurrent upstream lookups and coalesces duplicate keys.
//!
//! # Architecture
//!
//! ```text
//!   get(k, cb)
//!      │
//!      ├─ k in flight ─────────────────▶ join waiters of k      (coalesced)
//!      ├─ free lookup slot ────────────▶ new group {k} ─▶ upstream.get
//!      ├─ pending below max ───────────▶ queued[k]              (queued)
//!      └─ otherwise ───────────────────▶ NotFound               (dropped)
//!
//!   group done (all its keys answered)
//!      └─ queue non-empty ─▶ every queued key forms the next group
//!                            ─▶ one upstream.multi_get
//! ```
//!
//! # Design
//!
//! - A lookup slot is held by a group: the single key issued directly, or
//!   the keys of one queued batch. The slot frees when the last key of the
//!   group is answered, so at most `max_parallel_lookups` groups are ever
//!   outstanding upstream.
//! - The mutex is never held while calling upstream or a waiter, so
//!   waiters may re-enter the batcher from their callbacks.
//! - Waiters of one key are answered in arrival order. Each waiter's own
//!   validation hook decides whether it sees the shared value; the upstream
//!   candidate is accepted if any waiter accepts it.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::interface::{
    deliver, report_multi_get_not_found, CacheCallback, CacheInterface, KeyCallback, KeyState,
};
use crate::error::Result;
use crate::stats::{Statistics, Variable};

pub const DROPPED_GETS: &str = "cache_batcher_dropped_gets";
pub const COALESCED_GETS: &str = "cache_batcher_coalesced_gets";
pub const QUEUED_GETS: &str = "cache_batcher_queued_gets";

/// Batcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheBatcherConfig {
    /// Upstream lookup groups allowed in flight at once
    pub max_parallel_lookups: usize,
    /// Gets allowed in flight or queued before new ones are dropped
    pub max_pending_gets: usize,
}

impl Default for CacheBatcherConfig {
    fn default() -> Self {
        Self {
            max_parallel_lookups: 1,
            max_pending_gets: 1000,
        }
    }
}

struct Waiter {
    callback: Box<dyn CacheCallback>,
    verdict: Option<bool>,
}

impl Waiter {
    fn new(callback: Box<dyn CacheCallback>) -> Self {
        Self {
            callback,
            verdict: None,
        }
    }
}

struct InFlight {
    waiters: Vec<Waiter>,
    group: u64,
}

#[derive(Default)]
struct BatcherState {
    in_flight: HashMap<String, InFlight>,
    queued: HashMap<String, Vec<Box<dyn CacheCallback>>>,
    queue_order: Vec<String>,
    // group id -> keys still outstanding
    groups: HashMap<u64, usize>,
    next_group: u64,
    num_pending_gets: usize,
    last_batch_size: usize,
    shut_down: bool,
}

impl BatcherState {
    fn new_group(&mut self, num_keys: usize) -> u64 {
        let group = self.next_group;
        self.next_group += 1;
        self.groups.insert(group, num_keys);
        group
    }
}

struct BatcherInner {
    cache: Arc<dyn CacheInterface>,
    config: CacheBatcherConfig,
    state: Mutex<BatcherState>,
    dropped_gets: Arc<dyn Variable>,
    coalesced_gets: Arc<dyn Variable>,
    queued_gets: Arc<dyn Variable>,
}

/// Coalescing, concurrency-bounding wrapper around a cache
pub struct CacheBatcher {
    inner: Arc<BatcherInner>,
}

enum GetAction {
    Done,
    Issue,
    Drop(Box<dyn CacheCallback>),
}

impl CacheBatcher {
    pub fn new(cache: Arc<dyn CacheInterface>, stats: &dyn Statistics) -> Self {
        Self::with_config(cache, CacheBatcherConfig::default(), stats)
    }

    pub fn with_config(
        cache: Arc<dyn CacheInterface>,
        config: CacheBatcherConfig,
        stats: &dyn Statistics,
    ) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                cache,
                config,
                state: Mutex::new(BatcherState::default()),
                dropped_gets: stats.get_variable(DROPPED_GETS),
                coalesced_gets: stats.get_variable(COALESCED_GETS),
                queued_gets: stats.get_variable(QUEUED_GETS),
            }),
        }
    }

    pub fn init_stats(stats: &dyn Statistics) -> Result<()> {
        stats.add_variable(DROPPED_GETS)?;
        stats.add_variable(COALESCED_GETS)?;
        stats.add_variable(QUEUED_GETS)?;
        Ok(())
    }

    pub fn format_name(cache: &str, parallelism: usize, max: usize) -> String {
        format!("Batcher(cache={},parallelism={},max={})", cache, parallelism, max)
    }

    pub fn config(&self) -> &CacheBatcherConfig {
        &self.inner.config
    }

    /// Gets waiting in flight or in the queue
    pub fn num_pending_gets(&self) -> usize {
        self.inner.state.lock().num_pending_gets
    }

    pub fn num_in_flight_keys(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    pub fn num_in_flight_groups(&self) -> usize {
        self.inner.state.lock().groups.len()
    }

    pub fn num_queued_keys(&self) -> usize {
        self.inner.state.lock().queued.len()
    }

    /// Keys in the most recent queued batch sent upstream
    pub fn last_batch_size(&self) -> usize {
        self.inner.state.lock().last_batch_size
    }

    pub fn dropped_gets(&self) -> i64 {
        self.inner.dropped_gets.get()
    }

    pub fn coalesced_gets(&self) -> i64 {
        self.inner.coalesced_gets.get()
    }

    pub fn queued_gets(&self) -> i64 {
        self.inner.queued_gets.get()
    }
}

impl BatcherInner {
    fn get(self: &Arc<Self>, key: &str, callback: Box<dyn CacheCallback>) {
        let action = {
            let mut state = self.state.lock();
            let has_room = state.num_pending_gets < self.config.max_pending_gets;
            if state.shut_down || !has_room {
                GetAction::Drop(callback)
            } else if let Some(entry) = state.in_flight.get_mut(key) {
                entry.waiters.push(Waiter::new(callback));
                state.num_pending_gets += 1;
                self.coalesced_gets.add(1);
                GetAction::Done
            } else if state.groups.len() < self.config.max_parallel_lookups {
                let group = state.new_group(1);
                state.in_flight.insert(
                    key.to_string(),
                    InFlight {
                        waiters: vec![Waiter::new(callback)],
                        group,
                    },
                );
                state.num_pending_gets += 1;
                GetAction::Issue
            } else {
                if !state.queued.contains_key(key) {
                    state.queue_order.push(key.to_string());
                }
                state.queued.entry(key.to_string()).or_default().push(callback);
                state.num_pending_gets += 1;
                self.queued_gets.add(1);
                GetAction::Done
            }
        };

        match action {
            GetAction::Done => {}
            GetAction::Issue => self.cache.get(key, self.upstream_callback(key)),
            GetAction::Drop(callback) => {
                self.dropped_gets.add(1);
                debug!(key, "Batcher dropping get");
                deliver(callback, key, KeyState::NotFound, None);
            }
        }
    }

    fn upstream_callback(self: &Arc<Self>, key: &str) -> Box<dyn CacheCallback> {
        Box::new(BatcherCallback {
            key: key.to_string(),
            batcher: self.clone(),
        })
    }

    /// Offer the candidate to every waiter. Layered caches offer one
    /// candidate per level, so each round replaces the previous verdict.
    fn validate(&self, key: &str, state: KeyState, value: Option<&Bytes>) -> bool {
        let mut waiters = match self.state.lock().in_flight.get_mut(key) {
            Some(entry) => std::mem::take(&mut entry.waiters),
            None => return false,
        };
        for waiter in waiters.iter_mut() {
            waiter.verdict = Some(waiter.callback.validate_candidate(key, state, value));
        }
        let accepted = waiters.iter().any(|w| w.verdict == Some(true));

        let mut guard = self.state.lock();
        if let Some(entry) = guard.in_flight.get_mut(key) {
            // Waiters that joined while we validated go after the earlier ones.
            let newcomers = std::mem::replace(&mut entry.waiters, waiters);
            entry.waiters.extend(newcomers);
        }
        accepted
    }

    fn done(self: &Arc<Self>, key: &str, state: KeyState, value: Option<Bytes>) {
        let (waiters, next_batch) = {
            let mut guard = self.state.lock();
            let Some(entry) = guard.in_flight.remove(key) else {
                return;
            };
            guard.num_pending_gets -= entry.waiters.len();

            let group_finished = match guard.groups.get_mut(&entry.group) {
                Some(remaining) => {
                    *remaining -= 1;
                    *remaining == 0
                }
                None => false,
            };
            let mut next_batch = Vec::new();
            if group_finished {
                guard.groups.remove(&entry.group);
                if !guard.queue_order.is_empty() {
                    next_batch = Self::start_queued_group(&mut guard);
                }
            }
            (entry.waiters, next_batch)
        };

        for waiter in waiters {
            match waiter.verdict {
                Some(true) => waiter.callback.done(state, value.clone()),
                Some(false) => waiter.callback.done(KeyState::NotFound, None),
                None => deliver(waiter.callback, key, state, value.clone()),
            }
        }

        if !next_batch.is_empty() {
            self.issue_batch(next_batch);
        }
    }

    /// Move every queued key in flight as one new group; returns its keys
    fn start_queued_group(state: &mut BatcherState) -> Vec<String> {
        let keys = std::mem::take(&mut state.queue_order);
        let group = state.new_group(keys.len());
        state.last_batch_size = keys.len();
        for key in &keys {
            let callbacks = state.queued.remove(key).unwrap_or_default();
            let waiters = callbacks.into_iter().map(Waiter::new);
            match state.in_flight.get_mut(key) {
                Some(existing) => existing.waiters.extend(waiters),
                None => {
                    state.in_flight.insert(
                        key.clone(),
                        InFlight {
                            waiters: waiters.collect(),
                            group,
                        },
                    );
                }
            }
        }
        keys
    }

    fn issue_batch(self: &Arc<Self>, keys: Vec<String>) {
        let request = keys
            .into_iter()
            .map(|key| {
                let callback = self.upstream_callback(&key);
                KeyCallback::new(key, callback)
            })
            .collect();
        self.cache.multi_get(request);
    }
}

// Keep the batcher alive while upstream holds the callback.
struct BatcherCallback {
    key: String,
    batcher: Arc<BatcherInner>,
}

impl CacheCallback for BatcherCallback {
    fn validate_candidate(&mut self, key: &str, state: KeyState, value: Option<&Bytes>) -> bool {
        self.batcher.validate(key, state, value)
    }

    fn done(self: Box<Self>, state: KeyState, value: Option<Bytes>) {
        self.batcher.done(&self.key, state, value);
    }
}

impl CacheInterface for CacheBatcher {
    fn get(&self, key: &str, callback: Box<dyn CacheCallback>) {
        self.inner.get(key, callback);
    }

    fn put(&self, key: &str, value: Bytes) {
        self.inner.cache.put(key, value);
    }

    fn delete(&self, key: &str) {
        self.inner.cache.delete(key);
    }

    fn name(&self) -> String {
        Self::format_name(
            &self.inner.cache.name(),
            self.inner.config.max_parallel_lookups,
            self.inner.config.max_pending_gets,
        )
    }

    fn is_blocking(&self) -> bool {
        false
    }

    fn is_healthy(&self) -> bool {
        self.inner.cache.is_healthy()
    }

    fn shut_down(&self) {
        let queued = {
            let mut state = self.inner.state.lock();
            state.shut_down = true;
            let order = std::mem::take(&mut state.queue_order);
            let mut request = Vec::new();
            for key in order {
                for callback in state.queued.remove(&key).unwrap_or_default() {
                    request.push(KeyCallback::new(key.clone(), callback));
                }
            }
            state.num_pending_gets -= request.len();
            request
        };
        report_multi_get_not_found(queued);
        self.inner.cache.shut_down();
    }
}
