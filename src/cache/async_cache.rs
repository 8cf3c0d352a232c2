//! Async Cache Adapter
//!
//! Runs the operations of a blocking cache on the tokio blocking pool so
//! callers on async threads never wait on cache I/O.
//!
//! # Design
//!
//! - Every queued operation holds a categorized reference (Get, MultiGet,
//!   Put, Delete); the adapter itself holds the Owner reference until
//!   shutdown. Leaks show up by category in [`AsyncCache::debug_refs`].
//! - Lookups beyond `max_outstanding` are answered `Overload` at once.
//! - After shutdown, queued lookups that have not started are answered
//!   `NotFound`; [`AsyncCache::wait_for_drain`] resolves once the last
//!   reference is released.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::debug;

use crate::cache::interface::{
    deliver, report_multi_get_not_found, CacheCallback, CacheInterface, KeyCallback, KeyState,
};
use crate::util::refcount::{CategorizedRefcount, RefCategory};

/// Default bound on queued operations
pub const DEFAULT_MAX_OUTSTANDING: usize = 1000;

/// Reference categories held against an [`AsyncCache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncCacheRef {
    Owner,
    Get,
    MultiGet,
    Put,
    Delete,
}

impl RefCategory for AsyncCacheRef {
    const ALL: &'static [Self] = &[
        AsyncCacheRef::Owner,
        AsyncCacheRef::Get,
        AsyncCacheRef::MultiGet,
        AsyncCacheRef::Put,
        AsyncCacheRef::Delete,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        match self {
            AsyncCacheRef::Owner => "Owner",
            AsyncCacheRef::Get => "Get",
            AsyncCacheRef::MultiGet => "MultiGet",
            AsyncCacheRef::Put => "Put",
            AsyncCacheRef::Delete => "Delete",
        }
    }
}

struct AsyncInner {
    cache: Arc<dyn CacheInterface>,
    handle: Handle,
    refs: CategorizedRefcount<AsyncCacheRef>,
    outstanding: AtomicUsize,
    max_outstanding: usize,
    stopped: AtomicBool,
    drained: Arc<Notify>,
}

/// Adapter dispatching a blocking cache onto the tokio blocking pool
pub struct AsyncCache {
    inner: Arc<AsyncInner>,
}

impl AsyncCache {
    pub fn new(cache: Arc<dyn CacheInterface>, handle: Handle) -> Self {
        Self::with_max_outstanding(cache, handle, DEFAULT_MAX_OUTSTANDING)
    }

    pub fn with_max_outstanding(
        cache: Arc<dyn CacheInterface>,
        handle: Handle,
        max_outstanding: usize,
    ) -> Self {
        let drained = Arc::new(Notify::new());
        let refs = CategorizedRefcount::new();
        let notify = drained.clone();
        refs.set_last_ref_removed(move || notify.notify_waiters());
        refs.add_ref(AsyncCacheRef::Owner);
        Self {
            inner: Arc::new(AsyncInner {
                cache,
                handle,
                refs,
                outstanding: AtomicUsize::new(0),
                max_outstanding,
                stopped: AtomicBool::new(false),
                drained,
            }),
        }
    }

    pub fn format_name(cache: &str) -> String {
        format!("AsyncCache({})", cache)
    }

    /// Operations queued or running
    pub fn outstanding_operations(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn debug_refs(&self) -> String {
        self.inner.refs.debug_string()
    }

    /// Resolve once shutdown has happened and every operation finished
    pub async fn wait_for_drain(&self) {
        loop {
            let notified = self.inner.drained.notified();
            if self.inner.refs.total() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn spawn<F>(&self, category: AsyncCacheRef, op: F)
    where
        F: FnOnce(&AsyncInner) + Send + 'static,
    {
        let inner = self.inner.clone();
        inner.refs.add_ref(category);
        inner.outstanding.fetch_add(1, Ordering::AcqRel);
        self.inner.handle.spawn_blocking(move || {
            op(&inner);
            inner.refs.release_ref(category);
            inner.outstanding.fetch_sub(1, Ordering::AcqRel);
        });
    }

    fn over_limit(&self) -> bool {
        self.outstanding_operations() >= self.inner.max_outstanding
    }
}

impl CacheInterface for AsyncCache {
    fn get(&self, key: &str, callback: Box<dyn CacheCallback>) {
        if self.inner.stopped.load(Ordering::Acquire) {
            deliver(callback, key, KeyState::NotFound, None);
            return;
        }
        if self.over_limit() {
            debug!(key, "Async cache overloaded");
            deliver(callback, key, KeyState::Overload, None);
            return;
        }
        let key = key.to_string();
        self.spawn(AsyncCacheRef::Get, move |inner| {
            if inner.stopped.load(Ordering::Acquire) {
                deliver(callback, &key, KeyState::NotFound, None);
            } else {
                inner.cache.get(&key, callback);
            }
        });
    }

    fn multi_get(&self, request: Vec<KeyCallback>) {
        if self.inner.stopped.load(Ordering::Acquire) {
            report_multi_get_not_found(request);
            return;
        }
        if self.over_limit() {
            for KeyCallback { key, callback } in request {
                deliver(callback, &key, KeyState::Overload, None);
            }
            return;
        }
        self.spawn(AsyncCacheRef::MultiGet, move |inner| {
            if inner.stopped.load(Ordering::Acquire) {
                report_multi_get_not_found(request);
            } else {
                inner.cache.multi_get(request);
            }
        });
    }

    fn put(&self, key: &str, value: Bytes) {
        if self.inner.stopped.load(Ordering::Acquire) {
            return;
        }
        let key = key.to_string();
        self.spawn(AsyncCacheRef::Put, move |inner| {
            if !inner.stopped.load(Ordering::Acquire) {
                inner.cache.put(&key, value);
            }
        });
    }

    fn delete(&self, key: &str) {
        if self.inner.stopped.load(Ordering::Acquire) {
            return;
        }
        let key = key.to_string();
        self.spawn(AsyncCacheRef::Delete, move |inner| {
            if !inner.stopped.load(Ordering::Acquire) {
                inner.cache.delete(&key);
            }
        });
    }

    fn name(&self) -> String {
        Self::format_name(&self.inner.cache.name())
    }

    fn is_blocking(&self) -> bool {
        false
    }

    fn is_healthy(&self) -> bool {
        !self.inner.stopped.load(Ordering::Acquire) && self.inner.cache.is_healthy()
    }

    fn shut_down(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cache.shut_down();
        self.inner.refs.release_ref(AsyncCacheRef::Owner);
    }
}
