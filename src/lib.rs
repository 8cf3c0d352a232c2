//! PageCache - Layered HTTP Response Cache
//!
//! A two-tier, optionally compressed, validator-aware cache of HTTP response
//! artifacts, fronted by a coalescing batcher, governed by a cross-process
//! purge context, and observable through split statistics.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          HttpCache                              │
//! │   freshness · fallback · negative caching · Vary · Etag · TTL   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  CacheStats ──▶ CacheBatcher ──▶ WriteThroughCache              │
//! │                                   │            │                │
//! │                         CompressedCache  CompressedCache        │
//! │                                   │            │                │
//! │                               LruCache(L1)  LruCache(L2)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  PurgeContext ◀──▶ purge file + named lock (shared filesystem)  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reads flow top to bottom; writes are serialized by the HTTP layer and
//! pass through the same stack, except the batcher forwards puts directly.
//!
//! # Modules
//!
//! - [`cache`] - Cache primitives, wrappers, batcher, and purge machinery
//! - [`config`] - Serde-backed configuration structures
//! - [`error`] - Error types
//! - [`http`] - HTTP semantics layered on the cache primitives
//! - [`stats`] - Named counters, histograms, and split statistics
//! - [`system`] - Assembly of the full cache stack
//! - [`util`] - Timers, hashers, multimaps, wildcards, and file-system seams

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod stats;
pub mod system;
pub mod util;

// Re-export commonly used types
pub use cache::{
    CacheBatcher, CacheCallback, CacheInterface, CacheStats, CompressedCache, KeyState,
    LruCache, PurgeContext, PurgeSet, WriteThroughCache,
};
pub use config::CacheSystemConfig;
pub use error::{Error, Result};
pub use http::{
    CacheStatus, FetchResponseStatus, FindResult, HttpCache, HttpCacheCallback,
    HttpCacheInterface, HttpCacheOptions, HttpValue, RequestContext, RequestProperties,
    ResponseHeaders, WriteThroughHttpCache,
};
pub use stats::{SimpleStats, SplitStatistics, Statistics};
pub use system::{CacheSystem, SystemDependencies};
