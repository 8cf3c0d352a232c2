//! Cache Primitives
//!
//! Everything below the HTTP layer: the uniform callback-based cache
//! interface, the in-memory LRU backend, the wrappers that compose over it,
//! and the purge machinery consulted on every HTTP read.
//!
//! # Wrappers
//!
//! Every wrapper implements [`CacheInterface`] itself, so stacks are built
//! by nesting:
//!
//! ```text
//! CacheStats(CacheBatcher(WriteThroughCache(Compressed(LRU), Compressed(LRU))))
//! ```
//!
//! - [`CompressedCache`] - deflate with CRC, corruption surfaces as a miss
//! - [`CacheStats`] - hit/miss counters and latency histograms
//! - [`WriteThroughCache`] - L1/L2 with an L1 size cap
//! - [`CacheBatcher`] - same-key coalescing and bounded parallelism
//! - [`AsyncCache`] - runs a blocking cache on the tokio blocking pool
//! - [`DelayCache`] - holds deliveries for chosen keys (tests)

pub mod async_cache;
pub mod batcher;
pub mod compressed;
pub mod delay_cache;
pub mod interface;
pub mod lru;
pub mod purge_context;
pub mod purge_set;
pub mod stats;
pub mod testing;
pub mod write_through;

pub use async_cache::{AsyncCache, AsyncCacheRef};
pub use batcher::{CacheBatcher, CacheBatcherConfig};
pub use compressed::{CompressedCache, PayloadMode};
pub use delay_cache::DelayCache;
pub use interface::{CacheCallback, CacheInterface, FnCallback, KeyCallback, KeyState};
pub use lru::{LruCache, SizedLru};
pub use purge_context::{PurgeCallback, PurgeContext, PurgeOptions, PurgePoller, PurgeSetCallback};
pub use purge_set::PurgeSet;
pub use stats::CacheStats;
pub use write_through::WriteThroughCache;
