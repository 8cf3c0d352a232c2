//! Cache System
//!
//! Assembles a complete cache stack from a [`CacheSystemConfig`].
//!
//! # Architecture
//!
//! ```text
//!   HttpCache ──▶ CacheStats(prefix)
//!                    └▶ CacheBatcher                  (batcher.enabled)
//!                         └▶ WriteThroughCache        (lru.l2_max_bytes set)
//!                              ├▶ Compressed(LRU L1)  (compression.enabled)
//!                              └▶ Compressed(LRU L2)
//!
//!   PurgeContext (purge.purge_file set) ◀── polled on every find
//!   PurgePoller  (start_background)     ◀── polled on an interval
//! ```

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::batcher::CacheBatcher;
use crate::cache::compressed::CompressedCache;
use crate::cache::interface::CacheInterface;
use crate::cache::lru::LruCache;
use crate::cache::purge_context::{PurgeContext, PurgePoller};
use crate::cache::stats::CacheStats;
use crate::cache::write_through::WriteThroughCache;
use crate::config::CacheSystemConfig;
use crate::error::Result;
use crate::http::http_cache::{HttpCache, HttpCacheInterface, HttpCacheSettings};
use crate::stats::Statistics;
use crate::util::file_system::{FileSystem, StdFileSystem};
use crate::util::hasher::{ContentHasher, Xxh3ContentHasher};
use crate::util::named_lock::FileSystemLockManager;
use crate::util::timer::Timer;

/// Collaborators injected into a [`CacheSystem`]
#[derive(Clone)]
pub struct SystemDependencies {
    pub timer: Arc<dyn Timer>,
    pub stats: Arc<dyn Statistics>,
    pub file_system: Arc<dyn FileSystem>,
    pub hasher: Arc<dyn ContentHasher>,
}

impl SystemDependencies {
    /// Real file system and content hasher
    pub fn new(timer: Arc<dyn Timer>, stats: Arc<dyn Statistics>) -> Self {
        Self {
            timer,
            stats,
            file_system: Arc::new(StdFileSystem::new()),
            hasher: Arc::new(Xxh3ContentHasher::new()),
        }
    }
}

/// A fully wired cache stack
pub struct CacheSystem {
    config: CacheSystemConfig,
    l1: Arc<LruCache>,
    l2: Option<Arc<LruCache>>,
    backend: Arc<dyn CacheInterface>,
    http_cache: Arc<HttpCache>,
    purge_context: Option<Arc<PurgeContext>>,
    shutdown: CancellationToken,
}

impl CacheSystem {
    pub fn new(
        config: CacheSystemConfig,
        timer: Arc<dyn Timer>,
        stats: Arc<dyn Statistics>,
    ) -> Result<Self> {
        Self::with_dependencies(config, SystemDependencies::new(timer, stats))
    }

    pub fn with_dependencies(config: CacheSystemConfig, deps: SystemDependencies) -> Result<Self> {
        config.validate()?;
        let stats = deps.stats.as_ref();
        Self::init_stats(&config, stats)?;

        let l1 = Arc::new(LruCache::new(config.lru.l1_max_bytes));
        let l2 = config
            .lru
            .l2_max_bytes
            .map(|max_bytes| Arc::new(LruCache::new(max_bytes)));

        let tier = |lru: &Arc<LruCache>| -> Arc<dyn CacheInterface> {
            if config.compression.enabled {
                let compressed = CompressedCache::new(lru.clone(), stats);
                compressed.set_compression_level(config.compression.level);
                Arc::new(compressed)
            } else {
                lru.clone()
            }
        };
        let mut backend = tier(&l1);
        if let Some(l2) = &l2 {
            let write_through = WriteThroughCache::new(backend, tier(l2));
            write_through.set_cache1_limit(config.write_through.cache1_limit);
            backend = Arc::new(write_through);
        }
        if config.batcher.enabled {
            backend = Arc::new(CacheBatcher::with_config(
                backend,
                config.batcher.to_config(),
                stats,
            ));
        }
        let backend: Arc<dyn CacheInterface> = Arc::new(CacheStats::new(
            config.stats_prefix(),
            backend,
            deps.timer.clone(),
            stats,
        ));

        let settings = Arc::new(HttpCacheSettings::from_options(&config.http));
        let http_cache = HttpCache::with_settings(
            backend.clone(),
            deps.timer.clone(),
            deps.hasher.clone(),
            settings,
            stats,
        );
        let levels = if l2.is_some() { 2 } else { 1 };
        http_cache.set_cache_levels(config.http.cache_levels.max(levels));

        let purge_context = config.purge.purge_file.as_ref().map(|purge_file| {
            let lock_dir = purge_file
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let locks = FileSystemLockManager::new(
                lock_dir,
                deps.file_system.clone(),
                deps.timer.clone(),
            );
            Arc::new(PurgeContext::new(
                purge_file.clone(),
                deps.file_system.clone(),
                deps.timer.clone(),
                &locks,
                config.purge.clone(),
                stats,
            ))
        });
        http_cache.set_purge_context(purge_context.clone());

        info!(
            cache = %http_cache.name(),
            purge_file = ?config.purge.purge_file,
            "Cache system assembled"
        );

        Ok(Self {
            config,
            l1,
            l2,
            backend,
            http_cache: Arc::new(http_cache),
            purge_context,
            shutdown: CancellationToken::new(),
        })
    }

    fn init_stats(config: &CacheSystemConfig, stats: &dyn Statistics) -> Result<()> {
        HttpCache::init_stats(stats)?;
        CacheStats::init_stats(config.stats_prefix(), stats)?;
        if config.compression.enabled {
            CompressedCache::init_stats(stats)?;
        }
        if config.batcher.enabled {
            CacheBatcher::init_stats(stats)?;
        }
        if config.purge.purge_file.is_some() {
            PurgeContext::init_stats(stats)?;
        }
        Ok(())
    }

    pub fn config(&self) -> &CacheSystemConfig {
        &self.config
    }

    pub fn http_cache(&self) -> &Arc<HttpCache> {
        &self.http_cache
    }

    /// Top of the primitive stack the HTTP cache writes through
    pub fn backend(&self) -> &Arc<dyn CacheInterface> {
        &self.backend
    }

    pub fn l1(&self) -> &Arc<LruCache> {
        &self.l1
    }

    pub fn l2(&self) -> Option<&Arc<LruCache>> {
        self.l2.as_ref()
    }

    pub fn purge_context(&self) -> Option<&Arc<PurgeContext>> {
        self.purge_context.as_ref()
    }

    /// Spawn the purge poller; it stops on [`CacheSystem::shut_down`]
    pub fn start_background(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(context) = &self.purge_context {
            let poller = Arc::new(PurgePoller::new(context.clone()));
            handles.push(tokio::spawn(poller.run(self.shutdown.child_token())));
        }
        handles
    }

    /// Stop background tasks, fail pending purges and shut the stack down
    pub fn shut_down(&self) {
        info!("Shutting down cache system");
        self.shutdown.cancel();
        if let Some(context) = &self.purge_context {
            context.cancel_pending();
        }
        self.backend.shut_down();
    }
}
