//! pagecache-purge
//!
//! Administers the shared purge file consulted by every cache process.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      pagecache-purge                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  purge-url / flush-all ──▶ PurgeContext ──▶ lock ▸ merge ▸   │
//! │                                             write ▸ verify   │
//! │  list ──────────────────▶ PurgeContext ──▶ read ▸ print      │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::oneshot;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pagecache::cache::purge_context::{PurgeCallback, PurgeContext, PurgeOptions};
use pagecache::config::CacheSystemConfig;
use pagecache::stats::{SimpleStats, Statistics};
use pagecache::util::file_system::StdFileSystem;
use pagecache::util::named_lock::FileSystemLockManager;
use pagecache::util::timer::{SystemTimer, Timer};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Purge-file administration for the page cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache configuration file (YAML, or JSON by extension)
    #[arg(long, env = "PAGECACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Purge file; overrides the configuration's purge.purge_file
    #[arg(long, env = "PAGECACHE_PURGE_FILE")]
    purge_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Invalidate one URL
    PurgeUrl {
        url: String,

        /// Purge entries written at or before this time; defaults to now
        #[arg(long)]
        timestamp_ms: Option<i64>,
    },

    /// Invalidate every cached entry
    FlushAll {
        /// Purge entries written at or before this time; defaults to now
        #[arg(long)]
        timestamp_ms: Option<i64>,
    },

    /// Print the current purge set
    List,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let options = load_purge_options(&args)?;
    let purge_file = match options.purge_file.clone() {
        Some(path) => path,
        None => bail!("no purge file: pass --purge-file or set purge.purge_file"),
    };
    info!("Using purge file {}", purge_file.display());

    let timer: Arc<dyn Timer> = Arc::new(SystemTimer::new());
    let stats = SimpleStats::new(timer.clone());
    PurgeContext::init_stats(&stats)?;
    let file_system = Arc::new(StdFileSystem::new());
    let locks = FileSystemLockManager::new(lock_dir(&purge_file), file_system.clone(), timer.clone());
    let lock_timeout = Duration::from_millis(options.lock_timeout_ms.max(0) as u64);
    let context = PurgeContext::new(
        purge_file,
        file_system,
        timer.clone(),
        &locks,
        options,
        &stats,
    );

    match args.command {
        Command::PurgeUrl { url, timestamp_ms } => {
            let ts = timestamp_ms.unwrap_or_else(|| timer.now_ms());
            submit(&context, lock_timeout, |cb| context.add_purge_url(&url, ts, cb))
                .await
                .with_context(|| format!("purging {}", url))?;
            info!(url = %url, timestamp_ms = ts, "URL purged");
        }
        Command::FlushAll { timestamp_ms } => {
            let ts = timestamp_ms.unwrap_or_else(|| timer.now_ms());
            submit(&context, lock_timeout, |cb| {
                context.set_cache_purge_global_timestamp_ms(ts, cb)
            })
            .await
            .context("flushing cache")?;
            info!(timestamp_ms = ts, "Cache flushed");
        }
        Command::List => {
            context.poll_file_system();
            let set = context.purge_set();
            println!("global {}", set.global_invalidation_timestamp_ms());
            for (url, ts) in set.iter() {
                println!("{} {}", ts, url);
            }
        }
    }

    for (name, value) in stats.scalar_values() {
        if value != 0 {
            info!(stat = %name, value, "purge statistic");
        }
    }

    Ok(())
}

/// Queue one purge and drive the context until its callback fires
async fn submit<F>(context: &PurgeContext, timeout: Duration, enqueue: F) -> anyhow::Result<()>
where
    F: FnOnce(PurgeCallback),
{
    let (tx, mut rx) = oneshot::channel::<(bool, String)>();
    enqueue(Box::new(move |ok, reason| {
        let _ = tx.send((ok, reason.to_string()));
    }));

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match rx.try_recv() {
            Ok((true, _)) => return Ok(()),
            Ok((false, reason)) => bail!("purge failed: {}", reason),
            Err(oneshot::error::TryRecvError::Closed) => bail!("purge callback dropped"),
            Err(oneshot::error::TryRecvError::Empty) => {}
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("Timed out waiting for the purge lock");
            context.cancel_pending();
            bail!("timed out after {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        context.poll_file_system();
    }
}

fn load_purge_options(args: &Args) -> anyhow::Result<PurgeOptions> {
    let mut options = match &args.config {
        Some(path) => {
            CacheSystemConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?
                .purge
        }
        None => PurgeOptions::default(),
    };
    if let Some(path) = &args.purge_file {
        options.purge_file = Some(path.clone());
    }
    Ok(options)
}

fn lock_dir(purge_file: &Path) -> PathBuf {
    match purge_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Initialize logging
fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
