//! Purge Context
//!
//! Cross-process cache invalidation backed by a shared text file and a
//! named lock.
//!
//! # Architecture
//!
//! ```text
//!   add_purge_url / set_cache_purge_global_timestamp_ms
//!         │
//!         ▼
//!   pending PurgeSet + callbacks ──(batching delay)──▶ try_lock_steal_old
//!                                                          │
//!                         ┌──────── held ──────────────────┘
//!                         ▼
//!         read file ─▶ merge pending ─▶ write atomically ─▶ re-read, verify
//!                         ▲                                     │
//!                         └──────── mismatch (retry) ───────────┘
//!                                                               │ ok
//!                                                               ▼
//!                       unlock ─▶ purge_index += 1 ─▶ publish ─▶ callbacks
//! ```
//!
//! # File format
//!
//! ```text
//! <global_timestamp_ms>
//! <ts_ms> <url>
//! <ts_ms> <url>
//! ```
//!
//! An empty file flushes everything older than the file's mtime.
//!
//! # Design
//!
//! - The lock is never waited on. A mutation that cannot take the lock
//!   stays pending and is retried by later mutations and by
//!   [`PurgeContext::poll_file_system`]; after `lock_timeout_ms` its
//!   callbacks fail with `"timeout"`.
//! - Readers see an immutable [`PurgeSet`] snapshot; a changed file swaps
//!   in a new snapshot and fires the update callback.
//! - `purge_index` lives in the shared statistics; a context that sees it
//!   ahead of its own copy re-reads the file without waiting for the poll
//!   interval.
//! - Callbacks run with no internal lock held.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::purge_set::{PurgeSet, INITIAL_TIMESTAMP_MS};
use crate::error::{Error, Result};
use crate::stats::{Statistics, UpDownCounter, Variable};
use crate::util::file_system::FileSystem;
use crate::util::named_lock::{NamedLock, NamedLockManager};
use crate::util::simple_random::SimpleRandom;
use crate::util::timer::Timer;

pub const CANCELLATIONS: &str = "purge_cancellations";
pub const CONTENTIONS: &str = "purge_contentions";
pub const FILE_PARSE_FAILURES: &str = "purge_file_parse_failures";
pub const FILE_STATS: &str = "purge_file_stats";
pub const FILE_WRITE_FAILURES: &str = "purge_file_write_failures";
pub const FILE_WRITES: &str = "purge_file_writes";
pub const PURGE_INDEX: &str = "purge_index";
pub const PURGE_POLL_TIMESTAMP_MS: &str = "_purge_poll_timestamp_ms";

/// Completion of a purge request: success flag and failure reason
pub type PurgeCallback = Box<dyn FnOnce(bool, &str) + Send>;

/// Listener for new purge set snapshots
pub type PurgeSetCallback = Arc<dyn Fn(Arc<PurgeSet>) + Send + Sync>;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

// =============================================================================
// Configuration
// =============================================================================

/// Purge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgeOptions {
    /// Shared purge file; `None` disables purging
    pub purge_file: Option<PathBuf>,

    /// Byte budget of the per-URL purge map
    pub max_bytes_in_purge_set: usize,

    /// Re-read the file at least this often
    pub poll_interval_ms: i64,

    /// Take over a lock held longer than this
    pub steal_after_ms: i64,

    /// Fail pending purges that waited this long for the lock
    pub lock_timeout_ms: i64,

    /// Timestamps further ahead of now are rejected
    pub max_future_ms: i64,

    /// When off, only the file's mtime counts as a global purge
    pub enable_url_purge: bool,

    /// Verification failures tolerated per write before giving up
    pub max_contention_retries: u32,

    /// Collect purges for this long before taking the lock
    pub request_batching_delay_ms: i64,
}

impl Default for PurgeOptions {
    fn default() -> Self {
        Self {
            purge_file: None,
            max_bytes_in_purge_set: crate::cache::purge_set::DEFAULT_MAX_BYTES,
            poll_interval_ms: 5_000,
            steal_after_ms: 10_000,
            lock_timeout_ms: 15_000,
            max_future_ms: 30 * DAY_MS,
            enable_url_purge: true,
            max_contention_retries: 2,
            request_batching_delay_ms: 0,
        }
    }
}

// =============================================================================
// Purge Context
// =============================================================================

struct PendingState {
    purges: PurgeSet,
    callbacks: Vec<PurgeCallback>,
    first_pending_ms: i64,
    writing: bool,
    reading: bool,
    local_purge_index: i64,
    last_poll_ms: i64,
}

/// Shared-file invalidation state for one process
pub struct PurgeContext {
    filename: PathBuf,
    file_system: Arc<dyn FileSystem>,
    timer: Arc<dyn Timer>,
    lock: Box<dyn NamedLock>,
    options: PurgeOptions,
    purge_set: RwLock<Arc<PurgeSet>>,
    state: Mutex<PendingState>,
    update_callback: RwLock<Option<PurgeSetCallback>>,

    cancellations: Arc<dyn Variable>,
    contentions: Arc<dyn Variable>,
    file_parse_failures: Arc<dyn Variable>,
    file_stats: Arc<dyn Variable>,
    file_write_failures: Arc<dyn Variable>,
    file_writes: Arc<dyn Variable>,
    purge_index: Arc<dyn Variable>,
    purge_poll_timestamp_ms: Arc<dyn UpDownCounter>,
}

impl std::fmt::Debug for PurgeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PurgeContext")
            .field("filename", &self.filename)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl PurgeContext {
    pub fn new(
        filename: impl Into<PathBuf>,
        file_system: Arc<dyn FileSystem>,
        timer: Arc<dyn Timer>,
        lock_manager: &dyn NamedLockManager,
        options: PurgeOptions,
        stats: &dyn Statistics,
    ) -> Self {
        let filename = filename.into();
        let lock = lock_manager.create_named_lock(&Self::format_lock_name(&filename));
        let max_bytes = options.max_bytes_in_purge_set;
        Self {
            filename,
            file_system,
            timer,
            lock,
            purge_set: RwLock::new(Arc::new(PurgeSet::with_max_bytes(max_bytes))),
            state: Mutex::new(PendingState {
                purges: PurgeSet::with_max_bytes(max_bytes),
                callbacks: Vec::new(),
                first_pending_ms: 0,
                writing: false,
                reading: false,
                local_purge_index: 0,
                last_poll_ms: i64::MIN / 2,
            }),
            update_callback: RwLock::new(None),
            options,
            cancellations: stats.get_variable(CANCELLATIONS),
            contentions: stats.get_variable(CONTENTIONS),
            file_parse_failures: stats.get_variable(FILE_PARSE_FAILURES),
            file_stats: stats.get_variable(FILE_STATS),
            file_write_failures: stats.get_variable(FILE_WRITE_FAILURES),
            file_writes: stats.get_variable(FILE_WRITES),
            purge_index: stats.get_variable(PURGE_INDEX),
            purge_poll_timestamp_ms: stats.get_up_down_counter(PURGE_POLL_TIMESTAMP_MS),
        }
    }

    pub fn init_stats(stats: &dyn Statistics) -> Result<()> {
        stats.add_variable(CANCELLATIONS)?;
        stats.add_variable(CONTENTIONS)?;
        stats.add_variable(FILE_PARSE_FAILURES)?;
        stats.add_variable(FILE_STATS)?;
        stats.add_variable(FILE_WRITE_FAILURES)?;
        stats.add_variable(FILE_WRITES)?;
        stats.add_variable(PURGE_INDEX)?;
        stats.add_up_down_counter(PURGE_POLL_TIMESTAMP_MS)?;
        Ok(())
    }

    pub fn format_lock_name(filename: &Path) -> String {
        format!("{}.lock", filename.display())
    }

    pub fn lock_name(&self) -> String {
        Self::format_lock_name(&self.filename)
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    pub fn options(&self) -> &PurgeOptions {
        &self.options
    }

    /// Whether an entry for `url` written at `timestamp_ms` survives
    pub fn is_valid(&self, url: &str, timestamp_ms: i64) -> bool {
        self.purge_set.read().is_valid(url, timestamp_ms)
    }

    /// Current snapshot
    pub fn purge_set(&self) -> Arc<PurgeSet> {
        self.purge_set.read().clone()
    }

    /// Called with every new snapshot, outside internal locks
    pub fn set_update_callback(&self, callback: PurgeSetCallback) {
        *self.update_callback.write() = Some(callback);
    }

    /// Mutations waiting for the lock
    pub fn num_pending(&self) -> usize {
        self.state.lock().callbacks.len()
    }

    /// Invalidate `url` for entries written at or before `timestamp_ms`
    pub fn add_purge_url(&self, url: &str, timestamp_ms: i64, callback: PurgeCallback) {
        if !self.options.enable_url_purge {
            callback(false, "URL purging is disabled");
            return;
        }
        self.enqueue(callback, |purges| {
            purges.put(url, timestamp_ms);
        });
    }

    /// Invalidate every entry written at or before `timestamp_ms`
    pub fn set_cache_purge_global_timestamp_ms(&self, timestamp_ms: i64, callback: PurgeCallback) {
        self.enqueue(callback, |purges| {
            purges.update_global_invalidation_timestamp_ms(timestamp_ms);
        });
    }

    /// Fail every pending mutation with `"cancelled"`
    pub fn cancel_pending(&self) {
        let (_, callbacks) = {
            let mut state = self.state.lock();
            self.take_pending(&mut state)
        };
        self.cancel(callbacks, "cancelled");
    }

    /// Retry pending writes, then re-read the file if another context wrote
    /// it or the poll interval elapsed
    pub fn poll_file_system(&self) {
        self.process_pending();

        let now_ms = self.timer.now_ms();
        let global_index = self.purge_index.get();
        let needs_update = {
            let mut state = self.state.lock();
            let needs_update = state.local_purge_index < global_index;
            let interval_elapsed = now_ms - state.last_poll_ms >= self.options.poll_interval_ms;
            if state.reading || !(needs_update || interval_elapsed) {
                return;
            }
            state.reading = true;
            state.local_purge_index = global_index;
            state.last_poll_ms = now_ms;
            needs_update
        };
        self.purge_poll_timestamp_ms.set(now_ms);

        let read = self.read_purge_file();
        let changed = match read {
            Ok(set) => self.publish(set),
            Err(e) => {
                warn!(file = %self.filename.display(), error = %e, "Failed to read purge file");
                false
            }
        };

        let mut state = self.state.lock();
        if changed && !needs_update {
            state.local_purge_index = self.purge_index.add(1);
        }
        state.reading = false;
    }

    fn enqueue<F>(&self, callback: PurgeCallback, mutate: F)
    where
        F: FnOnce(&mut PurgeSet),
    {
        {
            let mut state = self.state.lock();
            if state.callbacks.is_empty() {
                state.first_pending_ms = self.timer.now_ms();
            }
            mutate(&mut state.purges);
            state.callbacks.push(callback);
        }
        self.process_pending();
    }

    fn take_pending(&self, state: &mut PendingState) -> (PurgeSet, Vec<PurgeCallback>) {
        let purges = std::mem::replace(
            &mut state.purges,
            PurgeSet::with_max_bytes(self.options.max_bytes_in_purge_set),
        );
        (purges, std::mem::take(&mut state.callbacks))
    }

    fn cancel(&self, callbacks: Vec<PurgeCallback>, reason: &str) {
        if callbacks.is_empty() {
            return;
        }
        self.cancellations.add(callbacks.len() as i64);
        info!(
            file = %self.filename.display(),
            count = callbacks.len(),
            reason,
            "Cancelled pending purges"
        );
        for callback in callbacks {
            callback(false, reason);
        }
    }

    /// Take the lock for pending mutations if they are due
    fn process_pending(&self) {
        let now_ms = self.timer.now_ms();
        let timed_out = {
            let mut state = self.state.lock();
            if state.callbacks.is_empty() || state.writing {
                return;
            }
            let ready_at_ms = state.first_pending_ms + self.options.request_batching_delay_ms;
            if now_ms < ready_at_ms {
                return;
            }
            if self.lock.try_lock_steal_old(self.options.steal_after_ms) {
                state.writing = true;
                None
            } else if now_ms - ready_at_ms >= self.options.lock_timeout_ms {
                Some(self.take_pending(&mut state).1)
            } else {
                debug!(lock = %self.lock.name(), "Purge lock busy, keeping purges pending");
                return;
            }
        };
        match timed_out {
            Some(callbacks) => self.cancel(callbacks, "timeout"),
            None => self.update_purge_file(),
        }
    }

    /// Read-merge-write-verify with the lock held
    fn update_purge_file(&self) {
        let mut pending = PurgeSet::with_max_bytes(self.options.max_bytes_in_purge_set);
        let mut callbacks = Vec::new();
        let mut failures = 0;

        let outcome = loop {
            {
                let mut state = self.state.lock();
                let (purges, mut queued) = self.take_pending(&mut state);
                pending.merge(&purges);
                callbacks.append(&mut queued);
            }

            let mut merged = match self.read_purge_file() {
                Ok(set) => set,
                Err(e) => break Err(e.to_string()),
            };
            merged.merge(&pending);
            let contents = serialize(&merged);

            self.file_writes.add(1);
            match self.file_system.write_file_atomic(&self.filename, contents.as_bytes()) {
                Ok(()) if self.verify(&contents) => break Ok(merged),
                Ok(()) => debug!(file = %self.filename.display(), "Purge file changed under us"),
                Err(e) => warn!(file = %self.filename.display(), error = %e, "Failed to write purge file"),
            }

            self.contentions.add(1);
            failures += 1;
            if failures > self.options.max_contention_retries {
                break Err(format!("gave up after {} contended writes", failures));
            }
        };

        self.lock.unlock();
        self.state.lock().writing = false;

        match outcome {
            Ok(set) => {
                let index = self.purge_index.add(1);
                self.state.lock().local_purge_index = index;
                self.publish(set);
                debug!(file = %self.filename.display(), count = callbacks.len(), "Wrote purge file");
                for callback in callbacks {
                    callback(true, "");
                }
            }
            Err(reason) => {
                self.file_write_failures.add(callbacks.len() as i64);
                warn!(file = %self.filename.display(), %reason, "Purge file update failed");
                for callback in callbacks {
                    callback(false, &reason);
                }
            }
        }

        // Mutations queued after the last merge need a write of their own.
        self.process_pending();
    }

    fn verify(&self, expected: &str) -> bool {
        matches!(
            self.file_system.read_file(&self.filename),
            Ok(Some(contents)) if contents == expected.as_bytes()
        )
    }

    /// Swap in `set` if it differs; fires the update callback
    fn publish(&self, set: PurgeSet) -> bool {
        let set = Arc::new(set);
        {
            let mut current = self.purge_set.write();
            if **current == *set {
                return false;
            }
            *current = set.clone();
        }
        let callback = self.update_callback.read().clone();
        if let Some(callback) = callback {
            callback(set);
        }
        true
    }

    fn read_purge_file(&self) -> Result<PurgeSet> {
        self.file_stats.add(1);
        let mut set = PurgeSet::with_max_bytes(self.options.max_bytes_in_purge_set);

        let contents = match self.file_system.read_file(&self.filename)? {
            Some(contents) => contents,
            None => return Ok(set),
        };
        let text = String::from_utf8_lossy(&contents);
        if !self.options.enable_url_purge || text.trim().is_empty() {
            if let Some(mtime_ms) = self.file_system.mtime_ms(&self.filename)? {
                set.update_global_invalidation_timestamp_ms(mtime_ms);
            }
            return Ok(set);
        }

        let now_ms = self.timer.now_ms();
        let mut lines = text.split('\n');
        let first = lines.next().unwrap_or_default();
        match self.parse_timestamp(first, now_ms, true, 1) {
            Ok(ts) => {
                set.update_global_invalidation_timestamp_ms(ts);
            }
            Err(e) => {
                info!(error = %e, "Ignoring purge file");
                self.file_parse_failures.add(1);
                return Ok(set);
            }
        }

        for (index, line) in lines.enumerate() {
            if line.is_empty() {
                continue;
            }
            let line_number = index + 2;
            let parsed = match line.split_once(' ') {
                Some((ts, url)) => self
                    .parse_timestamp(ts, now_ms, false, line_number)
                    .map(|ts| (ts, url)),
                None => Err(self.parse_error(line_number, "missing url")),
            };
            match parsed {
                Ok((ts, url)) => {
                    set.put(url, ts);
                }
                Err(e) => {
                    info!(error = %e, "Skipping malformed purge record");
                    self.file_parse_failures.add(1);
                }
            }
        }
        Ok(set)
    }

    fn parse_timestamp(
        &self,
        text: &str,
        now_ms: i64,
        allow_initial: bool,
        line: usize,
    ) -> Result<i64> {
        let ts: i64 = text
            .trim()
            .parse()
            .map_err(|_| self.parse_error(line, format!("timestamp {:?} is not a number", text)))?;
        if allow_initial && ts == INITIAL_TIMESTAMP_MS {
            return Ok(ts);
        }
        if ts <= 0 || ts > now_ms + self.options.max_future_ms {
            return Err(self.parse_error(line, format!("timestamp {} out of range", ts)));
        }
        Ok(ts)
    }

    fn parse_error(&self, line: usize, reason: impl Into<String>) -> Error {
        Error::PurgeFileParse {
            path: self.filename.display().to_string(),
            line,
            reason: reason.into(),
        }
    }
}

fn serialize(set: &PurgeSet) -> String {
    let mut out = format!("{}\n", set.global_invalidation_timestamp_ms());
    for (url, ts) in set.iter() {
        out.push_str(&format!("{} {}\n", ts, url));
    }
    out
}

// =============================================================================
// Background Poller
// =============================================================================

/// Polls a [`PurgeContext`] on an interval with a little jitter
pub struct PurgePoller {
    context: Arc<PurgeContext>,
    interval: Duration,
    max_jitter_ms: u32,
    random: SimpleRandom,
}

impl PurgePoller {
    pub fn new(context: Arc<PurgeContext>) -> Self {
        let interval_ms = context.options().poll_interval_ms.max(1) as u64;
        Self {
            context,
            interval: Duration::from_millis(interval_ms),
            max_jitter_ms: (interval_ms / 10).min(u32::MAX as u64) as u32,
            random: SimpleRandom::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration, max_jitter_ms: u32) -> Self {
        self.interval = interval;
        self.max_jitter_ms = max_jitter_ms;
        self
    }

    fn next_delay(&self) -> Duration {
        self.interval + Duration::from_millis(self.random.next_below(self.max_jitter_ms.saturating_add(1)) as u64)
    }

    /// Poll until `shutdown` fires
    #[instrument(skip(self, shutdown), fields(file = %self.context.filename().display()))]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Starting purge poller every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = sleep(self.next_delay()) => {
                    self.context.poll_file_system();
                }

                _ = shutdown.cancelled() => {
                    info!("Purge poller shutting down");
                    break;
                }
            }
        }
    }
}
