//! Named advisory locks shared between processes.
//!
//! The purge context serializes read-modify-write cycles on the purge file
//! through one named lock. Locks are never blocking: callers try, and if
//! the current holder has kept the lock longer than a steal threshold the
//! caller takes it over. A stolen lock is advisory; the purge context
//! detects the resulting races by re-reading what it wrote.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::util::file_system::FileSystem;
use crate::util::timer::Timer;

/// A single named lock handle
pub trait NamedLock: Send + Sync {
    /// Acquire if free
    fn try_lock(&self) -> bool;

    /// Acquire if free, or take it over when the holder acquired it at
    /// least `steal_after_ms` ago
    fn try_lock_steal_old(&self, steal_after_ms: i64) -> bool;

    fn unlock(&self);

    /// Whether this handle believes it holds the lock
    fn held(&self) -> bool;

    fn name(&self) -> &str;
}

/// Factory for named locks
pub trait NamedLockManager: Send + Sync {
    fn create_named_lock(&self, name: &str) -> Box<dyn NamedLock>;
}

// =============================================================================
// In-Process Lock Manager
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct LockRecord {
    holder: u64,
    acquired_ms: i64,
}

/// Lock manager whose locks live in a shared concurrent map
pub struct MemLockManager {
    locks: Arc<DashMap<String, LockRecord>>,
    timer: Arc<dyn Timer>,
    next_holder: AtomicU64,
}

impl MemLockManager {
    pub fn new(timer: Arc<dyn Timer>) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            timer,
            next_holder: AtomicU64::new(1),
        }
    }

    /// Number of currently held locks
    pub fn num_held(&self) -> usize {
        self.locks.len()
    }
}

impl NamedLockManager for MemLockManager {
    fn create_named_lock(&self, name: &str) -> Box<dyn NamedLock> {
        Box::new(MemNamedLock {
            name: name.to_string(),
            holder: self.next_holder.fetch_add(1, Ordering::Relaxed),
            locks: self.locks.clone(),
            timer: self.timer.clone(),
            held: AtomicBool::new(false),
        })
    }
}

struct MemNamedLock {
    name: String,
    holder: u64,
    locks: Arc<DashMap<String, LockRecord>>,
    timer: Arc<dyn Timer>,
    held: AtomicBool,
}

impl MemNamedLock {
    fn acquire(&self, steal_after_ms: Option<i64>) -> bool {
        let now_ms = self.timer.now_ms();
        let record = LockRecord {
            holder: self.holder,
            acquired_ms: now_ms,
        };
        let acquired = match self.locks.entry(self.name.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                true
            }
            Entry::Occupied(mut occupied) => match steal_after_ms {
                Some(steal_after) if now_ms - occupied.get().acquired_ms >= steal_after => {
                    debug!(lock = %self.name, "Stealing stale lock");
                    occupied.insert(record);
                    true
                }
                _ => false,
            },
        };
        if acquired {
            self.held.store(true, Ordering::SeqCst);
        }
        acquired
    }
}

impl NamedLock for MemNamedLock {
    fn try_lock(&self) -> bool {
        self.acquire(None)
    }

    fn try_lock_steal_old(&self, steal_after_ms: i64) -> bool {
        self.acquire(Some(steal_after_ms))
    }

    fn unlock(&self) {
        if self.held.swap(false, Ordering::SeqCst) {
            self.locks
                .remove_if(&self.name, |_, record| record.holder == self.holder);
        }
    }

    fn held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for MemNamedLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

// =============================================================================
// File-System Lock Manager
// =============================================================================

/// Lock manager whose locks are files holding the acquire time in ms
pub struct FileSystemLockManager {
    base_dir: PathBuf,
    file_system: Arc<dyn FileSystem>,
    timer: Arc<dyn Timer>,
}

impl FileSystemLockManager {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        file_system: Arc<dyn FileSystem>,
        timer: Arc<dyn Timer>,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            file_system,
            timer,
        }
    }
}

impl NamedLockManager for FileSystemLockManager {
    fn create_named_lock(&self, name: &str) -> Box<dyn NamedLock> {
        // Lock names may be paths; flatten them into one file name.
        let file_name: String = name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '!' } else { c })
            .collect();
        Box::new(FileNamedLock {
            name: name.to_string(),
            path: self.base_dir.join(file_name),
            file_system: self.file_system.clone(),
            timer: self.timer.clone(),
            held: AtomicBool::new(false),
        })
    }
}

struct FileNamedLock {
    name: String,
    path: PathBuf,
    file_system: Arc<dyn FileSystem>,
    timer: Arc<dyn Timer>,
    held: AtomicBool,
}

impl FileNamedLock {
    fn holder_acquired_ms(&self) -> Option<i64> {
        match self.file_system.read_file(&self.path) {
            Ok(Some(bytes)) => String::from_utf8_lossy(&bytes).trim().parse().ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(lock = %self.name, error = %e, "Failed to read lock file");
                None
            }
        }
    }
}

impl NamedLock for FileNamedLock {
    fn try_lock(&self) -> bool {
        let stamp = self.timer.now_ms().to_string();
        match self
            .file_system
            .try_create_exclusive(&self.path, stamp.as_bytes())
        {
            Ok(true) => {
                self.held.store(true, Ordering::SeqCst);
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(lock = %self.name, error = %e, "Failed to create lock file");
                false
            }
        }
    }

    fn try_lock_steal_old(&self, steal_after_ms: i64) -> bool {
        if self.try_lock() {
            return true;
        }
        let now_ms = self.timer.now_ms();
        // An unreadable stamp means a holder crashed mid-write; treat it as
        // infinitely old.
        let stale = self
            .holder_acquired_ms()
            .map_or(true, |acquired| now_ms - acquired >= steal_after_ms);
        if !stale {
            return false;
        }
        debug!(lock = %self.name, "Stealing stale lock file");
        match self
            .file_system
            .write_file_atomic(&self.path, now_ms.to_string().as_bytes())
        {
            Ok(()) => {
                self.held.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                warn!(lock = %self.name, error = %e, "Failed to steal lock file");
                false
            }
        }
    }

    fn unlock(&self) {
        if self.held.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.file_system.remove_file(&self.path) {
                warn!(lock = %self.name, error = %e, "Failed to remove lock file");
            }
        }
    }

    fn held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for FileNamedLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::file_system::MemFileSystem;
    use crate::util::timer::MockTimer;
    use std::path::Path;

    #[test]
    fn test_mem_lock_exclusive() {
        let timer = Arc::new(MockTimer::default());
        let manager = MemLockManager::new(timer.clone());
        let a = manager.create_named_lock("purge");
        let b = manager.create_named_lock("purge");
        let other = manager.create_named_lock("other");

        assert!(a.try_lock());
        assert!(a.held());
        assert!(!b.try_lock());
        assert!(other.try_lock());
        assert_eq!(manager.num_held(), 2);

        a.unlock();
        assert!(!a.held());
        assert!(b.try_lock());
    }

    #[test]
    fn test_mem_lock_steal_old() {
        let timer = Arc::new(MockTimer::default());
        let manager = MemLockManager::new(timer.clone());
        let a = manager.create_named_lock("purge");
        let b = manager.create_named_lock("purge");

        assert!(a.try_lock());
        timer.advance_ms(9_999);
        assert!(!b.try_lock_steal_old(10_000));
        timer.advance_ms(1);
        assert!(b.try_lock_steal_old(10_000));

        // The previous holder's unlock must not release the stolen lock.
        a.unlock();
        assert_eq!(manager.num_held(), 1);
        b.unlock();
        assert_eq!(manager.num_held(), 0);
    }

    #[test]
    fn test_file_lock_steal_old() {
        let timer = Arc::new(MockTimer::default());
        let fs = Arc::new(MemFileSystem::new(timer.clone()));
        let manager = FileSystemLockManager::new("/locks", fs.clone(), timer.clone());
        let a = manager.create_named_lock("/var/cache/cache.purge.lock");
        let b = manager.create_named_lock("/var/cache/cache.purge.lock");

        assert!(a.try_lock());
        assert!(fs.exists(Path::new("/locks/!var!cache!cache.purge.lock")));
        assert!(!b.try_lock());
        assert!(!b.try_lock_steal_old(1_000));
        timer.advance_ms(1_000);
        assert!(b.try_lock_steal_old(1_000));

        b.unlock();
        assert!(!fs.exists(Path::new("/locks/!var!cache!cache.purge.lock")));
    }
}
