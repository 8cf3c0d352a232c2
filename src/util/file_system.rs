//! File-system seam used by the purge context and statistics logger.
//!
//! # Design
//!
//! - [`StdFileSystem`] writes atomically through a uniquely named temp file
//!   followed by a rename, so readers never observe a torn purge file.
//! - [`MemFileSystem`] keeps files in memory, stamps mtimes from an injected
//!   [`Timer`], and exposes a write hook so tests can play a competing
//!   writer between our write and our verify.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::util::timer::Timer;

/// Minimal file operations the cache needs
pub trait FileSystem: Send + Sync {
    /// Whole-file read; `Ok(None)` when the file does not exist
    fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>>;

    /// Replace the file contents atomically with respect to readers
    fn write_file_atomic(&self, path: &Path, contents: &[u8]) -> Result<()>;

    /// Append to the file, creating it if needed
    fn append_file(&self, path: &Path, contents: &[u8]) -> Result<()>;

    /// Modification time in ms; `Ok(None)` when the file does not exist
    fn mtime_ms(&self, path: &Path) -> Result<Option<i64>>;

    /// Create the file only if it does not already exist; false if it did
    fn try_create_exclusive(&self, path: &Path, contents: &[u8]) -> Result<bool>;

    /// Remove the file; missing files are not an error
    fn remove_file(&self, path: &Path) -> Result<()>;
}

// =============================================================================
// Std File System
// =============================================================================

/// File system backed by `std::fs`
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFileSystem;

impl StdFileSystem {
    pub fn new() -> Self {
        StdFileSystem
    }

    fn temp_path_for(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".temp{}", uuid::Uuid::new_v4().simple()));
        path.with_file_name(name)
    }
}

impl FileSystem for StdFileSystem {
    fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_file_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let temp = Self::temp_path_for(path);
        let result = fs::write(&temp, contents).and_then(|_| fs::rename(&temp, path));
        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        result.map_err(Error::from)
    }

    fn append_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(contents)?;
        Ok(())
    }

    fn mtime_ms(&self, path: &Path) -> Result<Option<i64>> {
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let modified: chrono::DateTime<chrono::Utc> = metadata.modified()?.into();
        Ok(Some(modified.timestamp_millis()))
    }

    fn try_create_exclusive(&self, path: &Path, contents: &[u8]) -> Result<bool> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(contents)?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// In-Memory File System
// =============================================================================

#[derive(Debug, Clone)]
struct MemFile {
    contents: Vec<u8>,
    mtime_ms: i64,
}

type WriteHook = Arc<dyn Fn(&MemFileSystem, &Path) + Send + Sync>;

/// In-memory file system for tests
pub struct MemFileSystem {
    files: Mutex<HashMap<PathBuf, MemFile>>,
    timer: Arc<dyn Timer>,
    write_hook: Mutex<Option<WriteHook>>,
    fail_writes: Mutex<bool>,
}

impl MemFileSystem {
    pub fn new(timer: Arc<dyn Timer>) -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            timer,
            write_hook: Mutex::new(None),
            fail_writes: Mutex::new(false),
        }
    }

    /// Run `hook` after every atomic write, outside the internal lock
    pub fn set_write_hook<F>(&self, hook: F)
    where
        F: Fn(&MemFileSystem, &Path) + Send + Sync + 'static,
    {
        *self.write_hook.lock() = Some(Arc::new(hook));
    }

    pub fn clear_write_hook(&self) {
        *self.write_hook.lock() = None;
    }

    /// Make every subsequent atomic write fail with an I/O error
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }

    /// Write without triggering the hook, as another process would
    pub fn write_raw(&self, path: &Path, contents: &[u8]) {
        let now = self.timer.now_ms();
        self.files.lock().insert(
            path.to_path_buf(),
            MemFile {
                contents: contents.to_vec(),
                mtime_ms: now,
            },
        );
    }

    pub fn set_mtime_ms(&self, path: &Path, mtime_ms: i64) {
        if let Some(file) = self.files.lock().get_mut(path) {
            file.mtime_ms = mtime_ms;
        }
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.files.lock().contains_key(path)
    }

    pub fn num_files(&self) -> usize {
        self.files.lock().len()
    }
}

impl FileSystem for MemFileSystem {
    fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        Ok(self.files.lock().get(path).map(|f| f.contents.clone()))
    }

    fn write_file_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if *self.fail_writes.lock() {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::PermissionDenied,
                format!("write to {} refused", path.display()),
            )));
        }
        self.write_raw(path, contents);
        let hook = self.write_hook.lock().clone();
        if let Some(hook) = hook {
            hook(self, path);
        }
        Ok(())
    }

    fn append_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let now = self.timer.now_ms();
        let mut files = self.files.lock();
        let file = files.entry(path.to_path_buf()).or_insert(MemFile {
            contents: Vec::new(),
            mtime_ms: now,
        });
        file.contents.extend_from_slice(contents);
        file.mtime_ms = now;
        Ok(())
    }

    fn mtime_ms(&self, path: &Path) -> Result<Option<i64>> {
        Ok(self.files.lock().get(path).map(|f| f.mtime_ms))
    }

    fn try_create_exclusive(&self, path: &Path, contents: &[u8]) -> Result<bool> {
        let now = self.timer.now_ms();
        let mut files = self.files.lock();
        if files.contains_key(path) {
            return Ok(false);
        }
        files.insert(
            path.to_path_buf(),
            MemFile {
                contents: contents.to_vec(),
                mtime_ms: now,
            },
        );
        Ok(true)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        self.files.lock().remove(path);
        Ok(())
    }
}
