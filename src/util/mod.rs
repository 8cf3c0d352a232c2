//! Shared Utilities
//!
//! Small building blocks used throughout the cache stack: injectable time
//! and hashing, a non-cryptographic PRNG, ordered header multimaps,
//! wildcard rule groups, categorized refcounts, and the file-system and
//! named-lock seams the purge context runs on.

pub mod file_system;
pub mod hasher;
pub mod named_lock;
pub mod refcount;
pub mod simple_random;
pub mod string_multi_map;
pub mod timer;
pub mod wildcard;

pub use file_system::{FileSystem, MemFileSystem, StdFileSystem};
pub use hasher::{ContentHasher, MockHasher, Xxh3ContentHasher};
pub use named_lock::{FileSystemLockManager, MemLockManager, NamedLock, NamedLockManager};
pub use refcount::{CategorizedRefcount, RefCategory};
pub use simple_random::SimpleRandom;
pub use string_multi_map::{
    CaseInsensitive, CaseSensitive, QueryParams, StringMultiMap, StringMultiMapInsensitive,
    StringMultiMapSensitive,
};
pub use timer::{MockTimer, SystemTimer, Timer};
pub use wildcard::{Wildcard, WildcardGroup};
