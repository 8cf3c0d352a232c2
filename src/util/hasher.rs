//! Content hashing for synthesized Etags.

use xxhash_rust::xxh3::xxh3_64;

/// Hashes response bodies into short printable strings
pub trait ContentHasher: Send + Sync {
    fn hash(&self, content: &[u8]) -> String;
}

/// XXH3-64 with seed 0, rendered as 16 hex digits. The digest is fixed by
/// the XXH3 format, so Etags survive rebuilds of processes sharing a cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct Xxh3ContentHasher;

impl Xxh3ContentHasher {
    pub fn new() -> Self {
        Xxh3ContentHasher
    }
}

impl ContentHasher for Xxh3ContentHasher {
    fn hash(&self, content: &[u8]) -> String {
        format!("{:016x}", xxh3_64(content))
    }
}

/// Returns the same hash for every input
#[derive(Debug, Clone)]
pub struct MockHasher {
    value: String,
}

impl MockHasher {
    pub fn new() -> Self {
        Self::with_value("0")
    }

    pub fn with_value(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl Default for MockHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentHasher for MockHasher {
    fn hash(&self, _content: &[u8]) -> String {
        self.value.clone()
    }
}
