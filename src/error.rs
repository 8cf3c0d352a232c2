//! Error types for the HTTP cache subsystem
//!
//! Cache lookups never surface these to callers: the cache layers convert
//! them into misses and counter bumps. They flow through the internal
//! helpers (payload codecs, purge-file I/O, configuration loading).

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the cache subsystem
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// JSON encoding or decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stored payload failed verification
    #[error("Corrupt cache payload: {reason}")]
    CorruptPayload { reason: String },

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Serialized HTTP value could not be decoded
    #[error("Malformed HTTP value: {0}")]
    HttpValueParse(String),

    /// Purge file line was rejected
    #[error("Purge file {path} line {line}: {reason}")]
    PurgeFileParse {
        path: String,
        line: usize,
        reason: String,
    },

    /// A statistic was registered twice with different kinds
    #[error("Statistic {name} already registered as {existing}")]
    StatisticKindConflict { name: String, existing: String },

    /// The component has been shut down
    #[error("Cache has been shut down")]
    ShutDown,
}

impl Error {
    /// Shorthand for a corrupt payload error
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Error::CorruptPayload {
            reason: reason.into(),
        }
    }
}
