//! Find results and remembered fetch failures.
//!
//! A remembered failure is stored as an ordinary cache entry whose status
//! code is one of the sentinel codes below; finding one yields
//! [`CacheStatus::RecentFailure`] carrying the decoded fetch status.

use serde::{Deserialize, Serialize};

/// Outcome class of a fetch, as remembered by the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchResponseStatus {
    NotSet,
    Ok,
    OtherError,
    /// A 200 that was not cacheable
    Uncacheable200,
    /// A non-200 that was not cacheable
    UncacheableError,
    /// The fetch was dropped under load
    Dropped,
}

impl FetchResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchResponseStatus::NotSet => "not_set",
            FetchResponseStatus::Ok => "ok",
            FetchResponseStatus::OtherError => "other_error",
            FetchResponseStatus::Uncacheable200 => "uncacheable_200",
            FetchResponseStatus::UncacheableError => "uncacheable_error",
            FetchResponseStatus::Dropped => "dropped",
        }
    }
}

/// Lookup status of a find
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheStatus {
    Found,
    NotFound,
    RecentFailure,
}

/// Result of an HTTP cache find. Only `NotFound` may carry `NotSet`, and
/// `RecentFailure` always carries a failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FindResult {
    pub status: CacheStatus,
    pub fetch_status: FetchResponseStatus,
}

impl FindResult {
    pub fn found() -> Self {
        Self {
            status: CacheStatus::Found,
            fetch_status: FetchResponseStatus::Ok,
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: CacheStatus::NotFound,
            fetch_status: FetchResponseStatus::NotSet,
        }
    }

    pub fn recent_failure(fetch_status: FetchResponseStatus) -> Self {
        match fetch_status {
            FetchResponseStatus::NotSet => Self::not_found(),
            _ => Self {
                status: CacheStatus::RecentFailure,
                fetch_status,
            },
        }
    }

    pub fn is_found(&self) -> bool {
        self.status == CacheStatus::Found
    }
}

// =============================================================================
// Sentinel status codes
// =============================================================================

pub const REMEMBER_UNCACHEABLE_200_STATUS: u32 = 10_001;
pub const REMEMBER_UNCACHEABLE_ERROR_STATUS: u32 = 10_002;
pub const REMEMBER_OTHER_ERROR_STATUS: u32 = 10_003;
pub const REMEMBER_DROPPED_STATUS: u32 = 10_004;

/// Status code stored for a remembered failure; `None` for non-failures
pub fn encode_failure_caching_status(fetch_status: FetchResponseStatus) -> Option<u32> {
    match fetch_status {
        FetchResponseStatus::Uncacheable200 => Some(REMEMBER_UNCACHEABLE_200_STATUS),
        FetchResponseStatus::UncacheableError => Some(REMEMBER_UNCACHEABLE_ERROR_STATUS),
        FetchResponseStatus::OtherError => Some(REMEMBER_OTHER_ERROR_STATUS),
        FetchResponseStatus::Dropped => Some(REMEMBER_DROPPED_STATUS),
        FetchResponseStatus::NotSet | FetchResponseStatus::Ok => None,
    }
}

pub fn decode_failure_caching_status(status_code: u32) -> Option<FetchResponseStatus> {
    match status_code {
        REMEMBER_UNCACHEABLE_200_STATUS => Some(FetchResponseStatus::Uncacheable200),
        REMEMBER_UNCACHEABLE_ERROR_STATUS => Some(FetchResponseStatus::UncacheableError),
        REMEMBER_OTHER_ERROR_STATUS => Some(FetchResponseStatus::OtherError),
        REMEMBER_DROPPED_STATUS => Some(FetchResponseStatus::Dropped),
        _ => None,
    }
}

pub fn is_failure_caching_status(status_code: u32) -> bool {
    decode_failure_caching_status(status_code).is_some()
}

/// How long each failure class is remembered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureCachingTtlSec {
    pub uncacheable_200: i64,
    pub uncacheable_error: i64,
    pub other_error: i64,
    pub dropped: i64,
}

impl Default for FailureCachingTtlSec {
    fn default() -> Self {
        Self {
            uncacheable_200: 300,
            uncacheable_error: 300,
            other_error: 300,
            dropped: 10,
        }
    }
}

impl FailureCachingTtlSec {
    /// TTL for `fetch_status`; zero for non-failures
    pub fn get(&self, fetch_status: FetchResponseStatus) -> i64 {
        match fetch_status {
            FetchResponseStatus::Uncacheable200 => self.uncacheable_200,
            FetchResponseStatus::UncacheableError => self.uncacheable_error,
            FetchResponseStatus::OtherError => self.other_error,
            FetchResponseStatus::Dropped => self.dropped,
            FetchResponseStatus::NotSet | FetchResponseStatus::Ok => 0,
        }
    }

    pub fn set(&mut self, fetch_status: FetchResponseStatus, ttl_sec: i64) {
        match fetch_status {
            FetchResponseStatus::Uncacheable200 => self.uncacheable_200 = ttl_sec,
            FetchResponseStatus::UncacheableError => self.uncacheable_error = ttl_sec,
            FetchResponseStatus::OtherError => self.other_error = ttl_sec,
            FetchResponseStatus::Dropped => self.dropped = ttl_sec,
            FetchResponseStatus::NotSet | FetchResponseStatus::Ok => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_recent_failure_never_carries_not_set() {
        assert_eq!(
            FindResult::recent_failure(FetchResponseStatus::NotSet),
            FindResult::not_found()
        );
        assert_matches!(
            FindResult::recent_failure(FetchResponseStatus::Dropped),
            FindResult {
                status: CacheStatus::RecentFailure,
                fetch_status: FetchResponseStatus::Dropped
            }
        );
    }

    #[test]
    fn test_sentinel_codes_round_trip() {
        for status in [
            FetchResponseStatus::Uncacheable200,
            FetchResponseStatus::UncacheableError,
            FetchResponseStatus::OtherError,
            FetchResponseStatus::Dropped,
        ] {
            let code = encode_failure_caching_status(status).unwrap();
            assert!(is_failure_caching_status(code));
            assert_eq!(decode_failure_caching_status(code), Some(status));
        }
        assert_eq!(encode_failure_caching_status(FetchResponseStatus::Ok), None);
        assert!(!is_failure_caching_status(200));
    }

    #[test]
    fn test_failure_ttls() {
        let mut ttls = FailureCachingTtlSec::default();
        assert_eq!(ttls.get(FetchResponseStatus::Dropped), 10);
        ttls.set(FetchResponseStatus::OtherError, 42);
        assert_eq!(ttls.get(FetchResponseStatus::OtherError), 42);
        assert_eq!(ttls.get(FetchResponseStatus::Ok), 0);

        let parsed: FailureCachingTtlSec = serde_json::from_str(r#"{"dropped": 1}"#).unwrap();
        assert_eq!(parsed.dropped, 1);
        assert_eq!(parsed.other_error, 300);
    }
}
