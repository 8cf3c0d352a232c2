//! Configuration
//!
//! Serde-backed option structures for every layer of the cache stack and
//! the aggregate [`CacheSystemConfig`] consumed by
//! [`CacheSystem`](crate::system::CacheSystem). Every field has a default,
//! so a partial YAML or JSON document is a valid configuration.
//!
//! ```yaml
//! lru:
//!   l1_max_bytes: 10485760
//!   l2_max_bytes: 104857600
//! write_through:
//!   cache1_limit: 65536
//! http:
//!   compression_level: 6
//!   version: 2
//!   cacheable_urls:
//!     - disallow: "*.pdf"
//! purge:
//!   purge_file: /var/cache/pagecache/cache.flush
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cache::batcher::CacheBatcherConfig;
use crate::cache::purge_context::PurgeOptions;
use crate::cache::write_through::UNLIMITED;
use crate::error::{Error, Result};
use crate::http::http_cache::{HttpCacheOptions, CACHE_SIZE_UNLIMITED};

/// Default L1 byte budget
pub const DEFAULT_L1_MAX_BYTES: usize = 10 * 1024 * 1024;

/// Default prefix of the stack-level cache statistics
pub const DEFAULT_STATS_PREFIX: &str = "http_cache";

// =============================================================================
// Layer Options
// =============================================================================

/// In-memory LRU tiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LruOptions {
    /// Byte budget of the L1 LRU
    pub l1_max_bytes: usize,
    /// Byte budget of the L2 LRU; `None` runs a single tier
    pub l2_max_bytes: Option<usize>,
}

impl Default for LruOptions {
    fn default() -> Self {
        Self {
            l1_max_bytes: DEFAULT_L1_MAX_BYTES,
            l2_max_bytes: None,
        }
    }
}

/// L1/L2 composition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteThroughOptions {
    /// Largest key plus value stored in L1; -1 for unlimited
    pub cache1_limit: i64,
}

impl Default for WriteThroughOptions {
    fn default() -> Self {
        Self {
            cache1_limit: UNLIMITED,
        }
    }
}

/// Payload compression below the HTTP layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionOptions {
    pub enabled: bool,
    /// 0 stores literals; 1-9 select the deflate level
    pub level: u32,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            level: 9,
        }
    }
}

/// Lookup coalescing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherOptions {
    pub enabled: bool,
    pub max_parallel_lookups: usize,
    pub max_pending_gets: usize,
}

impl Default for BatcherOptions {
    fn default() -> Self {
        let defaults = CacheBatcherConfig::default();
        Self {
            enabled: true,
            max_parallel_lookups: defaults.max_parallel_lookups,
            max_pending_gets: defaults.max_pending_gets,
        }
    }
}

impl BatcherOptions {
    pub fn to_config(&self) -> CacheBatcherConfig {
        CacheBatcherConfig {
            max_parallel_lookups: self.max_parallel_lookups,
            max_pending_gets: self.max_pending_gets,
        }
    }
}

// =============================================================================
// Aggregate
// =============================================================================

/// Configuration of a complete cache stack
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSystemConfig {
    pub lru: LruOptions,
    pub write_through: WriteThroughOptions,
    pub compression: CompressionOptions,
    pub batcher: BatcherOptions,
    pub http: HttpCacheOptions,
    pub purge: PurgeOptions,
    /// Prefix of the stack-level hit/miss/latency statistics
    pub stats_prefix: Option<String>,
}

impl CacheSystemConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json` file, or YAML for any other extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            _ => Self::from_yaml_str(&contents),
        }
    }

    pub fn stats_prefix(&self) -> &str {
        self.stats_prefix.as_deref().unwrap_or(DEFAULT_STATS_PREFIX)
    }

    pub fn is_two_tier(&self) -> bool {
        self.lru.l2_max_bytes.is_some()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.lru.l1_max_bytes == 0 {
            return Err(Error::Config("lru.l1_max_bytes must be positive".into()));
        }
        if self.lru.l2_max_bytes == Some(0) {
            return Err(Error::Config("lru.l2_max_bytes must be positive".into()));
        }
        if self.write_through.cache1_limit < UNLIMITED {
            return Err(Error::Config(
                "write_through.cache1_limit must be -1 or non-negative".into(),
            ));
        }
        if self.compression.level > 9 {
            return Err(Error::Config("compression.level must be 0-9".into()));
        }
        if self.batcher.max_parallel_lookups == 0 {
            return Err(Error::Config(
                "batcher.max_parallel_lookups must be at least 1".into(),
            ));
        }
        if self.batcher.max_pending_gets < self.batcher.max_parallel_lookups {
            return Err(Error::Config(
                "batcher.max_pending_gets must be at least max_parallel_lookups".into(),
            ));
        }
        self.validate_http()?;
        self.validate_purge()
    }

    fn validate_http(&self) -> Result<()> {
        let http = &self.http;
        if http.compression_level > 9 {
            return Err(Error::Config("http.compression_level must be 0-9".into()));
        }
        if http.implicit_cache_ttl_ms < 0 {
            return Err(Error::Config(
                "http.implicit_cache_ttl_ms must be non-negative".into(),
            ));
        }
        if http.max_cacheable_response_content_length < CACHE_SIZE_UNLIMITED {
            return Err(Error::Config(
                "http.max_cacheable_response_content_length must be -1 or non-negative".into(),
            ));
        }
        if http.cache_levels == 0 {
            return Err(Error::Config("http.cache_levels must be at least 1".into()));
        }
        let ttls = &http.failure_caching_ttl_sec;
        if [ttls.uncacheable_200, ttls.uncacheable_error, ttls.other_error, ttls.dropped]
            .iter()
            .any(|ttl| *ttl < 0)
        {
            return Err(Error::Config(
                "http.failure_caching_ttl_sec values must be non-negative".into(),
            ));
        }
        Ok(())
    }

    fn validate_purge(&self) -> Result<()> {
        let purge = &self.purge;
        if purge.poll_interval_ms <= 0 {
            return Err(Error::Config("purge.poll_interval_ms must be positive".into()));
        }
        if purge.steal_after_ms <= 0 || purge.lock_timeout_ms <= 0 {
            return Err(Error::Config(
                "purge.steal_after_ms and purge.lock_timeout_ms must be positive".into(),
            ));
        }
        if purge.max_future_ms <= 0 {
            return Err(Error::Config("purge.max_future_ms must be positive".into()));
        }
        if purge.request_batching_delay_ms < 0 {
            return Err(Error::Config(
                "purge.request_batching_delay_ms must be non-negative".into(),
            ));
        }
        if purge.max_bytes_in_purge_set == 0 {
            return Err(Error::Config(
                "purge.max_bytes_in_purge_set must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::http_cache::UrlRule;
    use assert_matches::assert_matches;
    use std::path::PathBuf;

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheSystemConfig::default();
        config.validate().unwrap();
        assert!(!config.is_two_tier());
        assert_eq!(config.stats_prefix(), DEFAULT_STATS_PREFIX);
        assert_eq!(config.batcher.to_config(), CacheBatcherConfig::default());
        assert_eq!(config.http.implicit_cache_ttl_ms, 300_000);
        assert_eq!(config.purge.max_future_ms, 30 * 24 * 60 * 60 * 1000);
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
lru:
  l2_max_bytes: 2000000
write_through:
  cache1_limit: 183
http:
  compression_level: 6
  version: 2
  failure_caching_ttl_sec:
    dropped: 1
  cacheable_urls:
    - allow: "http://www.example.com/*"
    - disallow: "*.pdf"
purge:
  purge_file: /tmp/cache.flush
  enable_url_purge: false
"#;
        let config = CacheSystemConfig::from_yaml_str(yaml).unwrap();
        assert!(config.is_two_tier());
        assert_eq!(config.lru.l1_max_bytes, DEFAULT_L1_MAX_BYTES);
        assert_eq!(config.write_through.cache1_limit, 183);
        assert_eq!(config.http.version, Some(2));
        assert_eq!(config.http.failure_caching_ttl_sec.dropped, 1);
        assert_eq!(config.http.failure_caching_ttl_sec.other_error, 300);
        assert_eq!(
            config.http.cacheable_urls,
            vec![
                UrlRule::Allow("http://www.example.com/*".into()),
                UrlRule::Disallow("*.pdf".into()),
            ]
        );
        assert_eq!(config.purge.purge_file, Some(PathBuf::from("/tmp/cache.flush")));
        assert!(!config.purge.enable_url_purge);
    }

    #[test]
    fn test_json() {
        let config = CacheSystemConfig::from_json_str(
            r#"{"batcher": {"max_parallel_lookups": 4}, "stats_prefix": "pcache"}"#,
        )
        .unwrap();
        assert_eq!(config.batcher.max_parallel_lookups, 4);
        assert_eq!(config.batcher.max_pending_gets, 1000);
        assert_eq!(config.stats_prefix(), "pcache");

        let config = CacheSystemConfig::from_json_str(
            r#"{"http": {"cacheable_urls": [{"allow": "*"}, {"disallow": "*.pdf"}]}}"#,
        )
        .unwrap();
        assert_eq!(
            config.http.cacheable_urls,
            vec![UrlRule::Allow("*".into()), UrlRule::Disallow("*.pdf".into())]
        );
    }

    #[test]
    fn test_validation_errors() {
        let bad = [
            "lru: {l1_max_bytes: 0}",
            "write_through: {cache1_limit: -2}",
            "compression: {level: 10}",
            "batcher: {max_parallel_lookups: 0}",
            "batcher: {max_parallel_lookups: 10, max_pending_gets: 5}",
            "http: {compression_level: 12}",
            "http: {max_cacheable_response_content_length: -7}",
            "http: {cache_levels: 0}",
            "http: {failure_caching_ttl_sec: {dropped: -1}}",
            "purge: {poll_interval_ms: 0}",
            "purge: {max_future_ms: -1}",
        ];
        for yaml in bad {
            assert_matches!(
                CacheSystemConfig::from_yaml_str(yaml),
                Err(Error::Config(_)),
                "{} should be rejected",
                yaml
            );
        }
    }

    #[test]
    fn test_parse_error() {
        assert_matches!(
            CacheSystemConfig::from_yaml_str("lru: [not, a, map]"),
            Err(Error::ConfigParse(_))
        );
        assert_matches!(
            CacheSystemConfig::from_json_str("{"),
            Err(Error::Json(_))
        );
    }

    #[test]
    fn test_from_file() {
        let dir = std::env::temp_dir().join(format!("pagecache-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let yaml = dir.join("cache.yaml");
        std::fs::write(&yaml, "http: {force_caching: true}\n").unwrap();
        assert!(CacheSystemConfig::from_file(&yaml).unwrap().http.force_caching);

        let rules = dir.join("rules.yaml");
        std::fs::write(&rules, "http:\n  cacheable_urls:\n    - disallow: \"*.pdf\"\n").unwrap();
        let config = CacheSystemConfig::from_file(&rules).unwrap();
        let settings = crate::http::HttpCacheSettings::from_options(&config.http);
        assert!(!settings.is_url_cacheable("http://www.example.com/a.pdf"));
        assert!(settings.is_url_cacheable("http://www.example.com/a.css"));

        let json = dir.join("cache.json");
        std::fs::write(&json, r#"{"compression": {"enabled": false}}"#).unwrap();
        assert!(!CacheSystemConfig::from_file(&json).unwrap().compression.enabled);

        assert_matches!(
            CacheSystemConfig::from_file(dir.join("missing.yaml")),
            Err(Error::Io(_))
        );
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
