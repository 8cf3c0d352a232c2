//! Response Headers
//!
//! Case-insensitive, insertion-ordered response header multimap with the
//! caching fields (date, TTL, expiry, cacheability) derived from it. The
//! derived fields are recomputed after every mutation, so readers never see
//! stale caching state.
//!
//! # Caching rules
//!
//! - `no-store`, `no-cache` and `Pragma: no-cache` make a response
//!   uncacheable; `private` keeps it out of shared caches.
//! - TTL comes from `max-age`, then `Expires - Date`. Without either,
//!   default-cacheable statuses on non-HTML responses get the implicit TTL.
//! - A response without a parseable `Date` is never cacheable.
//! - Forced caching (override TTL) only applies to 200 responses.

use chrono::{DateTime, TimeZone, Utc};

use crate::http::content_type::{mime_type_to_content_type, ContentType};
use crate::util::string_multi_map::StringMultiMapInsensitive;

/// Header names the cache reads or writes
pub mod names {
    pub const ACCEPT_ENCODING: &str = "Accept-Encoding";
    pub const AUTHORIZATION: &str = "Authorization";
    pub const CACHE_CONTROL: &str = "Cache-Control";
    pub const CONNECTION: &str = "Connection";
    pub const CONTENT_ENCODING: &str = "Content-Encoding";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const COOKIE: &str = "Cookie";
    pub const COOKIE2: &str = "Cookie2";
    pub const DATE: &str = "Date";
    pub const ETAG: &str = "Etag";
    pub const EXPIRES: &str = "Expires";
    pub const KEEP_ALIVE: &str = "Keep-Alive";
    pub const LAST_MODIFIED: &str = "Last-Modified";
    pub const PRAGMA: &str = "Pragma";
    pub const PROXY_CONNECTION: &str = "Proxy-Connection";
    pub const SET_COOKIE: &str = "Set-Cookie";
    pub const SET_COOKIE2: &str = "Set-Cookie2";
    pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
    pub const VARY: &str = "Vary";
    pub const X_ORIGINAL_CONTENT_LENGTH: &str = "X-Original-Content-Length";
}

use names::*;

/// Headers that must never be stored
pub const UNSANITARY_HEADERS: &[&str] = &[
    SET_COOKIE,
    SET_COOKIE2,
    CONNECTION,
    TRANSFER_ENCODING,
    KEEP_ALIVE,
    PROXY_CONNECTION,
];

/// Implicit TTL for default-cacheable responses without explicit caching
pub const DEFAULT_IMPLICIT_CACHE_TTL_MS: i64 = 5 * 60 * 1000;

pub const HTTP_OK: u32 = 200;

const DEFAULT_CACHEABLE_STATUSES: &[u32] = &[200, 203, 206, 300, 301, 410];

const DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Parse an HTTP date (RFC 1123 form) into ms since the epoch
pub fn parse_http_date_ms(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|t| t.timestamp_millis())
}

/// Format ms since the epoch as an HTTP date
pub fn format_http_date(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.format(DATE_FORMAT).to_string())
        .unwrap_or_default()
}

/// The request attributes that affect whether a response may be shared
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestProperties {
    pub has_cookie: bool,
    pub has_cookie2: bool,
    pub has_authorization: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct CachingFields {
    date_ms: Option<i64>,
    cache_ttl_ms: i64,
    expiration_ms: i64,
    cacheable: bool,
    proxy_cacheable: bool,
    force_cached: bool,
}

/// HTTP response headers with derived caching state
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHeaders {
    status_code: u32,
    reason_phrase: String,
    headers: StringMultiMapInsensitive,
    implicit_cache_ttl_ms: i64,
    force_cache_ttl_ms: i64,
    caching: CachingFields,
}

impl Default for ResponseHeaders {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseHeaders {
    pub fn new() -> Self {
        Self {
            status_code: 0,
            reason_phrase: String::new(),
            headers: StringMultiMapInsensitive::new(),
            implicit_cache_ttl_ms: DEFAULT_IMPLICIT_CACHE_TTL_MS,
            force_cache_ttl_ms: 0,
            caching: CachingFields::default(),
        }
    }

    pub fn with_status(status_code: u32) -> Self {
        let mut headers = Self::new();
        headers.set_status_code(status_code);
        headers
    }

    // =========================================================================
    // Status line
    // =========================================================================

    pub fn status_code(&self) -> u32 {
        self.status_code
    }

    pub fn set_status_code(&mut self, code: u32) {
        self.status_code = code;
        if self.reason_phrase.is_empty() {
            self.reason_phrase = default_reason_phrase(code).to_string();
        }
        self.compute_caching();
    }

    pub fn reason_phrase(&self) -> &str {
        &self.reason_phrase
    }

    pub fn set_reason_phrase(&mut self, phrase: impl Into<String>) {
        self.reason_phrase = phrase.into();
    }

    // =========================================================================
    // Multimap access
    // =========================================================================

    pub fn add(&mut self, name: &str, value: &str) {
        self.headers.add(name, Some(value));
        self.compute_caching();
    }

    /// Replace every value of `name` with `value`
    pub fn replace(&mut self, name: &str, value: &str) {
        self.headers.remove_all(name);
        self.add(name, value);
    }

    pub fn lookup(&self, name: &str) -> Vec<&str> {
        self.headers
            .lookup(name)
            .into_iter()
            .map(|v| v.unwrap_or(""))
            .collect()
    }

    /// The single value of `name`; `None` when absent or repeated
    pub fn lookup1(&self, name: &str) -> Option<&str> {
        self.headers.lookup1(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.headers.has(name)
    }

    /// Whether any comma-separated value of `name` equals `token`
    pub fn has_value(&self, name: &str, token: &str) -> bool {
        self.tokens(name).iter().any(|t| t.eq_ignore_ascii_case(token))
    }

    pub fn remove_all(&mut self, name: &str) -> bool {
        let removed = self.headers.remove_all(name);
        if removed {
            self.compute_caching();
        }
        removed
    }

    pub fn remove(&mut self, name: &str, value: &str) -> bool {
        let removed = self.headers.remove(name, value);
        if removed {
            self.compute_caching();
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n, v.unwrap_or("")))
    }

    pub fn num_values(&self) -> usize {
        self.headers.num_values()
    }

    /// Forget everything, including the status line
    pub fn clear(&mut self) {
        let implicit = self.implicit_cache_ttl_ms;
        *self = Self::new();
        self.implicit_cache_ttl_ms = implicit;
    }

    fn tokens(&self, name: &str) -> Vec<String> {
        self.headers
            .lookup(name)
            .into_iter()
            .flatten()
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }

    // =========================================================================
    // Content
    // =========================================================================

    pub fn determine_content_type(&self) -> Option<&'static ContentType> {
        self.lookup1(CONTENT_TYPE).and_then(mime_type_to_content_type)
    }

    pub fn is_html_like(&self) -> bool {
        self.determine_content_type()
            .map_or(false, ContentType::is_html_like)
    }

    pub fn is_gzipped(&self) -> bool {
        self.has_value(CONTENT_ENCODING, "gzip")
    }

    pub fn find_content_length(&self) -> Option<i64> {
        self.lookup1(CONTENT_LENGTH)?.trim().parse().ok()
    }

    /// Strip headers that must not be stored; true if anything was removed
    pub fn sanitize(&mut self) -> bool {
        let removed = self.headers.remove_all_of(UNSANITARY_HEADERS);
        if removed {
            self.compute_caching();
        }
        removed
    }

    // =========================================================================
    // Caching
    // =========================================================================

    pub fn date_ms(&self) -> Option<i64> {
        self.caching.date_ms
    }

    pub fn set_date_ms(&mut self, date_ms: i64) {
        self.replace(DATE, &format_http_date(date_ms));
    }

    /// Set `Date`, `Expires` and `Cache-Control: max-age` for a TTL
    pub fn set_date_and_caching(&mut self, date_ms: i64, ttl_ms: i64) {
        self.headers.remove_all_of(&[DATE, EXPIRES, CACHE_CONTROL]);
        self.headers.add(DATE, Some(&format_http_date(date_ms)));
        self.headers
            .add(EXPIRES, Some(&format_http_date(date_ms + ttl_ms)));
        self.headers
            .add(CACHE_CONTROL, Some(&format!("max-age={}", ttl_ms / 1000)));
        self.compute_caching();
    }

    pub fn implicit_cache_ttl_ms(&self) -> i64 {
        self.implicit_cache_ttl_ms
    }

    pub fn set_implicit_cache_ttl_ms(&mut self, ttl_ms: i64) {
        self.implicit_cache_ttl_ms = ttl_ms;
        self.compute_caching();
    }

    pub fn is_cacheable(&self) -> bool {
        self.caching.cacheable
    }

    pub fn cache_ttl_ms(&self) -> i64 {
        self.caching.cache_ttl_ms
    }

    pub fn cache_expiration_time_ms(&self) -> i64 {
        self.caching.expiration_ms
    }

    pub fn is_force_cached(&self) -> bool {
        self.caching.force_cached
    }

    /// Whether a shared cache may store this response for `request`.
    ///
    /// HTML always honors `Vary`; other content only when
    /// `respect_vary_on_resources` is set. `Accept-Encoding` never blocks
    /// caching and `Cookie` only blocks it for requests carrying cookies.
    pub fn is_proxy_cacheable(
        &self,
        request: RequestProperties,
        respect_vary_on_resources: bool,
    ) -> bool {
        if !self.caching.proxy_cacheable {
            return false;
        }
        if request.has_authorization && !self.has_value(CACHE_CONTROL, "public") {
            return false;
        }
        let respect_vary = respect_vary_on_resources || self.is_html_like();
        for field in self.tokens(VARY) {
            let allowed = if field.eq_ignore_ascii_case(ACCEPT_ENCODING) {
                true
            } else if field.eq_ignore_ascii_case(COOKIE) {
                !request.has_cookie
            } else if field.eq_ignore_ascii_case(COOKIE2) {
                !request.has_cookie2
            } else if field == "*" {
                false
            } else {
                !respect_vary
            };
            if !allowed {
                return false;
            }
        }
        true
    }

    /// Extend a 200 response's lifetime to at least `ttl_ms`, overriding
    /// its own caching directives
    pub fn force_caching(&mut self, ttl_ms: i64) {
        if ttl_ms <= 0 || self.status_code != HTTP_OK {
            return;
        }
        self.force_cache_ttl_ms = ttl_ms;
        self.compute_caching();
    }

    /// Rewrite caching headers to describe a forced TTL; true if changed
    pub fn update_cache_headers_if_force_cached(&mut self) -> bool {
        if !self.caching.force_cached {
            return false;
        }
        let ttl_ms = self.caching.cache_ttl_ms;
        let date_ms = self.caching.date_ms.unwrap_or(0);
        self.headers.remove_all_of(&[CACHE_CONTROL, EXPIRES, PRAGMA]);
        self.headers
            .add(CACHE_CONTROL, Some(&format!("max-age={}", ttl_ms / 1000)));
        self.headers
            .add(EXPIRES, Some(&format_http_date(date_ms + ttl_ms)));
        self.force_cache_ttl_ms = 0;
        self.compute_caching();
        true
    }

    fn compute_caching(&mut self) {
        let date_ms = self.lookup1(DATE).and_then(parse_http_date_ms);
        let directives = self.tokens(CACHE_CONTROL);
        let has = |d: &str| directives.iter().any(|t| t.eq_ignore_ascii_case(d));
        let uncacheable = has("no-store") || has("no-cache") || self.has_value(PRAGMA, "no-cache");
        let private = has("private");

        let max_age_ms = directives.iter().find_map(|t| {
            let (name, value) = t.split_once('=')?;
            if !name.trim().eq_ignore_ascii_case("max-age") {
                return None;
            }
            value.trim().trim_matches('"').parse::<i64>().ok()
        });
        let explicit_ttl_ms = match (max_age_ms, self.lookup1(EXPIRES)) {
            (Some(seconds), _) => Some(seconds.saturating_mul(1000).max(0)),
            // An unparseable Expires means "already expired".
            (None, Some(expires)) => Some(
                parse_http_date_ms(expires)
                    .zip(date_ms)
                    .map_or(0, |(e, d)| (e - d).max(0)),
            ),
            (None, None) => None,
        };

        let mut fields = CachingFields {
            date_ms,
            ..CachingFields::default()
        };
        if let Some(date) = date_ms {
            let ttl_ms = match explicit_ttl_ms {
                _ if uncacheable => 0,
                Some(ttl) => ttl,
                None if DEFAULT_CACHEABLE_STATUSES.contains(&self.status_code)
                    && !self.is_html_like() =>
                {
                    self.implicit_cache_ttl_ms
                }
                None => 0,
            };
            fields.cacheable = ttl_ms > 0;
            fields.proxy_cacheable = fields.cacheable && !private;
            fields.cache_ttl_ms = ttl_ms;

            if self.force_cache_ttl_ms > 0
                && self.status_code == HTTP_OK
                && (!fields.proxy_cacheable || self.force_cache_ttl_ms > ttl_ms)
            {
                fields.cacheable = true;
                fields.proxy_cacheable = true;
                fields.force_cached = true;
                fields.cache_ttl_ms = self.force_cache_ttl_ms;
            }
            fields.expiration_ms = date + fields.cache_ttl_ms;
        }
        self.caching = fields;
    }
}

fn default_reason_phrase(code: u32) -> &'static str {
    match code {
        200 => "OK",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        410 => "Gone",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "",
    }
}
