//! HTTP Cache
//!
//! HTTP response semantics over the cache primitives: response headers and
//! their caching rules, the serialized stored value, remembered fetch
//! failures, and the single-tier and write-through HTTP caches.
//!
//! # Data flow
//!
//! ```text
//!   put(url, fragment, headers, body)
//!     ▸ URL gate ▸ cacheability ▸ sanitize ▸ Etag ▸ serialize ▸ gzip policy
//!     ▸ CacheInterface::put
//!
//!   find(url, fragment, callback)
//!     ▸ purge poll ▸ CacheInterface::get ▸ per-level validation
//!     ▸ callback.done(FindResult)
//! ```

pub mod callback;
pub mod content_type;
pub mod fetch_status;
pub mod gzip;
pub mod headers;
pub mod http_cache;
pub mod request_context;
pub mod testing;
pub mod value;
pub mod write_through;

pub use callback::HttpCacheCallback;
pub use content_type::{ContentKind, ContentType};
pub use fetch_status::{CacheStatus, FailureCachingTtlSec, FetchResponseStatus, FindResult};
pub use headers::{RequestProperties, ResponseHeaders};
pub use http_cache::{HttpCache, HttpCacheInterface, HttpCacheOptions, HttpCacheSettings, UrlRule};
pub use request_context::{RequestContext, RequestTimingInfo};
pub use value::HttpValue;
pub use write_through::WriteThroughHttpCache;
