//! Test helpers for HTTP cache lookups.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::http::callback::HttpCacheCallback;
use crate::http::fetch_status::FindResult;
use crate::http::http_cache::HttpCacheInterface;

/// Slot filled when a find completes
pub type FindSlot = Arc<Mutex<Option<(FindResult, HttpCacheCallback)>>>;

/// Issue a find whose completion lands in the returned slot
pub fn find_into_slot<C>(cache: &C, key: &str, fragment: &str, callback: HttpCacheCallback) -> FindSlot
where
    C: HttpCacheInterface + ?Sized,
{
    let slot: FindSlot = Arc::new(Mutex::new(None));
    let sink = slot.clone();
    cache.find(
        key,
        fragment,
        callback.on_done(move |result, cb| *sink.lock() = Some((result, cb))),
    );
    slot
}

/// Find on a cache whose primitives deliver before returning.
///
/// # Panics
///
/// Panics if the find has not completed when the call returns.
pub fn find_now<C>(
    cache: &C,
    key: &str,
    fragment: &str,
    callback: HttpCacheCallback,
) -> (FindResult, HttpCacheCallback)
where
    C: HttpCacheInterface + ?Sized,
{
    let slot = find_into_slot(cache, key, fragment, callback);
    let outcome = slot.lock().take();
    match outcome {
        Some(outcome) => outcome,
        None => panic!("find of {} did not complete synchronously", key),
    }
}
