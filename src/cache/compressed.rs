//! Compressed Cache Wrapper
//!
//! Transparent compress-on-put, verify-and-inflate-on-get layer over any
//! cache primitive.
//!
//! # Payload format
//!
//! ```text
//! deflate: 1F 8B | original length (u32 LE) | zlib stream | CRC-32 (u32 LE)
//! literal: 1F 00 | original length (u32 LE) | raw bytes   | CRC-32 (u32 LE)
//! ```
//!
//! The trailing CRC-32 covers the stored body, so a flipped bit anywhere in
//! a payload is reported as corruption rather than handed upward. This
//! includes the padding bits of a deflate stream, which the inflater
//! itself ignores.
//!
//! # Design
//!
//! - Deflate is chosen when the level is non-zero, the payload is
//!   text-like (judged from the HTTP value header block; opaque payloads
//!   qualify) and the result is smaller than the literal encoding.
//! - Verification happens in the candidate-validation hook, so a corrupt
//!   payload downgrades to a miss before the caller's own validation runs.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::{Compression, Crc};
use tracing::warn;

use crate::cache::interface::{deliver, CacheCallback, CacheInterface, KeyCallback, KeyState};
use crate::error::{Error, Result};
use crate::http::value::payload_is_compressible;
use crate::stats::{Statistics, Variable};

pub const COMPRESSED_SIZE: &str = "compressed_cache_compressed_size";
pub const ORIGINAL_SIZE: &str = "compressed_cache_original_size";
pub const CORRUPT_PAYLOADS: &str = "compressed_cache_corrupt_payloads";

const MAGIC: u8 = 0x1F;
const DEFLATE_MARKER: u8 = 0x8B;
const LITERAL_MARKER: u8 = 0x00;
const HEADER_LEN: usize = 6;
const CRC_LEN: usize = 4;

// =============================================================================
// Payload Codec
// =============================================================================

/// Encoding of a stored payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMode {
    Deflate,
    Literal,
}

impl PayloadMode {
    pub fn name(&self) -> &'static str {
        match self {
            PayloadMode::Deflate => "deflate",
            PayloadMode::Literal => "literal",
        }
    }
}

fn frame(marker: u8, original_len: usize, body: &[u8]) -> Result<Bytes> {
    let len = u32::try_from(original_len).map_err(|_| Error::CompressionFailed {
        algorithm: "deflate".to_string(),
        reason: format!("payload of {} bytes too large", original_len),
    })?;
    let mut out = BytesMut::with_capacity(HEADER_LEN + body.len() + CRC_LEN);
    out.put_u8(MAGIC);
    out.put_u8(marker);
    out.put_u32_le(len);
    out.put_slice(body);
    out.put_u32_le(crc32(body));
    Ok(out.freeze())
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(data);
    crc.sum()
}

fn deflate(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| Error::CompressionFailed {
            algorithm: PayloadMode::Deflate.name().to_string(),
            reason: e.to_string(),
        })
}

fn inflate(stream: &[u8], original_len: usize) -> Result<Bytes> {
    let mut decoder = ZlibDecoder::new(stream);
    let mut out = Vec::with_capacity(original_len);
    (&mut decoder)
        .take(original_len as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| Error::DecompressionFailed {
            algorithm: PayloadMode::Deflate.name().to_string(),
            reason: e.to_string(),
        })?;
    if out.len() != original_len {
        return Err(Error::corrupt(format!(
            "inflated {} bytes, header says {}",
            out.len(),
            original_len
        )));
    }
    Ok(Bytes::from(out))
}

/// Encode `data` at `level`; level 0 or an unprofitable deflate falls back
/// to the literal mode
pub fn encode_payload(data: &[u8], level: u32, compressible: bool) -> Result<(Bytes, PayloadMode)> {
    if level > 0 && compressible {
        let stream = deflate(data, level.min(9))?;
        if stream.len() < data.len() {
            return Ok((frame(DEFLATE_MARKER, data.len(), &stream)?, PayloadMode::Deflate));
        }
    }
    Ok((frame(LITERAL_MARKER, data.len(), data)?, PayloadMode::Literal))
}

/// Verify and decode a stored payload
pub fn decode_payload(payload: &Bytes) -> Result<Bytes> {
    if payload.len() < HEADER_LEN + CRC_LEN || payload[0] != MAGIC {
        return Err(Error::corrupt("missing payload magic"));
    }
    let mut word = [0u8; 4];
    word.copy_from_slice(&payload[2..HEADER_LEN]);
    let original_len = u32::from_le_bytes(word) as usize;

    let body_end = payload.len() - CRC_LEN;
    let body = payload.slice(HEADER_LEN..body_end);
    word.copy_from_slice(&payload[body_end..]);
    if crc32(&body) != u32::from_le_bytes(word) {
        return Err(Error::corrupt("payload checksum mismatch"));
    }

    match payload[1] {
        DEFLATE_MARKER => inflate(&body, original_len),
        LITERAL_MARKER if body.len() == original_len => Ok(body),
        LITERAL_MARKER => Err(Error::corrupt(format!(
            "literal payload of {} bytes, header says {}",
            body.len(),
            original_len
        ))),
        other => Err(Error::corrupt(format!("unknown payload marker {:#04x}", other))),
    }
}

// =============================================================================
// Cache Wrapper
// =============================================================================

/// Compressing wrapper around another cache
pub struct CompressedCache {
    cache: Arc<dyn CacheInterface>,
    level: AtomicU32,
    compressed_size: Arc<dyn Variable>,
    original_size: Arc<dyn Variable>,
    corrupt_payloads: Arc<dyn Variable>,
}

impl CompressedCache {
    /// Default deflate level
    pub const DEFAULT_LEVEL: u32 = 9;

    pub fn new(cache: Arc<dyn CacheInterface>, stats: &dyn Statistics) -> Self {
        Self {
            cache,
            level: AtomicU32::new(Self::DEFAULT_LEVEL),
            compressed_size: stats.get_variable(COMPRESSED_SIZE),
            original_size: stats.get_variable(ORIGINAL_SIZE),
            corrupt_payloads: stats.get_variable(CORRUPT_PAYLOADS),
        }
    }

    pub fn init_stats(stats: &dyn Statistics) -> Result<()> {
        stats.add_variable(COMPRESSED_SIZE)?;
        stats.add_variable(ORIGINAL_SIZE)?;
        stats.add_variable(CORRUPT_PAYLOADS)?;
        Ok(())
    }

    pub fn format_name(cache: &str) -> String {
        format!("Compressed({})", cache)
    }

    /// 0 stores literals; 1-9 select the deflate level
    pub fn set_compression_level(&self, level: u32) {
        self.level.store(level.min(9), Ordering::Relaxed);
    }

    pub fn compression_level(&self) -> u32 {
        self.level.load(Ordering::Relaxed)
    }

    pub fn corrupt_payloads(&self) -> i64 {
        self.corrupt_payloads.get()
    }

    pub fn compressed_size(&self) -> i64 {
        self.compressed_size.get()
    }

    pub fn original_size(&self) -> i64 {
        self.original_size.get()
    }

    fn wrap(&self, callback: Box<dyn CacheCallback>) -> Box<dyn CacheCallback> {
        Box::new(DecompressingCallback {
            inner: callback,
            decoded: None,
            corrupt_payloads: self.corrupt_payloads.clone(),
        })
    }
}

impl CacheInterface for CompressedCache {
    fn get(&self, key: &str, callback: Box<dyn CacheCallback>) {
        self.cache.get(key, self.wrap(callback));
    }

    fn multi_get(&self, request: Vec<KeyCallback>) {
        let wrapped = request
            .into_iter()
            .map(|kc| KeyCallback::new(kc.key, self.wrap(kc.callback)))
            .collect();
        self.cache.multi_get(wrapped);
    }

    fn put(&self, key: &str, value: Bytes) {
        let compressible = payload_is_compressible(&value);
        match encode_payload(&value, self.compression_level(), compressible) {
            Ok((payload, _mode)) => {
                self.original_size.add(value.len() as i64);
                self.compressed_size.add(payload.len() as i64);
                self.cache.put(key, payload);
            }
            Err(e) => warn!(key, "Failed to encode cache payload: {}", e),
        }
    }

    fn delete(&self, key: &str) {
        self.cache.delete(key);
    }

    fn name(&self) -> String {
        Self::format_name(&self.cache.name())
    }

    fn is_blocking(&self) -> bool {
        self.cache.is_blocking()
    }

    fn is_healthy(&self) -> bool {
        self.cache.is_healthy()
    }

    fn shut_down(&self) {
        self.cache.shut_down();
    }
}

struct DecompressingCallback {
    inner: Box<dyn CacheCallback>,
    decoded: Option<Bytes>,
    corrupt_payloads: Arc<dyn Variable>,
}

impl DecompressingCallback {
    fn decode(&self, key: &str, value: Option<&Bytes>) -> Option<Bytes> {
        let value = value?;
        match decode_payload(value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                self.corrupt_payloads.add(1);
                warn!(key, "Discarding corrupt cache payload: {}", e);
                None
            }
        }
    }
}

impl CacheCallback for DecompressingCallback {
    fn validate_candidate(&mut self, key: &str, state: KeyState, value: Option<&Bytes>) -> bool {
        if state != KeyState::Available {
            return self.inner.validate_candidate(key, state, None);
        }
        match self.decode(key, value) {
            Some(decoded) => {
                let accepted = self
                    .inner
                    .validate_candidate(key, KeyState::Available, Some(&decoded));
                self.decoded = Some(decoded);
                accepted
            }
            None => {
                self.inner.validate_candidate(key, KeyState::NotFound, None);
                false
            }
        }
    }

    fn done(self: Box<Self>, state: KeyState, value: Option<Bytes>) {
        let this = *self;
        if state != KeyState::Available {
            this.inner.done(state, None);
            return;
        }
        match this.decoded {
            Some(decoded) => this.inner.done(KeyState::Available, Some(decoded)),
            // Candidate was never offered for validation; verify now.
            None => match decode_payload_counted(&this.corrupt_payloads, value.as_ref()) {
                Some(decoded) => deliver(this.inner, "", KeyState::Available, Some(decoded)),
                None => this.inner.done(KeyState::NotFound, None),
            },
        }
    }
}

fn decode_payload_counted(corrupt: &Arc<dyn Variable>, value: Option<&Bytes>) -> Option<Bytes> {
    match decode_payload(value?) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            corrupt.add(1);
            warn!("Discarding corrupt cache payload: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::lru::LruCache;
    use crate::cache::testing::{get_now, RecordingCallback};
    use crate::stats::SimpleStats;
    use crate::util::timer::MockTimer;
    use proptest::prelude::*;

    fn setup() -> (Arc<LruCache>, CompressedCache, Arc<SimpleStats>) {
        let stats = Arc::new(SimpleStats::new(Arc::new(MockTimer::default())));
        CompressedCache::init_stats(stats.as_ref()).unwrap();
        let lru = Arc::new(LruCache::new(100_000));
        let cache = CompressedCache::new(lru.clone(), stats.as_ref());
        (lru, cache, stats)
    }

    fn text(n: usize) -> Bytes {
        Bytes::from("hello world ".repeat(n))
    }

    #[test]
    fn test_put_get_compresses_text() {
        let (lru, cache, _stats) = setup();
        let value = text(100);
        cache.put("k", value.clone());

        let stored = get_now(lru.as_ref(), "k").value().unwrap();
        assert_eq!(&stored[..2], &[0x1F, 0x8B]);
        assert!(stored.len() < value.len());

        let result = get_now(&cache, "k");
        assert_eq!(result.state(), Some(KeyState::Available));
        assert_eq!(result.value().unwrap(), value);
        assert!(cache.compressed_size() < cache.original_size());
    }

    #[test]
    fn test_level_zero_stores_literal() {
        let (lru, cache, _stats) = setup();
        cache.set_compression_level(0);
        cache.put("k", text(10));
        let stored = get_now(lru.as_ref(), "k").value().unwrap();
        assert_eq!(&stored[..2], &[0x1F, 0x00]);
        assert_eq!(get_now(&cache, "k").value().unwrap(), text(10));
    }

    #[test]
    fn test_corrupt_payload_is_a_miss() {
        let (lru, cache, _stats) = setup();
        cache.put("k", text(50));
        let mut stored = get_now(lru.as_ref(), "k").value().unwrap().to_vec();
        let last = stored.len() - 1;
        stored[last] ^= 0x01;
        lru.put("k", Bytes::from(stored));

        let cb = RecordingCallback::new();
        let result = cb.result();
        cache.get("k", Box::new(cb));
        assert_eq!(result.state(), Some(KeyState::NotFound));
        assert!(result.value().is_none());
        assert_eq!(cache.corrupt_payloads(), 1);
        assert_eq!(result.validate_calls(), 1);
    }

    #[test]
    fn test_uncompressed_payload_is_corrupt() {
        let (lru, cache, _stats) = setup();
        lru.put("k", Bytes::from_static(b"raw bytes"));
        assert_eq!(get_now(&cache, "k").state(), Some(KeyState::NotFound));
        assert_eq!(cache.corrupt_payloads(), 1);
    }

    #[test]
    fn test_inner_validation_sees_decoded_value() {
        let (_lru, cache, _stats) = setup();
        cache.put("k", Bytes::from_static(b"reject me"));
        let cb = RecordingCallback::new().with_invalid_value("reject me");
        let result = cb.result();
        cache.get("k", Box::new(cb));
        assert_eq!(result.state(), Some(KeyState::NotFound));
        assert_eq!(cache.corrupt_payloads(), 0);
    }

    #[test]
    fn test_name() {
        let (_lru, cache, _stats) = setup();
        assert_eq!(cache.name(), "Compressed(LRUCache)");
    }

    proptest! {
        #[test]
        fn test_round_trip_any_level(data in proptest::collection::vec(any::<u8>(), 0..512), level in 0u32..10) {
            let (payload, _) = encode_payload(&data, level, true).unwrap();
            let decoded = decode_payload(&payload).unwrap();
            prop_assert_eq!(decoded.as_ref(), data.as_slice());
        }

        #[test]
        fn test_single_bit_flip_detected(
            data in proptest::collection::vec(any::<u8>(), 1..256),
            level in 0u32..10,
            bit in any::<usize>(),
        ) {
            let (payload, _) = encode_payload(&data, level, true).unwrap();
            let mut corrupted = payload.to_vec();
            let bit = bit % (corrupted.len() * 8);
            corrupted[bit / 8] ^= 1 << (bit % 8);
            let decoded = decode_payload(&Bytes::from(corrupted));
            prop_assert!(decoded.is_err());
        }
    }
}
