//! HTTP Value
//!
//! Serialized form of a cached HTTP response: one immutable byte blob
//! holding a length-prefixed header block followed by the body. Extraction
//! parses the header block on demand and hands the body out as a zero-copy
//! slice of the shared buffer.
//!
//! # Layout
//!
//! ```text
//! 'H' | flags (u8) | header block length (u32 LE) | header block | body
//!
//! header block: status (u32) | reason len (u32) | reason
//!             | count (u32) | (name len (u32) | name | value len (u32) | value)*
//! ```
//!
//! Flag bit 0 records whether the body is stored gzip-encoded. The layout is
//! stable within a deployment only.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::http::headers::ResponseHeaders;

const MAGIC: u8 = b'H';
const FLAG_GZIP: u8 = 0x01;
const PREFIX_LEN: usize = 6;

/// Shared immutable serialized HTTP response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpValue {
    storage: Bytes,
}

impl HttpValue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize `headers` and `body` into a new value
    pub fn encode(headers: &ResponseHeaders, body: &[u8]) -> Result<Self> {
        let mut block = BytesMut::new();
        block.put_u32_le(headers.status_code());
        put_str(&mut block, headers.reason_phrase())?;
        block.put_u32_le(len_u32(headers.num_values())?);
        for (name, value) in headers.iter() {
            put_str(&mut block, name)?;
            put_str(&mut block, value)?;
        }

        let mut out = BytesMut::with_capacity(PREFIX_LEN + block.len() + body.len());
        out.put_u8(MAGIC);
        out.put_u8(if headers.is_gzipped() { FLAG_GZIP } else { 0 });
        out.put_u32_le(len_u32(block.len())?);
        out.put_slice(&block);
        out.put_slice(body);
        Ok(Self {
            storage: out.freeze(),
        })
    }

    /// Adopt bytes read from a cache, checking that they parse
    pub fn link(storage: Bytes) -> Result<Self> {
        Self::link_with_headers(storage).map(|(value, _)| value)
    }

    /// Adopt bytes read from a cache, returning the parsed headers too
    pub fn link_with_headers(storage: Bytes) -> Result<(Self, ResponseHeaders)> {
        let value = Self { storage };
        let headers = value.headers()?;
        Ok((value, headers))
    }

    /// Share the underlying buffer
    pub fn share(&self) -> Bytes {
        self.storage.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn clear(&mut self) {
        self.storage = Bytes::new();
    }

    /// Total serialized size
    pub fn size(&self) -> usize {
        self.storage.len()
    }

    /// Whether the stored body is gzip-encoded
    pub fn is_gzipped(&self) -> bool {
        self.storage.len() >= PREFIX_LEN && self.storage[1] & FLAG_GZIP != 0
    }

    pub fn headers(&self) -> Result<ResponseHeaders> {
        let mut block = self.header_block()?;
        let status = get_u32(&mut block)?;
        let reason = get_str(&mut block)?;
        let count = get_u32(&mut block)?;
        let mut headers = ResponseHeaders::with_status(status);
        headers.set_reason_phrase(reason);
        for _ in 0..count {
            let name = get_str(&mut block)?;
            let value = get_str(&mut block)?;
            headers.add(&name, &value);
        }
        if block.has_remaining() {
            return Err(Error::HttpValueParse(format!(
                "{} trailing bytes in header block",
                block.remaining()
            )));
        }
        Ok(headers)
    }

    /// The body, without copying
    pub fn contents(&self) -> Result<Bytes> {
        let start = PREFIX_LEN + self.header_block_len()?;
        Ok(self.storage.slice(start..))
    }

    pub fn contents_size(&self) -> usize {
        self.header_block_len()
            .map(|len| self.storage.len() - PREFIX_LEN - len)
            .unwrap_or(0)
    }

    fn header_block_len(&self) -> Result<usize> {
        if self.storage.len() < PREFIX_LEN {
            return Err(Error::HttpValueParse(format!(
                "value of {} bytes is too short",
                self.storage.len()
            )));
        }
        if self.storage[0] != MAGIC {
            return Err(Error::HttpValueParse(format!(
                "bad magic byte {:#04x}",
                self.storage[0]
            )));
        }
        let len = u32::from_le_bytes([
            self.storage[2],
            self.storage[3],
            self.storage[4],
            self.storage[5],
        ]) as usize;
        if PREFIX_LEN + len > self.storage.len() {
            return Err(Error::HttpValueParse(format!(
                "header block of {} bytes overruns value of {} bytes",
                len,
                self.storage.len()
            )));
        }
        Ok(len)
    }

    fn header_block(&self) -> Result<Bytes> {
        let len = self.header_block_len()?;
        Ok(self.storage.slice(PREFIX_LEN..PREFIX_LEN + len))
    }
}

/// Whether a raw cache payload is worth deflating: opaque payloads are,
/// gzip bodies are not, and HTTP values follow their content type
pub fn payload_is_compressible(payload: &Bytes) -> bool {
    let value = match HttpValue::link(payload.clone()) {
        Ok(value) => value,
        Err(_) => return true,
    };
    if value.is_gzipped() {
        return false;
    }
    value
        .headers()
        .ok()
        .and_then(|h| h.determine_content_type())
        .map_or(false, |t| t.is_compressible())
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::HttpValueParse(format!("length {} overflows", len)))
}

fn put_str(out: &mut BytesMut, s: &str) -> Result<()> {
    out.put_u32_le(len_u32(s.len())?);
    out.put_slice(s.as_bytes());
    Ok(())
}

fn get_u32(block: &mut Bytes) -> Result<u32> {
    if block.remaining() < 4 {
        return Err(Error::HttpValueParse("truncated header block".to_string()));
    }
    Ok(block.get_u32_le())
}

fn get_str(block: &mut Bytes) -> Result<String> {
    let len = get_u32(block)? as usize;
    if block.remaining() < len {
        return Err(Error::HttpValueParse(format!(
            "string of {} bytes overruns header block",
            len
        )));
    }
    let raw = block.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| Error::HttpValueParse(format!("header is not UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::headers::names::*;

    fn sample_headers(content_type: &str) -> ResponseHeaders {
        let mut h = ResponseHeaders::with_status(200);
        h.add(CONTENT_TYPE, content_type);
        h.add(CACHE_CONTROL, "max-age=300");
        h.add("name", "value");
        h
    }

    #[test]
    fn test_encode_and_extract() {
        let headers = sample_headers("text/css");
        let value = HttpValue::encode(&headers, b"body { }").unwrap();
        assert_eq!(value.contents().unwrap(), Bytes::from_static(b"body { }"));
        assert_eq!(value.contents_size(), 8);
        let parsed = value.headers().unwrap();
        assert_eq!(parsed.status_code(), 200);
        assert_eq!(parsed.reason_phrase(), "OK");
        assert_eq!(parsed.lookup1("NAME"), Some("value"));
        assert_eq!(parsed.num_values(), 3);
        assert!(!value.is_gzipped());
    }

    #[test]
    fn test_contents_share_storage() {
        let value = HttpValue::encode(&sample_headers("text/plain"), b"shared").unwrap();
        let body = value.contents().unwrap();
        let storage = value.share();
        let offset = body.as_ptr() as usize - storage.as_ptr() as usize;
        assert_eq!(offset + body.len(), storage.len());
    }

    #[test]
    fn test_link_rejects_garbage() {
        assert!(HttpValue::link(Bytes::from_static(b"")).is_err());
        assert!(HttpValue::link(Bytes::from_static(b"plain old bytes")).is_err());
        let good = HttpValue::encode(&sample_headers("text/plain"), b"x").unwrap();
        let truncated = good.share().slice(..10);
        assert!(HttpValue::link(truncated).is_err());
        assert!(HttpValue::link(good.share()).is_ok());
    }

    #[test]
    fn test_gzip_flag() {
        let mut headers = sample_headers("text/css");
        headers.add(CONTENT_ENCODING, "gzip");
        let value = HttpValue::encode(&headers, b"\x1f\x8b...").unwrap();
        assert!(value.is_gzipped());
    }

    #[test]
    fn test_payload_is_compressible() {
        assert!(payload_is_compressible(&Bytes::from_static(b"opaque")));
        let css = HttpValue::encode(&sample_headers("text/css"), b"a{}").unwrap();
        assert!(payload_is_compressible(&css.share()));
        let png = HttpValue::encode(&sample_headers("image/png"), b"\x89PNG").unwrap();
        assert!(!payload_is_compressible(&png.share()));
        let untyped = HttpValue::encode(&ResponseHeaders::with_status(200), b"?").unwrap();
        assert!(!payload_is_compressible(&untyped.share()));
    }

    #[test]
    fn test_clear() {
        let mut value = HttpValue::encode(&sample_headers("text/css"), b"a").unwrap();
        assert!(!value.is_empty());
        value.clear();
        assert!(value.is_empty());
        assert_eq!(value.contents_size(), 0);
    }
}
