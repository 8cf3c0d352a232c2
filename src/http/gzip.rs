//! Body gzip helpers used by the HTTP cache's storage policy.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::http::headers::names::*;
use crate::http::headers::ResponseHeaders;
use crate::http::value::HttpValue;

/// Gzip `value`'s body, rewriting `headers` to describe the encoding.
/// Returns the new value with the rewritten headers.
pub fn gzip_value(level: u32, value: &HttpValue, headers: &mut ResponseHeaders) -> Result<HttpValue> {
    let body = value.contents()?;
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::new(level.min(9)));
    encoder
        .write_all(&body)
        .and_then(|_| encoder.finish())
        .map_err(|e| Error::CompressionFailed {
            algorithm: "gzip".to_string(),
            reason: e.to_string(),
        })
        .and_then(|gzipped| {
            headers.replace(CONTENT_ENCODING, "gzip");
            if !headers.has_value(VARY, ACCEPT_ENCODING) {
                headers.add(VARY, ACCEPT_ENCODING);
            }
            headers.replace(X_ORIGINAL_CONTENT_LENGTH, &body.len().to_string());
            headers.remove_all(CONTENT_LENGTH);
            HttpValue::encode(headers, &gzipped)
        })
}

/// Inflate a gzipped value; values that are not gzipped come back as-is.
pub fn ungzip_value_if_compressed(value: &HttpValue) -> Result<(HttpValue, ResponseHeaders)> {
    let mut headers = value.headers()?;
    if !headers.is_gzipped() {
        return Ok((value.clone(), headers));
    }
    let body = value.contents()?;
    let mut inflated = Vec::with_capacity(body.len() * 2);
    GzDecoder::new(&body[..])
        .read_to_end(&mut inflated)
        .map_err(|e| Error::DecompressionFailed {
            algorithm: "gzip".to_string(),
            reason: e.to_string(),
        })?;
    headers.remove(CONTENT_ENCODING, "gzip");
    headers.remove_all(X_ORIGINAL_CONTENT_LENGTH);
    headers.remove_all(CONTENT_LENGTH);
    let value = HttpValue::encode(&headers, &inflated)?;
    Ok((value, headers))
}
