//! Content decoding for captured bodies.
//!
//! Reverses `Content-Encoding` (gzip, deflate, brotli) so captured bodies can
//! be displayed, and classifies bytes as text or binary. Decoding never fails
//! the capture: anything that cannot be decoded yields `None` and the raw body
//! is used as-is.

use std::io::Read;

use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};

/// Buffer size for the brotli decompressor.
const BROTLI_BUFFER_SIZE: usize = 4096;

/// A content coding the decoder understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    /// `gzip` or `x-gzip`.
    Gzip,
    /// `deflate` (zlib-wrapped, raw deflate tolerated).
    Deflate,
    /// `br`.
    Brotli,
}

impl ContentEncoding {
    /// Parses a `Content-Encoding` header value.
    ///
    /// Only the first listed coding is considered, trimmed and lowercased.
    pub fn from_header(value: &str) -> Option<Self> {
        match normalize_encoding(value)?.as_str() {
            "gzip" | "x-gzip" => Some(Self::Gzip),
            "deflate" => Some(Self::Deflate),
            "br" => Some(Self::Brotli),
            _ => None,
        }
    }
}

/// Returns the first coding of a `Content-Encoding` value, lowercased.
pub fn normalize_encoding(value: &str) -> Option<String> {
    let first = value.split(',').next()?.trim().to_ascii_lowercase();
    if first.is_empty() {
        None
    } else {
        Some(first)
    }
}

/// Decodes `body` according to `content_encoding`.
///
/// Returns `None` for an empty body, an absent or unsupported coding, or a
/// body that fails to decompress.
pub fn decode_body(body: &[u8], content_encoding: Option<&str>) -> Option<Vec<u8>> {
    if body.is_empty() {
        return None;
    }
    let encoding = ContentEncoding::from_header(content_encoding?)?;

    let decoded = match encoding {
        ContentEncoding::Gzip => read_all(MultiGzDecoder::new(body)),
        ContentEncoding::Deflate => {
            read_all(ZlibDecoder::new(body)).or_else(|| read_all(DeflateDecoder::new(body)))
        }
        ContentEncoding::Brotli => {
            read_all(brotli::Decompressor::new(body, BROTLI_BUFFER_SIZE))
        }
    };

    if decoded.is_none() {
        tracing::debug!(
            "Failed to decode {} byte body as {:?}",
            body.len(),
            encoding
        );
    }
    decoded
}

fn read_all(mut reader: impl Read) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out).ok()?;
    Some(out)
}

/// Returns true if the bytes are displayable as UTF-8 text.
pub fn is_text(bytes: &[u8]) -> bool {
    std::str::from_utf8(bytes).is_ok()
}

/// Placeholder shown instead of a binary body.
pub fn non_text_placeholder(len: usize) -> String {
    format!("<non-text payload: {} bytes>", len)
}

/// Converts body bytes to display text.
pub fn body_to_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => non_text_placeholder(bytes.len()),
    }
}
