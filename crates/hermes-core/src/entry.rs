//! Captured exchanges and the shared entry builder.
//!
//! Live traffic, replays and HAR imports all go through [`EntryBuilder`], so
//! sizes, encodings and decoded bodies are always derived from the captured
//! bytes the same way.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decoder::{body_to_text, decode_body, normalize_encoding};
use crate::failure::ExchangeFailure;
use crate::headers::{get_header, HeaderMap};
use crate::target::TargetUrl;

/// Error recorded for exchanges terminated by a `close` rule.
pub const CLOSED_BY_RULE: &str = "Connection closed by rule";

/// HTTP version assumed when none is known.
pub const DEFAULT_HTTP_VERSION: &str = "HTTP/1.1";

/// One captured request/response exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyEntry {
    /// Unique id, `<millis>-<random hex>`.
    pub id: String,
    /// When the request was received.
    pub timestamp: DateTime<Utc>,
    /// Uppercase request method.
    pub method: String,
    /// Request version label, e.g. `HTTP/1.1`.
    pub request_http_version: String,
    /// Response version label.
    pub response_http_version: String,
    /// Response status; `None` when no response was received.
    pub status: Option<u16>,
    /// `http` or `https`.
    pub protocol: String,
    /// Authority with the default port elided.
    pub host: String,
    /// Path starting with `/`.
    pub path: String,
    /// Query string without the leading `?`.
    pub query: Option<String>,
    /// Request headers as sent upstream, after any override rule.
    pub request_headers: HeaderMap,
    /// Response headers as received.
    pub response_headers: HeaderMap,
    /// Raw request body as text, or a placeholder for binary payloads.
    pub request_body: String,
    /// Request body after content decoding, when it was encoded.
    pub request_decoded_body: Option<String>,
    /// Raw response body as text, or a placeholder for binary payloads.
    pub response_body: String,
    /// Response body after content decoding, when it was encoded.
    pub response_decoded_body: Option<String>,
    /// Size of the raw request body in bytes.
    pub request_body_size: usize,
    /// Size of the raw response body in bytes.
    pub response_body_size: usize,
    /// Size of the decoded request body.
    pub request_decoded_size: Option<usize>,
    /// Size of the decoded response body.
    pub response_decoded_size: Option<usize>,
    /// Normalized request `content-encoding`.
    pub request_encoding: Option<String>,
    /// Normalized response `content-encoding`.
    pub response_encoding: Option<String>,
    /// Milliseconds from request receipt to the end of the response.
    pub duration_ms: Option<u64>,
    /// Failure message; `None` for completed exchanges.
    pub error: Option<String>,

    /// Raw request bytes as captured.
    #[serde(skip)]
    pub request_raw: Bytes,
    /// Raw response bytes as captured.
    #[serde(skip)]
    pub response_raw: Bytes,
}

impl ProxyEntry {
    /// Full URL of the exchange.
    pub fn url(&self) -> String {
        let mut url = format!("{}://{}{}", self.protocol, self.host, self.path);
        if let Some(query) = &self.query {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    /// Parsed target of the exchange.
    pub fn target(&self) -> crate::Result<TargetUrl> {
        TargetUrl::parse(&self.url())
    }

    /// Returns true if the exchange produced a response.
    pub fn has_response(&self) -> bool {
        self.status.is_some()
    }
}

/// Generates an entry id of the form `<millis>-<random hex>`.
pub fn new_entry_id() -> String {
    format!(
        "{}-{:x}",
        Utc::now().timestamp_millis(),
        rand::random::<u64>()
    )
}

/// Normalizes a version label to the `HTTP/x.y` form.
pub fn normalize_http_version(version: Option<&str>) -> String {
    match version.map(str::trim) {
        None | Some("") => DEFAULT_HTTP_VERSION.to_string(),
        Some(v) if v.len() >= 5 && v[..5].eq_ignore_ascii_case("HTTP/") => v.to_string(),
        Some(v) => format!("HTTP/{}", v),
    }
}

struct DecodedSide {
    text: String,
    decoded_text: Option<String>,
    size: usize,
    decoded_size: Option<usize>,
    encoding: Option<String>,
}

fn decode_side(headers: &HeaderMap, body: &Bytes) -> DecodedSide {
    let encoding = get_header(headers, "content-encoding").and_then(normalize_encoding);
    let decoded = decode_body(body, encoding.as_deref());
    DecodedSide {
        text: body_to_text(body),
        decoded_text: decoded.as_deref().map(body_to_text),
        size: body.len(),
        decoded_size: decoded.as_ref().map(Vec::len),
        encoding,
    }
}

/// Builds a [`ProxyEntry`] from the pieces of an exchange.
#[derive(Debug, Clone)]
pub struct EntryBuilder {
    target: TargetUrl,
    method: String,
    timestamp: Option<DateTime<Utc>>,
    request_http_version: Option<String>,
    response_http_version: Option<String>,
    status: Option<u16>,
    request_headers: HeaderMap,
    response_headers: HeaderMap,
    request_body: Bytes,
    response_body: Bytes,
    duration_ms: Option<u64>,
    error: Option<String>,
}

impl EntryBuilder {
    /// Starts an entry for `method target`.
    pub fn new(target: TargetUrl, method: impl Into<String>) -> Self {
        let method = method.into();
        Self {
            target,
            method: if method.is_empty() {
                "GET".to_string()
            } else {
                method
            },
            timestamp: None,
            request_http_version: None,
            response_http_version: None,
            status: None,
            request_headers: HeaderMap::new(),
            response_headers: HeaderMap::new(),
            request_body: Bytes::new(),
            response_body: Bytes::new(),
            duration_ms: None,
            error: None,
        }
    }

    /// Sets the capture timestamp (defaults to now).
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn request_http_version(mut self, version: impl Into<String>) -> Self {
        self.request_http_version = Some(version.into());
        self
    }

    pub fn response_http_version(mut self, version: impl Into<String>) -> Self {
        self.response_http_version = Some(version.into());
        self
    }

    pub fn status(mut self, status: Option<u16>) -> Self {
        self.status = status;
        self
    }

    pub fn request_headers(mut self, headers: HeaderMap) -> Self {
        self.request_headers = headers;
        self
    }

    pub fn response_headers(mut self, headers: HeaderMap) -> Self {
        self.response_headers = headers;
        self
    }

    pub fn request_body(mut self, body: impl Into<Bytes>) -> Self {
        self.request_body = body.into();
        self
    }

    pub fn response_body(mut self, body: impl Into<Bytes>) -> Self {
        self.response_body = body.into();
        self
    }

    pub fn duration_ms(mut self, duration_ms: Option<u64>) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Records an error message without touching the status.
    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    /// Records a failed exchange: status and message follow the failure
    /// classification.
    pub fn failure(mut self, failure: &ExchangeFailure) -> Self {
        self.status = failure.status();
        self.error = Some(failure.message.clone());
        self
    }

    /// Marks the exchange as terminated by a `close` rule.
    pub fn closed_by_rule(mut self) -> Self {
        self.status = None;
        self.duration_ms = Some(0);
        self.error = Some(CLOSED_BY_RULE.to_string());
        self
    }

    /// Finishes the entry, decoding both bodies.
    pub fn build(self) -> ProxyEntry {
        let request = decode_side(&self.request_headers, &self.request_body);
        let response = decode_side(&self.response_headers, &self.response_body);

        ProxyEntry {
            id: new_entry_id(),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            method: self.method,
            request_http_version: normalize_http_version(self.request_http_version.as_deref()),
            response_http_version: normalize_http_version(self.response_http_version.as_deref()),
            status: self.status,
            protocol: self.target.scheme.as_str().to_string(),
            host: self.target.authority(),
            path: self.target.path.clone(),
            query: self.target.query.clone(),
            request_headers: self.request_headers,
            response_headers: self.response_headers,
            request_body: request.text,
            request_decoded_body: request.decoded_text,
            response_body: response.text,
            response_decoded_body: response.decoded_text,
            request_body_size: request.size,
            response_body_size: response.size,
            request_decoded_size: request.decoded_size,
            response_decoded_size: response.decoded_size,
            request_encoding: request.encoding,
            response_encoding: response.encoding,
            duration_ms: self.duration_ms,
            error: self.error,
            request_raw: self.request_body,
            response_raw: self.response_body,
        }
    }
}
