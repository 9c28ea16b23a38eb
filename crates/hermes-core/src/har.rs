//! HAR 1.2 import and export.
//!
//! Export keeps the captured bytes: UTF-8 bodies are written as text, anything
//! else as base64, marked with `encoding: "base64"` on response content and
//! `_encoding: "base64"` on request post data. Import rebuilds entries
//! through [`EntryBuilder`] so decoded bodies and sizes are recomputed from
//! the archived bytes.

use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::entry::{EntryBuilder, ProxyEntry};
use crate::error::{CoreError, Result};
use crate::headers::{append_header, get_header, HeaderMap};
use crate::target::TargetUrl;

/// HAR format version written on export.
pub const HAR_VERSION: &str = "1.2";

/// Creator name written on export.
pub const HAR_CREATOR: &str = "Hermes Proxy";

/// HAR root object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Har {
    pub log: HarLog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarLog {
    pub version: String,
    pub creator: HarCreator,
    pub entries: Vec<HarEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarCreator {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
    #[serde(default)]
    pub started_date_time: Option<String>,
    #[serde(default)]
    pub time: Option<f64>,
    pub request: HarRequest,
    #[serde(default)]
    pub response: HarResponse,
    #[serde(default)]
    pub cache: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub timings: HarTimings,
    /// Capture error, when the exchange failed.
    #[serde(default, rename = "_error", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarRequest {
    #[serde(default)]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub http_version: String,
    #[serde(default)]
    pub cookies: Vec<serde_json::Value>,
    #[serde(default)]
    pub headers: Vec<HarHeader>,
    #[serde(default)]
    pub query_string: Vec<HarHeader>,
    #[serde(default = "unknown_size")]
    pub headers_size: i64,
    #[serde(default)]
    pub body_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_data: Option<HarPostData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarResponse {
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub http_version: String,
    #[serde(default)]
    pub cookies: Vec<serde_json::Value>,
    #[serde(default)]
    pub headers: Vec<HarHeader>,
    #[serde(default)]
    pub content: HarContent,
    #[serde(default, rename = "redirectURL")]
    pub redirect_url: String,
    #[serde(default = "unknown_size")]
    pub headers_size: i64,
    #[serde(default)]
    pub body_size: i64,
}

/// Name/value pair used for headers and query parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarHeader {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarPostData {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub text: String,
    /// `base64` when `text` holds a non-UTF-8 body.
    #[serde(default, rename = "_encoding", skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarContent {
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarTimings {
    #[serde(default)]
    pub send: f64,
    #[serde(default)]
    pub wait: f64,
    #[serde(default)]
    pub receive: f64,
}

fn unknown_size() -> i64 {
    -1
}

/// Result of a HAR import.
#[derive(Debug, Clone, Default)]
pub struct HarImport {
    /// Entries in archive order.
    pub entries: Vec<ProxyEntry>,
    /// Archive entries that could not be converted.
    pub skipped: usize,
}

fn header_list(headers: &HeaderMap) -> Vec<HarHeader> {
    headers
        .iter()
        .map(|(name, value)| HarHeader {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}

fn header_map(list: &[HarHeader]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for header in list {
        append_header(&mut headers, &header.name, &header.value);
    }
    headers
}

fn query_list(query: Option<&str>) -> Vec<HarHeader> {
    query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            HarHeader {
                name: name.to_string(),
                value: value.to_string(),
            }
        })
        .collect()
}

/// Body as HAR text plus the encoding marker needed to restore it.
fn body_text(raw: &[u8]) -> (String, Option<String>) {
    match std::str::from_utf8(raw) {
        Ok(text) => (text.to_string(), None),
        Err(_) => (BASE64.encode(raw), Some("base64".to_string())),
    }
}

fn body_bytes(text: &str, encoding: Option<&str>) -> Result<Vec<u8>> {
    if encoding == Some("base64") {
        BASE64
            .decode(text.trim())
            .map_err(|e| CoreError::Har(format!("invalid base64 body: {}", e)))
    } else {
        Ok(text.as_bytes().to_vec())
    }
}

fn content_type(headers: &HeaderMap) -> String {
    get_header(headers, "content-type")
        .unwrap_or_default()
        .to_string()
}

/// Converts one entry to a HAR entry.
pub fn to_har_entry(entry: &ProxyEntry) -> HarEntry {
    let time = entry.duration_ms.unwrap_or(0) as f64;

    let post_data = (!entry.request_raw.is_empty()).then(|| {
        let (text, encoding) = body_text(&entry.request_raw);
        HarPostData {
            mime_type: content_type(&entry.request_headers),
            text,
            encoding,
        }
    });

    let (text, encoding) = body_text(&entry.response_raw);
    let content = HarContent {
        size: entry.response_raw.len() as i64,
        mime_type: content_type(&entry.response_headers),
        text,
        encoding,
    };

    HarEntry {
        started_date_time: Some(entry.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
        time: Some(time),
        request: HarRequest {
            method: entry.method.clone(),
            url: entry.url(),
            http_version: entry.request_http_version.clone(),
            cookies: Vec::new(),
            headers: header_list(&entry.request_headers),
            query_string: query_list(entry.query.as_deref()),
            headers_size: -1,
            body_size: entry.request_raw.len() as i64,
            post_data,
        },
        response: HarResponse {
            status: entry.status.unwrap_or(0),
            status_text: String::new(),
            http_version: entry.response_http_version.clone(),
            cookies: Vec::new(),
            headers: header_list(&entry.response_headers),
            content,
            redirect_url: get_header(&entry.response_headers, "location")
                .unwrap_or_default()
                .to_string(),
            headers_size: -1,
            body_size: entry.response_raw.len() as i64,
        },
        cache: serde_json::Map::new(),
        timings: HarTimings {
            send: 0.0,
            wait: time,
            receive: 0.0,
        },
        error: entry.error.clone(),
    }
}

/// Builds a HAR document from entries, in the order given.
pub fn to_har<'a>(entries: impl IntoIterator<Item = &'a ProxyEntry>) -> Har {
    Har {
        log: HarLog {
            version: HAR_VERSION.to_string(),
            creator: HarCreator {
                name: HAR_CREATOR.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            entries: entries.into_iter().map(to_har_entry).collect(),
        },
    }
}

/// Converts one HAR entry back to a captured entry.
pub fn from_har_entry(har: &HarEntry) -> Result<ProxyEntry> {
    let target = TargetUrl::parse(&har.request.url)?;
    let request_headers = header_map(&har.request.headers);
    let response_headers = header_map(&har.response.headers);

    let request_body = match &har.request.post_data {
        Some(post) => body_bytes(&post.text, post.encoding.as_deref())?,
        None => Vec::new(),
    };
    let content = &har.response.content;
    let response_body = body_bytes(&content.text, content.encoding.as_deref())?;

    let timestamp = har
        .started_date_time
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let duration_ms = har
        .time
        .filter(|t| t.is_finite() && *t >= 0.0)
        .map(|t| t.round() as u64);

    let mut builder = EntryBuilder::new(target, har.request.method.clone())
        .timestamp(timestamp)
        .status((har.response.status != 0).then_some(har.response.status))
        .request_headers(request_headers)
        .response_headers(response_headers)
        .request_body(request_body)
        .response_body(response_body)
        .duration_ms(duration_ms);
    if !har.request.http_version.is_empty() {
        builder = builder.request_http_version(har.request.http_version.clone());
    }
    if !har.response.http_version.is_empty() {
        builder = builder.response_http_version(har.response.http_version.clone());
    }
    if let Some(error) = &har.error {
        builder = builder.error(error.clone());
    }
    Ok(builder.build())
}

/// Parses a HAR document, skipping malformed entries.
///
/// Fails when the document has no `log.entries` array or it is empty.
pub fn from_har_json(json: &str) -> Result<HarImport> {
    let document: serde_json::Value = serde_json::from_str(json)?;
    let entries = document
        .get("log")
        .and_then(|log| log.get("entries"))
        .and_then(|entries| entries.as_array())
        .ok_or_else(|| CoreError::Har("missing log.entries array".to_string()))?;
    if entries.is_empty() {
        return Err(CoreError::Har("HAR contains no entries".to_string()));
    }

    let mut import = HarImport::default();
    for (index, value) in entries.iter().enumerate() {
        let converted = serde_json::from_value::<HarEntry>(value.clone())
            .map_err(CoreError::from)
            .and_then(|har| from_har_entry(&har));
        match converted {
            Ok(entry) => import.entries.push(entry),
            Err(e) => {
                tracing::warn!("Skipping HAR entry {}: {}", index, e);
                import.skipped += 1;
            }
        }
    }
    Ok(import)
}

/// Serializes a HAR document as pretty-printed JSON.
pub fn to_har_json(har: &Har) -> Result<String> {
    Ok(serde_json::to_string_pretty(har)?)
}

/// Writes a HAR document to a file.
pub fn write_har(path: &Path, har: &Har) -> Result<()> {
    fs::write(path, to_har_json(har)?)?;
    tracing::info!("Wrote {} HAR entries to {:?}", har.log.entries.len(), path);
    Ok(())
}

/// Reads and imports a HAR file.
pub fn read_har(path: &Path) -> Result<HarImport> {
    let json = fs::read_to_string(path)?;
    from_har_json(&json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::headers_from_pairs;

    fn items_entry() -> ProxyEntry {
        let target = TargetUrl::parse("https://api.example.com/v1/items").unwrap();
        EntryBuilder::new(target, "GET")
            .status(Some(200))
            .request_headers(headers_from_pairs([("accept", "application/json")]))
            .response_headers(headers_from_pairs([("content-type", "application/json")]))
            .response_body(r#"{"items":[]}"#)
            .duration_ms(Some(42))
            .build()
    }

    #[test]
    fn har_round_trip() {
        let original = items_entry();
        let json = to_har_json(&to_har([&original])).unwrap();
        let import = from_har_json(&json).unwrap();

        assert_eq!(import.skipped, 0);
        let entry = &import.entries[0];
        assert_ne!(entry.id, original.id);
        assert_eq!(entry.method, "GET");
        assert_eq!(entry.status, Some(200));
        assert_eq!(entry.url(), "https://api.example.com/v1/items");
        assert_eq!(entry.response_body, r#"{"items":[]}"#);
        assert_eq!(entry.response_headers, original.response_headers);
        assert_eq!(entry.request_headers, original.request_headers);
        assert_eq!(entry.duration_ms, Some(42));
        assert_eq!(entry.response_body_size, original.response_body_size);
    }

    #[test]
    fn json_request_round_trip() {
        let target = TargetUrl::parse("https://api.example.com/v1/items").unwrap();
        let original = EntryBuilder::new(target, "GET")
            .status(Some(200))
            .request_headers(headers_from_pairs([("content-type", "application/json")]))
            .request_body(r#"{"a":1}"#)
            .build();

        let json = to_har_json(&to_har([&original])).unwrap();
        let entry = &from_har_json(&json).unwrap().entries[0];

        assert_eq!(entry.method, "GET");
        assert_eq!(entry.protocol, "https");
        assert_eq!(entry.host, "api.example.com");
        assert_eq!(entry.path, "/v1/items");
        assert_eq!(entry.query, None);
        assert_eq!(entry.status, Some(200));
        assert_eq!(entry.request_body, r#"{"a":1}"#);
        assert_eq!(entry.request_headers, original.request_headers);
        assert_eq!(
            get_header(&entry.request_headers, "content-type"),
            Some("application/json")
        );
    }

    #[test]
    fn gzip_response_is_decoded_on_import() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(br#"{"items":[1,2]}"#).unwrap();
        let gzipped = encoder.finish().unwrap();

        let target = TargetUrl::parse("https://api.example.com/v1/items").unwrap();
        let original = EntryBuilder::new(target, "GET")
            .status(Some(200))
            .response_headers(headers_from_pairs([
                ("content-type", "application/json"),
                ("content-encoding", "gzip"),
            ]))
            .response_body(gzipped.clone())
            .build();

        let har = to_har([&original]);
        assert_eq!(
            har.log.entries[0].response.content.encoding.as_deref(),
            Some("base64")
        );

        let json = to_har_json(&har).unwrap();
        let entry = &from_har_json(&json).unwrap().entries[0];
        assert_eq!(entry.response_raw.as_ref(), gzipped.as_slice());
        assert_eq!(entry.response_encoding.as_deref(), Some("gzip"));
        assert_eq!(entry.response_body_size, gzipped.len());
        assert_eq!(
            entry.response_decoded_body.as_deref(),
            Some(r#"{"items":[1,2]}"#)
        );
        assert_eq!(entry.response_decoded_size, Some(15));
    }

    #[test]
    fn binary_request_body_survives() {
        let target = TargetUrl::parse("http://example.com/upload").unwrap();
        let bytes = vec![0x00u8, 0xff, 0xfe, 0x10];
        let entry = EntryBuilder::new(target, "POST")
            .request_headers(headers_from_pairs([("content-type", "application/octet-stream")]))
            .request_body(bytes.clone())
            .build();

        let har = to_har([&entry]);
        let post = har.log.entries[0].request.post_data.as_ref().unwrap();
        assert_eq!(post.encoding.as_deref(), Some("base64"));
        let value = serde_json::to_value(&har).unwrap();
        assert_eq!(value["log"]["entries"][0]["request"]["postData"]["_encoding"], "base64");

        let back = from_har_entry(&har.log.entries[0]).unwrap();
        assert_eq!(back.request_raw.as_ref(), bytes.as_slice());
        assert_eq!(back.request_body_size, 4);
    }

    #[test]
    fn export_document_shape() {
        let har = to_har([&items_entry()]);
        let value = serde_json::to_value(&har).unwrap();
        assert_eq!(value["log"]["version"], "1.2");
        assert_eq!(value["log"]["creator"]["name"], "Hermes Proxy");
        let entry = &value["log"]["entries"][0];
        assert_eq!(entry["request"]["headersSize"], -1);
        assert!(entry["request"].get("postData").is_none());
        assert_eq!(entry["response"]["content"]["mimeType"], "application/json");
        assert!(entry["response"]["content"].get("encoding").is_none());
        assert!(entry.get("cache").is_some());
    }

    #[test]
    fn binary_body_uses_base64() {
        let target = TargetUrl::parse("http://example.com/img").unwrap();
        let bytes = vec![0x89u8, 0x50, 0x4e, 0x47, 0xff];
        let entry = EntryBuilder::new(target, "GET")
            .status(Some(200))
            .response_body(bytes.clone())
            .build();

        let har = to_har([&entry]);
        let content = &har.log.entries[0].response.content;
        assert_eq!(content.encoding.as_deref(), Some("base64"));

        let back = from_har_entry(&har.log.entries[0]).unwrap();
        assert_eq!(back.response_raw.as_ref(), bytes.as_slice());
    }

    #[test]
    fn status_zero_imports_as_none() {
        let json = r#"{"log":{"entries":[{"request":{"method":"GET","url":"http://a.com/"},"response":{"status":0}}]}}"#;
        let import = from_har_json(json).unwrap();
        assert_eq!(import.entries[0].status, None);
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let json = r#"{"log":{"entries":[
            {"request":{"method":"GET","url":"not a url"}},
            {"nothing": true},
            {"request":{"method":"POST","url":"http://a.com/x","postData":{"text":"hi"}},"response":{"status":201}}
        ]}}"#;
        let import = from_har_json(json).unwrap();
        assert_eq!(import.skipped, 2);
        assert_eq!(import.entries.len(), 1);
        assert_eq!(import.entries[0].request_body, "hi");
    }

    #[test]
    fn empty_or_missing_entries_is_error() {
        assert!(from_har_json(r#"{"log":{"entries":[]}}"#).is_err());
        assert!(from_har_json(r#"{"log":{}}"#).is_err());
        assert!(from_har_json("[]").is_err());
    }
}
