//! Header map helpers shared by capture, rules, replay and HAR.
//!
//! Captured headers are kept as a name → value map. Names keep the casing they
//! arrived with; repeated headers are folded into one comma-joined value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Captured header map (name → comma-joined value).
pub type HeaderMap = BTreeMap<String, String>;

/// A single `name: value` pair, used for rule matchers, overrides and replay.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeaderPair {
    /// Header name.
    pub name: String,
    /// Header value.
    pub value: String,
}

impl HeaderPair {
    /// Creates a new header pair.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Headers that are always recomputed by the transport before sending.
const TRANSPORT_MANAGED: &[&str] = &["host", "content-length", "proxy-connection"];

/// Appends a header to the map, joining repeated names with `", "`.
pub fn append_header(headers: &mut HeaderMap, name: &str, value: &str) {
    let name = name.trim();
    if name.is_empty() {
        return;
    }
    match headers.get_mut(name) {
        Some(existing) => {
            existing.push_str(", ");
            existing.push_str(value);
        }
        None => {
            headers.insert(name.to_string(), value.to_string());
        }
    }
}

/// Builds a header map from a list of pairs, merging duplicates.
pub fn headers_from_pairs<'a, I>(pairs: I) -> HeaderMap
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        append_header(&mut headers, name, value);
    }
    headers
}

/// Case-insensitive header lookup.
pub fn get_header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Applies override pairs: every existing key equal (ignoring case) to the
/// override name is removed and exactly one entry with the override's own
/// casing is inserted.
pub fn apply_header_overrides(headers: &HeaderMap, overrides: &[HeaderPair]) -> HeaderMap {
    let mut next = headers.clone();
    for pair in overrides {
        if pair.name.is_empty() {
            continue;
        }
        next.retain(|key, _| !key.eq_ignore_ascii_case(&pair.name));
        next.insert(pair.name.clone(), pair.value.clone());
    }
    next
}

/// Replay header set: an override list fully replaces the original headers.
pub fn build_replay_headers(original: &HeaderMap, overrides: Option<&[HeaderPair]>) -> HeaderMap {
    let Some(list) = overrides else {
        return original.clone();
    };
    let mut headers = HeaderMap::new();
    for pair in list {
        let name = pair.name.trim();
        if name.is_empty() {
            continue;
        }
        headers.insert(name.to_string(), pair.value.clone());
    }
    headers
}

/// Removes transport-managed headers (`Host`, `Content-Length`,
/// `Proxy-Connection`) and, when requested, `Content-Encoding`.
pub fn sanitize_headers(headers: &HeaderMap, strip_content_encoding: bool) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| {
            let lower = name.to_ascii_lowercase();
            if TRANSPORT_MANAGED.contains(&lower.as_str()) {
                return false;
            }
            !(strip_content_encoding && lower == "content-encoding")
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}
