//! Replay of captured exchanges.
//!
//! A replay rebuilds a request from a stored entry, applies caller overrides
//! and sends it straight to the origin. The result is recorded as a brand-new
//! entry; the source entry is never touched.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use hermes_core::{
    build_replay_headers, decode_body, sanitize_headers, EntryBuilder, ExchangeFailure,
    HeaderPair, ProxyEntry, TargetUrl,
};

use crate::error::Result;
use crate::handler::capture_headers;
use crate::state::ProxyState;
use crate::upstream::{hyper_failure, Upstream};

/// Caller-supplied changes applied to a replayed request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayOverrides {
    /// Target URL; a URL without a scheme inherits the entry's scheme.
    pub url: Option<String>,
    pub method: Option<String>,
    /// Full replacement of the request headers.
    pub headers: Option<Vec<HeaderPair>>,
    /// Request body text.
    pub body: Option<String>,
}

impl ReplayOverrides {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_headers(mut self, headers: Vec<HeaderPair>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Resolves the replay target, prefixing scheme-less URLs with the entry's scheme.
fn replay_target(source: &ProxyEntry, url: Option<&str>) -> hermes_core::Result<TargetUrl> {
    let Some(url) = url.map(str::trim).filter(|u| !u.is_empty()) else {
        return source.target();
    };
    if url.contains("://") {
        TargetUrl::parse(url)
    } else if let Some(rest) = url.strip_prefix("//") {
        TargetUrl::parse(&format!("{}://{}", source.protocol, rest))
    } else {
        TargetUrl::parse(&format!("{}://{}", source.protocol, url))
    }
}

/// Picks the body to send and whether it is no longer content-encoded.
fn replay_body(source: &ProxyEntry, override_body: Option<&str>) -> (Bytes, bool) {
    if let Some(body) = override_body {
        return (Bytes::from(body.to_string()), true);
    }
    let raw = if source.request_raw.is_empty() {
        Bytes::from(source.request_body.clone())
    } else {
        source.request_raw.clone()
    };
    match decode_body(&raw, source.request_encoding.as_deref()) {
        Some(decoded) => (Bytes::from(decoded), true),
        None => (raw, false),
    }
}

/// Replays `source` with `overrides` and records the outcome.
///
/// Upstream failures are recorded like live ones and still return the new
/// entry; only an unusable override URL is an error.
pub async fn replay(
    state: &ProxyState,
    upstream: &Upstream,
    source: &ProxyEntry,
    overrides: &ReplayOverrides,
) -> Result<Arc<ProxyEntry>> {
    let started = Instant::now();
    let target = replay_target(source, overrides.url.as_deref())?;
    let method = overrides
        .method
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_ascii_uppercase)
        .unwrap_or_else(|| source.method.clone());

    let (body, body_decoded) = replay_body(source, overrides.body.as_deref());
    let headers = sanitize_headers(
        &build_replay_headers(&source.request_headers, overrides.headers.as_deref()),
        body_decoded,
    );

    tracing::info!("Replaying {} as {} {}", source.id, method, target);

    let builder = EntryBuilder::new(target.clone(), method.clone())
        .request_http_version(source.request_http_version.clone())
        .request_headers(headers.clone())
        .request_body(body.clone());

    let elapsed = |started: Instant| Some(started.elapsed().as_millis() as u64);

    let response = match upstream.send(&target, &method, &headers, body).await {
        Ok(response) => response,
        Err(failure) => {
            tracing::warn!("Replay of {} failed: {}", source.id, failure);
            return Ok(state.record(builder.failure(&failure).duration_ms(elapsed(started)).build()));
        }
    };

    let (parts, incoming) = response.into_parts();
    let builder = builder
        .status(Some(parts.status.as_u16()))
        .response_http_version(format!("{:?}", parts.version))
        .response_headers(capture_headers(&parts.headers));

    let collected = match timeout(upstream.read_timeout(), incoming.collect()).await {
        Ok(Ok(collected)) => collected.to_bytes(),
        Ok(Err(e)) => {
            let failure = hyper_failure(&e);
            return Ok(state.record(builder.failure(&failure).duration_ms(elapsed(started)).build()));
        }
        Err(_) => {
            let failure = ExchangeFailure::timed_out("Response body");
            return Ok(state.record(builder.failure(&failure).duration_ms(elapsed(started)).build()));
        }
    };

    Ok(state.record(
        builder
            .response_body(collected)
            .duration_ms(elapsed(started))
            .build(),
    ))
}
