//! Per-request interception flow.
//!
//! ```text
//! request ─▶ buffer body ─▶ first matching rule ─┬─ close ─────────▶ record, abort connection
//!                                                ├─ delay ─▶ sleep ─┐
//!                                                ├─ overrideHeaders ┤
//!                                                └─ none ───────────┴▶ forward ─▶ stream + capture ─▶ record
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST};
use hyper::{Request, Response, StatusCode};

use hermes_core::headers::append_header;
use hermes_core::{
    apply_header_overrides, CoreError, EntryBuilder, HeaderMap, RuleAction, RuleRequestInfo,
    Scheme, TargetUrl,
};

use crate::authority::CertificateAuthority;
use crate::capture::{BoxError, CaptureBody, CaptureOutcome};
use crate::error::{ProxyError, Result};
use crate::state::ProxyState;
use crate::upstream::{hyper_failure, Upstream};

/// Body type returned to intercepted clients.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Everything a connection needs to serve its requests.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub state: Arc<ProxyState>,
    pub upstream: Arc<Upstream>,
    pub authority: Arc<CertificateAuthority>,
    /// Scheme of requests on this connection.
    pub scheme: Scheme,
    /// CONNECT authority, used when a request has no `Host`.
    pub default_authority: Option<String>,
}

impl ConnectionContext {
    /// Context for requests tunnelled through `CONNECT authority`.
    pub fn tunnel(&self, authority: String) -> Self {
        Self {
            scheme: Scheme::Https,
            default_authority: Some(authority),
            ..self.clone()
        }
    }
}

pub(crate) fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub(crate) fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Plain-text response generated by the proxy itself.
pub(crate) fn text_response(status: u16, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full(message.to_string()));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Copies hyper headers into the captured representation.
pub(crate) fn capture_headers(headers: &hyper::HeaderMap) -> HeaderMap {
    let mut captured = HeaderMap::new();
    for (name, value) in headers {
        append_header(
            &mut captured,
            name.as_str(),
            &String::from_utf8_lossy(value.as_bytes()),
        );
    }
    captured
}

/// Resolves the absolute target of a request.
pub(crate) fn resolve_target<B>(
    req: &Request<B>,
    scheme: Scheme,
    default_authority: Option<&str>,
) -> hermes_core::Result<TargetUrl> {
    let uri = req.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return TargetUrl::parse(&uri.to_string());
    }

    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let authority = req
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .or(default_authority)
        .ok_or_else(|| CoreError::InvalidUrl(format!("no host for {}", path)))?;
    TargetUrl::from_parts(scheme, authority, path)
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Handles one non-CONNECT request.
///
/// Returns `Err` only when the client connection must be aborted.
pub async fn intercept(req: Request<Incoming>, ctx: Arc<ConnectionContext>) -> Result<Response<ProxyBody>> {
    let started = Instant::now();

    let target = match resolve_target(&req, ctx.scheme, ctx.default_authority.as_deref()) {
        Ok(target) => target,
        Err(e) => {
            tracing::debug!("Rejecting request without usable target: {}", e);
            return Ok(text_response(400, &e.to_string()));
        }
    };

    let (parts, body) = req.into_parts();
    let method = parts.method.as_str().to_string();
    let request_version = format!("{:?}", parts.version);
    let mut request_headers = capture_headers(&parts.headers);

    let request_body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let failure = hyper_failure(&e);
            tracing::warn!("{} {} request body failed: {}", method, target, failure);
            ctx.state.record(
                EntryBuilder::new(target, method)
                    .request_http_version(request_version)
                    .request_headers(request_headers)
                    .failure(&failure)
                    .duration_ms(Some(elapsed_ms(started)))
                    .build(),
            );
            return Err(ProxyError::Http(format!("request body: {}", e)));
        }
    };

    let url = target.to_string();
    let host = target.authority();
    let rule = ctx.state.rules().evaluate(&RuleRequestInfo {
        method: &method,
        host: &host,
        url: &url,
        headers: &request_headers,
    });

    if let Some(rule) = &rule {
        tracing::debug!(rule = %rule.name, action = rule.action.kind(), "{} {} matched rule", method, url);
        match &rule.action {
            RuleAction::Close => {
                ctx.state.record(
                    EntryBuilder::new(target, method)
                        .request_http_version(request_version)
                        .request_headers(request_headers)
                        .request_body(request_body)
                        .closed_by_rule()
                        .build(),
                );
                return Err(ProxyError::ClosedByRule);
            }
            RuleAction::Delay { delay_ms } => {
                tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
            }
            RuleAction::OverrideHeaders(pairs) => {
                request_headers = apply_header_overrides(&request_headers, pairs);
            }
            RuleAction::None => {}
        }
    }

    let builder = EntryBuilder::new(target.clone(), method.clone())
        .request_http_version(request_version)
        .request_headers(request_headers.clone())
        .request_body(request_body.clone());

    let response = match ctx
        .upstream
        .send(&target, &method, &request_headers, request_body)
        .await
    {
        Ok(response) => response,
        Err(failure) => {
            tracing::warn!("{} {} failed: {}", method, url, failure);
            let status = failure.client_status();
            let message = failure.message.clone();
            ctx.state.record(
                builder
                    .failure(&failure)
                    .duration_ms(Some(elapsed_ms(started)))
                    .build(),
            );
            return Ok(text_response(status, &message));
        }
    };

    let (parts, body) = response.into_parts();
    tracing::debug!("{} {} -> {}", method, url, parts.status);

    let builder = builder
        .status(Some(parts.status.as_u16()))
        .response_http_version(format!("{:?}", parts.version))
        .response_headers(capture_headers(&parts.headers));
    let state = Arc::clone(&ctx.state);
    let captured = CaptureBody::new(body, move |bytes, outcome| {
        let builder = builder
            .response_body(bytes)
            .duration_ms(Some(elapsed_ms(started)));
        let builder = match outcome {
            CaptureOutcome::Complete => builder,
            CaptureOutcome::Failed(message) => builder.error(message),
            CaptureOutcome::TimedOut(failure) => {
                tracing::warn!("Response body stalled: {}", failure);
                builder.failure(&failure)
            }
        };
        state.record(builder.build());
    })
    .with_idle_timeout(ctx.upstream.read_timeout());

    Ok(Response::from_parts(parts, captured.boxed_unsync()))
}
