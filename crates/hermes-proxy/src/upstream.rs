//! Upstream transport: one HTTP/1.1 connection per forwarded request.
//!
//! Every failure is reported as an [`ExchangeFailure`] so callers can record
//! it with the shared status classification.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST};
use hyper::{Method, Request, Response, Version};
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use hermes_core::{ExchangeFailure, HeaderMap, Scheme, TargetUrl};

use crate::authority::{crypto_provider, ALPN_HTTP11};
use crate::error::{ProxyError, Result};

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait for the upstream response head or the next body frame.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Hop-by-hop headers that are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "host",
    "content-length",
];

/// Client side of the proxy.
#[derive(Clone)]
pub struct Upstream {
    connect_timeout: Duration,
    read_timeout: Duration,
    tls: TlsConnector,
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

impl Upstream {
    /// Creates a transport trusting the webpki roots plus `extra_roots`.
    pub fn new(
        connect_timeout: Duration,
        read_timeout: Duration,
        extra_roots: &[CertificateDer<'static>],
    ) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for cert in extra_roots {
            roots
                .add(cert.clone())
                .map_err(|e| ProxyError::Tls(e.to_string()))?;
        }

        let mut config = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

        Ok(Self {
            connect_timeout,
            read_timeout,
            tls: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Sends a request and returns the response once its head arrives.
    pub async fn send(
        &self,
        target: &TargetUrl,
        method: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> std::result::Result<Response<Incoming>, ExchangeFailure> {
        let request = build_request(target, method, headers, body)?;
        let tcp = self.connect(target).await?;

        let mut sender = match target.scheme {
            Scheme::Http => handshake(tcp).await?,
            Scheme::Https => {
                let server_name = ServerName::try_from(target.host.clone())
                    .map_err(|e| ExchangeFailure::new(None, e.to_string()))?;
                let tls = timeout(self.connect_timeout, self.tls.connect(server_name, tcp))
                    .await
                    .map_err(|_| {
                        ExchangeFailure::new(
                            Some("ETIMEDOUT"),
                            format!("TLS handshake with {} timed out", target.authority()),
                        )
                    })?
                    .map_err(ExchangeFailure::from)?;
                handshake(tls).await?
            }
        };

        match timeout(self.read_timeout, sender.send_request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(hyper_failure(&e)),
            Err(_) => Err(ExchangeFailure::new(
                Some("ESOCKETTIMEDOUT"),
                format!(
                    "Response timeout after {}ms",
                    self.read_timeout.as_millis()
                ),
            )),
        }
    }

    /// Time allowed for the response head and between body frames.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    async fn connect(&self, target: &TargetUrl) -> std::result::Result<TcpStream, ExchangeFailure> {
        let port = target.port_or_default();
        let addrs: Vec<SocketAddr> =
            match timeout(self.connect_timeout, lookup_host((target.host.as_str(), port))).await {
                Err(_) => return Err(connect_timed_out(target)),
                Ok(Err(e)) => return Err(ExchangeFailure::not_found(&target.host, &e)),
                Ok(Ok(addrs)) => addrs.collect(),
            };
        if addrs.is_empty() {
            let err = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
            return Err(ExchangeFailure::not_found(&target.host, &err));
        }

        match timeout(self.connect_timeout, connect_any(&addrs)).await {
            Err(_) => Err(connect_timed_out(target)),
            Ok(Err(e)) => Err(ExchangeFailure::from(&e)),
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
        }
    }
}

fn connect_timed_out(target: &TargetUrl) -> ExchangeFailure {
    ExchangeFailure::new(
        Some("ETIMEDOUT"),
        format!("connect ETIMEDOUT {}", target.authority()),
    )
}

async fn connect_any(addrs: &[SocketAddr]) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses")))
}

async fn handshake<S>(stream: S) -> std::result::Result<SendRequest<Full<Bytes>>, ExchangeFailure>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| hyper_failure(&e))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("Upstream connection error: {}", e);
        }
    });
    Ok(sender)
}

/// Builds an origin-form request with the captured headers.
pub(crate) fn build_request(
    target: &TargetUrl,
    method: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> std::result::Result<Request<Full<Bytes>>, ExchangeFailure> {
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|e| ExchangeFailure::new(None, format!("Invalid method: {}", e)))?;

    let mut request = Request::builder()
        .method(method)
        .uri(target.path_and_query())
        .version(Version::HTTP_11)
        .body(Full::new(Bytes::new()))
        .map_err(|e| ExchangeFailure::new(None, e.to_string()))?;

    let out = request.headers_mut();
    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                out.append(name, value);
            }
            _ => tracing::debug!("Dropping invalid header {:?}", name),
        }
    }

    let host = HeaderValue::from_str(&target.authority())
        .map_err(|e| ExchangeFailure::new(None, format!("Invalid host: {}", e)))?;
    out.insert(HOST, host);
    if !body.is_empty() {
        out.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    }

    *request.body_mut() = Full::new(body);
    Ok(request)
}

/// Maps a hyper error to a failure, preferring the underlying IO error.
pub(crate) fn hyper_failure(err: &hyper::Error) -> ExchangeFailure {
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            return ExchangeFailure::from(io_err);
        }
        source = inner.source();
    }
    if err.is_timeout() {
        ExchangeFailure::new(Some("ETIMEDOUT"), err.to_string())
    } else if err.is_incomplete_message() || err.is_closed() {
        ExchangeFailure::new(Some("ECONNRESET"), err.to_string())
    } else {
        ExchangeFailure::new(None, err.to_string())
    }
}
