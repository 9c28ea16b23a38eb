//! MITM proxy server.
//!
//! Accepts plain HTTP/1.1 proxy connections. `CONNECT` tunnels are answered
//! with `200 Connection Established`, the client's TLS handshake is terminated
//! with a leaf certificate for its SNI host, and the decrypted stream is served
//! as HTTPS through the same interception flow.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::http::uri::Authority;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use rustls::pki_types::CertificateDer;
use rustls::server::Acceptor;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::LazyConfigAcceptor;

use hermes_core::{Scheme, HISTORY_LIMIT, PROXY_PORT_START, RULES_FILENAME};

use crate::ca::CaManager;
use crate::error::{ProxyError, Result};
use crate::handler::{empty, intercept, text_response, ConnectionContext, ProxyBody};
use crate::state::ProxyState;
use crate::upstream::{Upstream, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT};

/// Default bind host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Host to bind the proxy to.
    pub host: String,
    /// First port tried; incremented while in use.
    pub port: u16,
    /// The CA manager for certificate generation.
    pub ca_manager: CaManager,
    /// Rules file loaded at startup and written on updates.
    pub rules_path: PathBuf,
    /// Upstream TCP connect timeout.
    pub connect_timeout: Duration,
    /// Upstream read timeout for the response head and each body frame.
    pub read_timeout: Duration,
    /// Additional roots trusted for upstream TLS.
    pub extra_roots: Vec<CertificateDer<'static>>,
    /// Maximum number of entries kept in history.
    pub history_capacity: usize,
}

impl ProxyConfig {
    /// Creates a configuration rooted in the default data directory.
    pub fn new() -> Result<Self> {
        let data_dir = crate::default_data_dir()
            .ok_or_else(|| ProxyError::Proxy("Failed to get project dirs".into()))?;
        Ok(Self::with_data_dir(data_dir))
    }

    /// Creates a configuration keeping the CA and rules under `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            host: DEFAULT_HOST.to_string(),
            port: PROXY_PORT_START,
            ca_manager: CaManager::new(data_dir.join("ca")),
            rules_path: data_dir.join(RULES_FILENAME),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            extra_roots: Vec::new(),
            history_capacity: HISTORY_LIMIT,
        }
    }

    /// Sets the bind host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the first port to try (0 picks an ephemeral port).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the CA manager.
    pub fn with_ca_manager(mut self, ca_manager: CaManager) -> Self {
        self.ca_manager = ca_manager;
        self
    }

    /// Sets the rules file.
    pub fn with_rules_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.rules_path = path.into();
        self
    }

    /// Sets the upstream connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the upstream response-head timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Trusts an additional root for upstream TLS.
    pub fn with_extra_root(mut self, root: CertificateDer<'static>) -> Self {
        self.extra_roots.push(root);
        self
    }

    /// Sets the history capacity.
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Builds the upstream transport for this configuration.
    pub fn upstream(&self) -> Result<Upstream> {
        Upstream::new(self.connect_timeout, self.read_timeout, &self.extra_roots)
    }
}

/// Binds `host` starting at `start_port`, moving up while the port is taken.
///
/// Any error other than address-in-use is returned immediately.
pub async fn bind_with_retry(host: &str, start_port: u16) -> Result<(TcpListener, u16)> {
    let mut port = start_port;
    loop {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => {
                let bound = listener.local_addr()?.port();
                return Ok((listener, bound));
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && port != 0 && port < u16::MAX => {
                tracing::debug!("Port {} in use, trying {}", port, port + 1);
                port += 1;
            }
            Err(e) => return Err(ProxyError::Io(e)),
        }
    }
}

/// MITM proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    state: Arc<ProxyState>,
    upstream: Arc<Upstream>,
}

impl ProxyServer {
    /// Creates a server over shared state.
    pub fn new(config: ProxyConfig, state: Arc<ProxyState>, upstream: Arc<Upstream>) -> Self {
        Self {
            config,
            state,
            upstream,
        }
    }

    /// Loads the CA, binds the listener and serves in the background.
    pub async fn start(self) -> Result<ProxyHandle> {
        let authority = self.config.ca_manager.authority().await?;
        let (listener, port) = bind_with_retry(&self.config.host, self.config.port).await?;

        tracing::info!("Starting MITM proxy on {}:{}", self.config.host, port);
        tracing::info!("CA certificate: {:?}", self.config.ca_manager.cert_path());
        self.state.publish_port(port);

        let context = Arc::new(ConnectionContext {
            state: self.state,
            upstream: self.upstream,
            authority,
            scheme: Scheme::Http,
            default_authority: None,
        });

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            let context = Arc::clone(&context);
                            tokio::spawn(async move {
                                tracing::trace!("Accepted connection from {}", peer);
                                serve_connection(stream, context).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!("Failed to accept connection: {}", e);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Proxy shutdown signal received");
                        break;
                    }
                }
            }
        });

        Ok(ProxyHandle {
            shutdown_tx,
            port,
            handle,
        })
    }
}

/// Serves HTTP/1.1 on an accepted or decrypted stream.
async fn serve_connection<I>(io: I, context: Arc<ConnectionContext>)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move {
            if req.method() == Method::CONNECT {
                handle_connect(req, context)
            } else {
                intercept(req, context).await
            }
        }
    });

    if let Err(e) = http1::Builder::new()
        .preserve_header_case(true)
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await
    {
        tracing::debug!("Connection ended: {}", e);
    }
}

/// Answers a CONNECT and takes over the tunnel once upgraded.
fn handle_connect(req: Request<Incoming>, context: Arc<ConnectionContext>) -> Result<Response<ProxyBody>> {
    let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
        return Ok(text_response(400, "CONNECT requires host:port"));
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = intercept_tls(upgraded, authority.clone(), context).await {
                    tracing::debug!("TLS interception for {} failed: {}", authority, e);
                }
            }
            Err(e) => tracing::debug!("CONNECT upgrade for {} failed: {}", authority, e),
        }
    });

    let mut response = Response::new(empty());
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    Ok(response)
}

/// Host part of a CONNECT authority, without IPv6 brackets.
fn connect_host(authority: &str) -> String {
    match authority.parse::<Authority>() {
        Ok(parsed) => parsed
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string(),
        Err(_) => authority.to_string(),
    }
}

/// Terminates the client's TLS with a leaf for its SNI host.
async fn intercept_tls(
    upgraded: Upgraded,
    connect_authority: String,
    context: Arc<ConnectionContext>,
) -> Result<()> {
    let start = LazyConfigAcceptor::new(Acceptor::default(), TokioIo::new(upgraded))
        .await
        .map_err(|e| ProxyError::Tls(e.to_string()))?;

    let fallback_host = connect_host(&connect_authority);
    let sni = start
        .client_hello()
        .server_name()
        .map(str::to_string)
        .unwrap_or(fallback_host);

    let config = context.authority.server_config(&sni)?;
    let tls = start
        .into_stream(config)
        .await
        .map_err(|e| ProxyError::Tls(e.to_string()))?;
    tracing::debug!("Intercepting TLS for {} (SNI {})", connect_authority, sni);

    serve_connection(tls, Arc::new(context.tunnel(connect_authority))).await;
    Ok(())
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    port: u16,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the loopback address of the listener.
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.port))
    }

    /// Signals the proxy to stop accepting connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the accept loop to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
