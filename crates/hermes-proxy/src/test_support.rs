//! Local servers and clients shared by the proxy tests.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use hermes_core::ProxyEntry;

use crate::authority::{crypto_provider, CertificateAuthority};
use crate::proxy::{ProxyConfig, ProxyHandle, ProxyServer};
use crate::state::{ProxyEvent, ProxyState};

pub type TestResult<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Plain HTTP origin answering a few fixed routes.
pub struct TestUpstream {
    port: u16,
    hits: Arc<AtomicUsize>,
}

impl TestUpstream {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn route(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let body = match req.uri().path() {
        "/echo-header" => req
            .headers()
            .get("x-test")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string(),
        "/echo-body" => {
            let bytes = req.into_body().collect().await.map(|b| b.to_bytes()).unwrap_or_default();
            String::from_utf8_lossy(&bytes).into_owned()
        }
        "/secure" => "secure hello".to_string(),
        "/no-content" => {
            let mut response = Response::new(Full::new(Bytes::new()));
            *response.status_mut() = StatusCode::NO_CONTENT;
            return Ok(response);
        }
        _ => "hello from upstream".to_string(),
    };
    Ok(Response::new(Full::new(Bytes::from(body))))
}

pub async fn spawn_upstream() -> TestUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    route(req)
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    TestUpstream { port, hits }
}

/// Origin that accepts connections and never answers.
pub async fn spawn_silent_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    port
}

/// Origin that sends a response head and part of the body, then stalls.
pub async fn spawn_stalling_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                }
            }
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial")
                .await;
            held.push(stream);
        }
    });
    port
}

/// HTTPS origin presenting a `localhost` leaf issued by `authority`.
pub async fn spawn_tls_upstream(authority: Arc<CertificateAuthority>) -> u16 {
    let config = authority.server_config("localhost").unwrap();
    let acceptor = TlsAcceptor::from(config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(stream).await {
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(tls), service_fn(route))
                        .await;
                }
            });
        }
    });
    port
}

pub struct RunningProxy {
    pub port: u16,
    pub state: Arc<ProxyState>,
    pub handle: ProxyHandle,
}

/// Starts a proxy on an ephemeral port with its data under `dir`.
pub async fn start_proxy(
    dir: &TempDir,
    configure: impl FnOnce(ProxyConfig) -> ProxyConfig,
) -> RunningProxy {
    let config = configure(ProxyConfig::with_data_dir(dir.path()).with_port(0));
    let state = Arc::new(ProxyState::new(
        config.history_capacity,
        config.rules_path.clone(),
    ));
    let upstream = Arc::new(config.upstream().unwrap());
    let handle = ProxyServer::new(config, Arc::clone(&state), upstream)
        .start()
        .await
        .unwrap();
    RunningProxy {
        port: handle.port(),
        state,
        handle,
    }
}

/// Waits for the next recorded entry.
pub async fn next_entry(events: &mut broadcast::Receiver<ProxyEvent>) -> Arc<ProxyEntry> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ProxyEvent::Entry(entry)) = events.recv().await {
                return entry;
            }
        }
    })
    .await
    .expect("no entry recorded")
}

async fn read_body(response: Response<Incoming>) -> TestResult<(u16, String)> {
    let status = response.status().as_u16();
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok((status, String::from_utf8_lossy(&bytes).into_owned()))
}

/// Sends an absolute-form GET through the proxy.
pub async fn proxy_get(
    proxy_port: u16,
    url: &str,
    headers: &[(&str, &str)],
) -> TestResult<(u16, String)> {
    let stream = TcpStream::connect(("127.0.0.1", proxy_port)).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(conn);

    let uri: hyper::Uri = url.parse()?;
    let host = uri.authority().map(|a| a.to_string()).unwrap_or_default();
    let mut builder = Request::get(url).header("host", host);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let response = sender.send_request(builder.body(Empty::<Bytes>::new())?).await?;
    read_body(response).await
}

/// Sends a POST whose body is shorter than its `Content-Length`, then
/// half-closes. The returned stream keeps the connection open.
pub async fn send_truncated_post(proxy_port: u16, url: &str) -> TestResult<TcpStream> {
    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await?;
    let uri: hyper::Uri = url.parse()?;
    let host = uri.authority().map(|a| a.to_string()).unwrap_or_default();
    let request = format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Length: 100\r\n\r\nonly part",
        url, host
    );
    stream.write_all(request.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(stream)
}

/// Opens a CONNECT tunnel, completes TLS against the proxy and GETs `path`.
pub async fn connect_and_get(
    proxy_port: u16,
    authority: &str,
    path: &str,
    ca_der: CertificateDer<'static>,
) -> TestResult<(u16, String)> {
    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await?;
    stream
        .write_all(format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", authority).as_bytes())
        .await?;

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            return Err("tunnel closed before response".into());
        }
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head);
    if !head.starts_with("HTTP/1.1 200") {
        return Err(format!("unexpected CONNECT response: {}", head).into());
    }

    let mut roots = RootCertStore::empty();
    roots.add(ca_der)?;
    let config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    let host = authority.split(':').next().unwrap_or(authority).to_string();
    let tls = TlsConnector::from(Arc::new(config))
        .connect(ServerName::try_from(host)?, stream)
        .await?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls)).await?;
    tokio::spawn(conn);
    let request = Request::get(path)
        .header("host", authority)
        .body(Empty::<Bytes>::new())?;
    let response = sender.send_request(request).await?;
    read_body(response).await
}
