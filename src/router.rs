//! Host-keyed reverse proxy targets pointing at a backend's loopback port

use crate::error::{AdapterError, ProxyErrorCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderValue, HOST};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Error forwarding a request to a constructed target
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("failed to connect to backend: {0}")]
    Connect(#[source] std::io::Error),
    #[error("backend request failed: {0}")]
    Backend(#[from] hyper::Error),
    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),
}

/// Why a request could not be served by an adapter
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("backend is not running")]
    NotRunning,
    #[error(transparent)]
    Proxy(#[from] AdapterError),
    #[error(transparent)]
    Forward(#[from] ForwardError),
}

impl ServeError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            ServeError::NotRunning => ProxyErrorCode::ConnectionFailed,
            ServeError::Proxy(_) => ProxyErrorCode::ProxyConstructionFailed,
            ServeError::Forward(_) => ProxyErrorCode::ConnectionFailed,
        }
    }
}

/// Hostname of a request: the Host header, or the URI authority for
/// HTTP/2, lowercased and without a port.
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;
    let host = raw.split(':').next()?.trim();
    if host.is_empty() {
        return None;
    }
    Some(host.to_lowercase())
}

/// Check if a request asks for a connection upgrade (e.g. WebSocket)
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Forwarding configuration for one inbound hostname
pub struct ProxyTarget {
    host: String,
    host_header: HeaderValue,
    port: u16,
    url: Uri,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl std::fmt::Debug for ProxyTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyTarget")
            .field("host", &self.host)
            .field("url", &self.url)
            .finish()
    }
}

impl ProxyTarget {
    /// Build a target for `host` pointed at `scheme://127.0.0.1:port`
    pub fn new(scheme: &str, host: &str, port: u16) -> Result<Self, AdapterError> {
        let target = format!("{}://127.0.0.1:{}", scheme, port);
        let construction = |reason: String| AdapterError::ProxyConstruction {
            target: target.clone(),
            reason,
        };

        let url: Uri = target.parse().map_err(|e| construction(format!("{}", e)))?;
        let host_header =
            HeaderValue::from_str(host).map_err(|e| construction(format!("invalid host: {}", e)))?;

        let tls = match scheme {
            "http" => None,
            "https" => {
                let connector = tls_connector().map_err(|e| construction(e.to_string()))?;
                let server_name = ServerName::try_from(host.to_string())
                    .unwrap_or_else(|_| ServerName::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST).into()));
                Some((connector, server_name))
            }
            other => return Err(construction(format!("unsupported scheme '{}'", other))),
        };

        Ok(Self {
            host: host.to_string(),
            host_header,
            port,
            url,
            tls,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> &Uri {
        &self.url
    }

    /// Forward `req` to the backend and stream its response back.
    ///
    /// Method, headers and body pass through unchanged. A missing Host
    /// header is filled with the target's hostname. When the client asks
    /// for an upgrade and the backend answers 101, both upgraded
    /// connections are tunnelled in a background task.
    pub async fn forward<B>(
        &self,
        mut req: Request<B>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let client_upgrade = if is_upgrade_request(&req) {
            Some(hyper::upgrade::on(&mut req))
        } else {
            None
        };

        let (mut parts, body) = req.into_parts();
        let uri: Uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .parse()
            .map_err(hyper::http::Error::from)?;
        parts.uri = uri;
        // Backend connections are always HTTP/1.1
        parts.version = Version::HTTP_11;
        if !parts.headers.contains_key(HOST) {
            parts.headers.insert(HOST, self.host_header.clone());
        }
        let backend_req = Request::from_parts(parts, body);

        let stream = TcpStream::connect(("127.0.0.1", self.port))
            .await
            .map_err(ForwardError::Connect)?;
        let _ = stream.set_nodelay(true);

        let mut response = match &self.tls {
            None => send_over(stream, backend_req).await?,
            Some((connector, server_name)) => {
                let stream = connector
                    .connect(server_name.clone(), stream)
                    .await
                    .map_err(ForwardError::Connect)?;
                send_over(stream, backend_req).await?
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let backend_upgrade = hyper::upgrade::on(&mut response);
                tokio::spawn(tunnel(client_upgrade, backend_upgrade, self.host.clone()));
                let (parts, _) = response.into_parts();
                return Ok(Response::from_parts(
                    parts,
                    Empty::<Bytes>::new().map_err(|never| match never {}).boxed(),
                ));
            }
        }

        Ok(response.map(|body: Incoming| body.boxed()))
    }
}

/// Send one request over a fresh HTTP/1.1 connection
async fn send_over<T, B>(io: T, req: Request<B>) -> Result<Response<Incoming>, hyper::Error>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(error = %e, "Backend connection closed with error");
        }
    });
    sender.send_request(req).await
}

/// Copy bytes both ways between the upgraded client and backend connections
async fn tunnel(client: OnUpgrade, backend: OnUpgrade, host: String) {
    match tokio::try_join!(client, backend) {
        Ok((client, backend)) => {
            let mut client = TokioIo::new(client);
            let mut backend = TokioIo::new(backend);
            match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                Ok((to_backend, to_client)) => {
                    debug!(host, to_backend, to_client, "Upgraded connection closed");
                }
                Err(e) => {
                    debug!(host, error = %e, "Upgraded connection closed with error");
                }
            }
        }
        Err(e) => {
            warn!(host, error = %e, "Connection upgrade failed");
        }
    }
}

/// Lazily built proxy targets, one per inbound hostname.
///
/// Has its own lock so request forwarding never waits on lifecycle
/// transitions. A target built for an older port is rebuilt on lookup.
pub struct ProxyRouter {
    scheme: String,
    targets: Mutex<HashMap<String, Arc<ProxyTarget>>>,
}

impl ProxyRouter {
    pub fn new(scheme: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            targets: Mutex::new(HashMap::new()),
        }
    }

    /// Get the cached target for `host`, building it if absent or stale
    pub fn target_for(&self, host: &str, port: u16) -> Result<Arc<ProxyTarget>, AdapterError> {
        let mut targets = self.targets.lock();
        if let Some(target) = targets.get(host) {
            if target.port() == port {
                return Ok(Arc::clone(target));
            }
        }

        let target = Arc::new(ProxyTarget::new(&self.scheme, host, port)?);
        debug!(host, url = %target.url(), "Built proxy target");
        targets.insert(host.to_string(), Arc::clone(&target));
        Ok(target)
    }

    /// Number of cached targets
    pub fn len(&self) -> usize {
        self.targets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.lock().is_empty()
    }
}

fn tls_connector() -> Result<TlsConnector, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(LoopbackVerifier { provider }))
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accepts any certificate. Backends are local dev servers on loopback,
/// usually with self-signed certificates.
#[derive(Debug)]
struct LoopbackVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for LoopbackVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::service::service_fn;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one backend that echoes method, path, Host and body
    async fn echo_backend() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let method = req.method().clone();
                        let path = req.uri().path().to_string();
                        let host = req
                            .headers()
                            .get(HOST)
                            .and_then(|h| h.to_str().ok())
                            .unwrap_or("")
                            .to_string();
                        let body = req.into_body().collect().await?.to_bytes();
                        let text = format!(
                            "{} {} {} {}",
                            method,
                            path,
                            host,
                            String::from_utf8_lossy(&body)
                        );
                        Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(text))))
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        port
    }

    #[test]
    fn test_request_host() {
        let req = Request::builder()
            .uri("/")
            .header(HOST, "App.Test:8080")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req), Some("app.test".to_string()));

        let req = Request::builder()
            .uri("https://h2.test/path")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req), Some("h2.test".to_string()));

        let req = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(request_host(&req), None);
    }

    #[test]
    fn test_is_upgrade_request() {
        let req = Request::builder()
            .header("Connection", "keep-alive, Upgrade")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let req = Request::builder()
            .header("Connection", "keep-alive")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&req));
    }

    #[test]
    fn test_target_construction() {
        let target = ProxyTarget::new("http", "app.test", 4000).unwrap();
        assert_eq!(target.url().to_string(), "http://127.0.0.1:4000/");
        assert_eq!(target.host(), "app.test");

        let target = ProxyTarget::new("https", "app.test", 4000).unwrap();
        assert_eq!(target.url().scheme_str(), Some("https"));

        let err = ProxyTarget::new("gopher", "app.test", 4000).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ProxyConstructionFailure);
    }

    #[test]
    fn test_router_caches_per_host() {
        let router = ProxyRouter::new("http");

        let a1 = router.target_for("a.test", 4000).unwrap();
        let a2 = router.target_for("a.test", 4000).unwrap();
        let b = router.target_for("b.test", 4000).unwrap();

        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
        assert_eq!(a1.port(), b.port());
        assert_eq!(router.len(), 2);
    }

    #[test]
    fn test_router_rebuilds_on_port_change() {
        let router = ProxyRouter::new("http");

        let old = router.target_for("a.test", 4000).unwrap();
        let new = router.target_for("a.test", 4001).unwrap();

        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(new.port(), 4001);
        assert_eq!(router.len(), 1);
    }

    #[tokio::test]
    async fn test_forward_passes_request_through() {
        let port = echo_backend().await;
        let target = ProxyTarget::new("http", "app.test", port).unwrap();

        let req = Request::builder()
            .method("POST")
            .uri("http://app.test/submit?x=1")
            .header(HOST, "app.test")
            .body(Full::new(Bytes::from("payload")))
            .unwrap();

        let response = target.forward(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "POST /submit app.test payload");
    }

    #[tokio::test]
    async fn test_forward_fills_missing_host() {
        let port = echo_backend().await;
        let target = ProxyTarget::new("http", "api.app.test", port).unwrap();

        let req = Request::builder()
            .uri("/")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let response = target.forward(req).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "GET / api.app.test ");
    }

    #[tokio::test]
    async fn test_forward_connection_refused() {
        let port = crate::launcher::find_available_port().unwrap();
        let target = ProxyTarget::new("http", "app.test", port).unwrap();

        let req = Request::builder()
            .uri("/")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let err = target.forward(req).await.unwrap_err();
        assert!(matches!(err, ForwardError::Connect(_)));
    }

    /// Read an HTTP head byte by byte, leaving anything after it unread
    async fn read_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            let mut byte = [0u8; 1];
            if stream.read(&mut byte).await.unwrap() == 0 {
                break;
            }
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    /// Backend that answers 101 and then echoes whatever it receives
    async fn switching_backend() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_head(&mut stream).await;
            stream
                .write_all(
                    b"HTTP/1.1 101 Switching Protocols\r\n\
                      Connection: Upgrade\r\n\
                      Upgrade: echo\r\n\r\n",
                )
                .await
                .unwrap();
            let (mut reader, mut writer) = stream.split();
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        port
    }

    #[tokio::test]
    async fn test_forward_tunnels_upgraded_connection() {
        let backend_port = switching_backend().await;
        let target = Arc::new(ProxyTarget::new("http", "app.test", backend_port).unwrap());

        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = front.accept().await.unwrap();
            let service = service_fn(move |req: Request<Incoming>| {
                let target = Arc::clone(&target);
                async move { target.forward(req).await }
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await;
        });

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client
            .write_all(
                b"GET /socket HTTP/1.1\r\n\
                  Host: app.test\r\n\
                  Connection: Upgrade\r\n\
                  Upgrade: echo\r\n\r\n",
            )
            .await
            .unwrap();

        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 101"), "unexpected head: {}", head);

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        tokio::time::timeout(std::time::Duration::from_secs(5), client.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&echoed, b"ping");
    }
}
