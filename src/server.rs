//! HTTP front server: routes each request by hostname to its app,
//! starting the app on first use, and serves the control endpoints.

use crate::adapter::{Adapter, AdapterState};
use crate::error::{json_error_response, ProxyErrorCode};
use crate::registry::AppRegistry;
use crate::router::ServeError;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Seconds a client should wait before retrying a not-ready app
const RETRY_AFTER_SECS: u64 = 1;

/// Control endpoint addressed by a request path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    State,
    Log,
    Restart,
    Apps,
}

/// The host-routing front server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    registry: Arc<AppRegistry>,
    control_prefix: Arc<str>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<AppRegistry>,
        control_prefix: &str,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            control_prefix: Arc::from(control_prefix.trim_end_matches('/')),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, apps = self.registry.len(), "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let prefix = Arc::clone(&self.control_prefix);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, registry, prefix).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    registry: Arc<AppRegistry>,
    prefix: Arc<str>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let registry = Arc::clone(&registry);
        let prefix = Arc::clone(&prefix);
        async move { handle_request(req, registry, prefix, addr).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    registry: Arc<AppRegistry>,
    prefix: Arc<str>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let hostname = match extract_hostname(&req) {
        Some(h) => h,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        }
    };

    // Overwrite rather than append: this server is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(hostname, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let app = match registry.find(&hostname) {
        Some(app) => app,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::UnknownHost,
                "Unknown or unconfigured host",
            ));
        }
    };

    if let Some(control) = parse_control(&prefix, req.method(), req.uri().path()) {
        return Ok(handle_control(control, &app, &registry).await);
    }

    match app.status() {
        AdapterState::Running => {}
        AdapterState::Stopped => {
            if let Err(e) = app.start().await {
                // Detail goes to the log, the client gets a generic message
                error!(hostname, error = %e, "Failed to start backend");
                return Ok(json_error_response(
                    ProxyErrorCode::BackendStartFailed,
                    "Backend unavailable",
                ));
            }
            return Ok(not_ready(&app));
        }
        _ => return Ok(not_ready(&app)),
    }

    match app.serve(req).await {
        Ok(response) => Ok(response),
        Err(ServeError::NotRunning) => Ok(not_ready(&app)),
        Err(e) => {
            warn!(hostname, error = %e, "Failed to proxy request");
            let message = match e.code() {
                ProxyErrorCode::ProxyConstructionFailed => "Failed to build proxy for backend",
                _ => "Failed to connect to backend",
            };
            Ok(json_error_response(e.code(), message))
        }
    }
}

fn parse_control(prefix: &str, method: &Method, path: &str) -> Option<Control> {
    let rest = path.strip_prefix(prefix)?;
    match (method, rest) {
        (&Method::GET, "/api/state") => Some(Control::State),
        (&Method::GET, "/api/log") => Some(Control::Log),
        (&Method::POST, "/restart") => Some(Control::Restart),
        (&Method::GET, "/api/apps") => Some(Control::Apps),
        _ => None,
    }
}

async fn handle_control(
    control: Control,
    app: &Arc<Adapter>,
    registry: &AppRegistry,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    match control {
        Control::State => json_response(StatusCode::OK, &app.status_document()),
        Control::Log => {
            let mut buf = Vec::new();
            if let Err(e) = app.write_log(&mut buf) {
                error!(host = %app.host(), error = %e, "Failed to write log");
                return json_error_response(ProxyErrorCode::InternalError, "Failed to read log");
            }
            text_response(StatusCode::OK, buf)
        }
        Control::Restart => {
            info!(host = %app.host(), "Restart requested");
            match app.restart().await {
                Ok(()) => json_response(StatusCode::ACCEPTED, &app.status_document()),
                Err(e) => {
                    error!(host = %app.host(), error = %e, "Failed to restart backend");
                    json_error_response(ProxyErrorCode::BackendStartFailed, "Backend unavailable")
                }
            }
        }
        Control::Apps => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
                "apps": registry.list(),
            }),
        ),
    }
}

fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let hostname = crate::router::request_host(req)?;

    if hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Alphanumeric, hyphen and dot only; keeps hostnames safe to log
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname)
}

/// 202 telling the client the app is on its way up
fn not_ready(app: &Adapter) -> Response<BoxBody<Bytes, hyper::Error>> {
    let state = app.status();
    let body = serde_json::json!({
        "host": app.host(),
        "status": state,
        "message": format!("{} is {}, retry shortly", app.config().name, state),
        "retry_after": RETRY_AFTER_SECS,
    });

    let mut response = json_response(StatusCode::ACCEPTED, &body);
    response
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
    response
}

fn json_response<T: serde::Serialize>(
    status: StatusCode,
    value: &T,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = match serde_json::to_vec(value) {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            return json_error_response(ProxyErrorCode::InternalError, "Internal error");
        }
    };

    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

fn text_response(status: StatusCode, body: Vec<u8>) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdapterConfig;

    #[test]
    fn test_parse_control() {
        let prefix = "/_devgate";
        assert_eq!(
            parse_control(prefix, &Method::GET, "/_devgate/api/state"),
            Some(Control::State)
        );
        assert_eq!(
            parse_control(prefix, &Method::GET, "/_devgate/api/log"),
            Some(Control::Log)
        );
        assert_eq!(
            parse_control(prefix, &Method::POST, "/_devgate/restart"),
            Some(Control::Restart)
        );
        assert_eq!(
            parse_control(prefix, &Method::GET, "/_devgate/api/apps"),
            Some(Control::Apps)
        );
        assert_eq!(parse_control(prefix, &Method::GET, "/_devgate/restart"), None);
        assert_eq!(parse_control(prefix, &Method::GET, "/api/state"), None);
    }

    #[test]
    fn test_extract_hostname_rejects_bad_chars() {
        let req = Request::builder()
            .header("Host", "My-App.test:8080")
            .body(())
            .unwrap();
        assert_eq!(extract_hostname(&req), Some("my-app.test".to_string()));

        let req = Request::builder()
            .header("Host", "evil_host.test")
            .body(())
            .unwrap();
        assert_eq!(extract_hostname(&req), None);

        let long = format!("{}.test", "a".repeat(300));
        let req = Request::builder().header("Host", long).body(()).unwrap();
        assert_eq!(extract_hostname(&req), None);
    }

    #[tokio::test]
    async fn test_not_ready_response() {
        let app = Adapter::new(AdapterConfig::new("app.test", "/tmp", "true %s %s"));
        let response = not_ready(&app);

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "1");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "stopped");
        assert_eq!(json["host"], "app.test");
        assert_eq!(json["retry_after"], 1);
    }
}
