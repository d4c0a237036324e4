//! Adapter error kinds and JSON error responses for the front server

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Errors raised by an adapter while launching, probing, tailing or
/// proxying its backend.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("couldn't find available port: {0}")]
    PortAllocation(#[source] std::io::Error),

    #[error("could not start application: {0}")]
    ProcessStart(#[source] std::io::Error),

    #[error("could not build proxy to {target}: {reason}")]
    ProxyConstruction { target: String, reason: String },

    #[error("timed out after {timeout:?} waiting for port {port}")]
    PortProbeTimeout { port: u16, timeout: Duration },

    #[error("restart pattern matched: {pattern}")]
    RestartPatternMatched { pattern: String },

    #[error("stdout/stderr closed")]
    StreamClosed,

    #[error("error trying to stop process {pid}: {source}")]
    ProcessKill {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Discriminant of [`AdapterError`], cheap to copy into status snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    PortAllocationFailure,
    ProcessStartFailure,
    ProxyConstructionFailure,
    PortProbeTimeout,
    RestartPatternMatched,
    StreamClosed,
    ProcessKillFailure,
}

impl AdapterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::PortAllocation(_) => ErrorKind::PortAllocationFailure,
            AdapterError::ProcessStart(_) => ErrorKind::ProcessStartFailure,
            AdapterError::ProxyConstruction { .. } => ErrorKind::ProxyConstructionFailure,
            AdapterError::PortProbeTimeout { .. } => ErrorKind::PortProbeTimeout,
            AdapterError::RestartPatternMatched { .. } => ErrorKind::RestartPatternMatched,
            AdapterError::StreamClosed => ErrorKind::StreamClosed,
            AdapterError::ProcessKill { .. } => ErrorKind::ProcessKillFailure,
        }
    }
}

/// Why an adapter run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StopReason {
    /// An external caller asked for the stop
    Requested { message: String },
    /// The adapter stopped itself after a failure
    Failure { kind: ErrorKind, message: String },
}

impl StopReason {
    pub fn requested(message: impl Into<String>) -> Self {
        StopReason::Requested {
            message: message.into(),
        }
    }

    /// The failure kind, if this stop was triggered by one
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            StopReason::Requested { .. } => None,
            StopReason::Failure { kind, .. } => Some(*kind),
        }
    }
}

impl From<&AdapterError> for StopReason {
    fn from(err: &AdapterError) -> Self {
        StopReason::Failure {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested { message } => write!(f, "{}", message),
            StopReason::Failure { message, .. } => write!(f, "{}", message),
        }
    }
}

/// Header carrying the error code next to the JSON body
const X_PROXY_ERROR: &str = "x-proxy-error";

/// Failure classes reported to clients of the front server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    MissingHostHeader,
    UnknownHost,
    BackendStartFailed,
    ProxyConstructionFailed,
    ConnectionFailed,
    InternalError,
}

impl ProxyErrorCode {
    /// Bad requests are the client's fault; anything about the backend is
    /// a gateway failure.
    pub fn status_code(self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::UnknownHost
            | ProxyErrorCode::BackendStartFailed
            | ProxyErrorCode::ProxyConstructionFailed
            | ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::BackendStartFailed => "BACKEND_START_FAILED",
            ProxyErrorCode::ProxyConstructionFailed => "PROXY_CONSTRUCTION_FAILED",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ProxyErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{code, message, status}` JSON response for a front server failure
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let status = code.status_code();
    let body = serde_json::json!({
        "code": code,
        "message": message.into(),
        "status": status.as_u16(),
    });

    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header(X_PROXY_ERROR, code.as_str())
        .body(Full::new(Bytes::from(body.to_string())).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = AdapterError::PortProbeTimeout {
            port: 4000,
            timeout: Duration::from_secs(60),
        };
        assert_eq!(err.kind(), ErrorKind::PortProbeTimeout);
        assert_eq!(err.to_string(), "timed out after 60s waiting for port 4000");

        let err = AdapterError::ProcessStart(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such file",
        ));
        assert_eq!(err.kind(), ErrorKind::ProcessStartFailure);
        assert!(err.to_string().starts_with("could not start application"));

        assert_eq!(AdapterError::StreamClosed.kind(), ErrorKind::StreamClosed);
    }

    #[test]
    fn test_stop_reason_from_error() {
        let err = AdapterError::RestartPatternMatched {
            pattern: "FATAL".to_string(),
        };
        let reason = StopReason::from(&err);

        assert_eq!(reason.kind(), Some(ErrorKind::RestartPatternMatched));
        assert_eq!(reason.to_string(), "restart pattern matched: FATAL");
        assert_eq!(StopReason::requested("restart").kind(), None);
    }

    #[test]
    fn test_stop_reason_json() {
        let reason = StopReason::from(&AdapterError::StreamClosed);
        let json = serde_json::to_string(&reason).unwrap();

        assert!(json.contains("\"type\":\"failure\""));
        assert!(json.contains("\"kind\":\"STREAM_CLOSED\""));
    }

    #[test]
    fn test_port_timeout_keeps_sub_second_precision() {
        let err = AdapterError::PortProbeTimeout {
            port: 4000,
            timeout: Duration::from_millis(200),
        };
        assert_eq!(err.to_string(), "timed out after 200ms waiting for port 4000");
    }

    #[test]
    fn test_only_missing_host_is_a_client_error() {
        let gateway = [
            ProxyErrorCode::UnknownHost,
            ProxyErrorCode::BackendStartFailed,
            ProxyErrorCode::ProxyConstructionFailed,
            ProxyErrorCode::ConnectionFailed,
        ];
        for code in gateway {
            assert_eq!(code.status_code(), StatusCode::BAD_GATEWAY, "{}", code);
        }
        assert_eq!(ProxyErrorCode::MissingHostHeader.status_code().as_u16(), 400);
        assert_eq!(ProxyErrorCode::InternalError.status_code().as_u16(), 500);
    }

    #[tokio::test]
    async fn test_error_body_and_header_agree() {
        let response = json_error_response(ProxyErrorCode::BackendStartFailed, "spawn \"x\" failed");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[X_PROXY_ERROR], "BACKEND_START_FAILED");
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "BACKEND_START_FAILED");
        assert_eq!(json["message"], "spawn \"x\" failed");
        assert_eq!(json["status"], 502);
    }
}
