//! Error handling and JSON error responses for the front door

use crate::upstream::{full_body, BoxError, ProxyBody};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// The client's request body was malformed or cut short
    BadRequest,
    /// Every worker is currently marked unhealthy
    NoHealthyWorker,
    /// Forwarding to the upstream failed (after the retry, if any)
    UpstreamFailed,
    /// The upstream stayed silent for longer than the idle timeout
    UpstreamTimeout,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::NoHealthyWorker => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UpstreamFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::BadRequest => "BAD_REQUEST",
            ProxyErrorCode::NoHealthyWorker => "NO_HEALTHY_WORKER",
            ProxyErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
            ProxyErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Failure on the client side of a forwarded request body
///
/// Request bodies are wrapped so their errors carry this type; finding it in
/// the source chain of a client error tells a client abort apart from a
/// worker fault.
#[derive(Debug, thiserror::Error)]
pub enum ClientBodyError {
    #[error("client request body failed: {0}")]
    Read(#[source] BoxError),

    #[error("client sent no request body data for {0:?}")]
    Idle(Duration),
}

/// Failures on the forwarding path
///
/// These never reach a client as-is; the proxy maps them to a
/// [`ProxyErrorCode`] and keeps the details in its logs.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// Connecting, sending or receiving failed
    #[error("upstream transport error: {0}")]
    Transport(#[source] hyper_util::client::legacy::Error),

    /// No response headers within the idle timeout
    #[error("upstream idle for more than {0:?}")]
    Timeout(Duration),

    /// The request body was streamed on a previous attempt and cannot be replayed
    #[error("request body already consumed by a previous attempt")]
    BodyConsumed,

    /// Reading the client's request body failed
    #[error("failed to read request body: {0}")]
    ClientBody(#[source] BoxError),

    /// The forwarded request could not be assembled
    #[error("failed to build upstream request: {0}")]
    RequestBuild(#[from] http::Error),
}

impl UpstreamError {
    /// Client-facing code for a forwarding attempt that ended with this error
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            UpstreamError::Timeout(_) => ProxyErrorCode::UpstreamTimeout,
            UpstreamError::ClientBody(_) => ProxyErrorCode::BadRequest,
            UpstreamError::RequestBuild(_) => ProxyErrorCode::InternalError,
            _ => ProxyErrorCode::UpstreamFailed,
        }
    }

    /// Whether the failure says something about the worker's health
    pub fn is_upstream_fault(&self) -> bool {
        matches!(self, UpstreamError::Transport(_) | UpstreamError::Timeout(_))
    }
}

impl From<hyper_util::client::legacy::Error> for UpstreamError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        if caused_by_client_body(&err) {
            UpstreamError::ClientBody(Box::new(err))
        } else {
            UpstreamError::Transport(err)
        }
    }
}

fn caused_by_client_body(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<ClientBodyError>() {
            return true;
        }
        current = e.source();
    }
    false
}
