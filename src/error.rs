use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Response, StatusCode};
use thiserror::Error;

use crate::models::ProxyState;

/// Unified error type for NetFusion
#[derive(Error, Debug)]
pub enum FusionError {
    // Configuration errors
    #[error("No uplinks selected")]
    NoUplinks,

    #[error("Invalid uplink: {0}")]
    InvalidUplink(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Bind errors
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    // Upstream transport errors
    #[error("DNS lookup failed: {0}")]
    UpstreamDns(String),

    #[error("Upstream connection failed: {0}")]
    UpstreamConnect(String),

    #[error("Failed to read upstream response: {0}")]
    UpstreamRead(String),

    #[error("Upstream request timed out after {after:?}")]
    UpstreamTimeout { after: Duration },

    #[error("Request cancelled: proxy is shutting down")]
    Cancelled,

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not supported: {0}")]
    UnsupportedMethod(Method),

    // Lifecycle misuse
    #[error("Proxy is already {state}")]
    AlreadyRunning { state: ProxyState },

    #[error("Proxy is not running")]
    NotRunning,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for NetFusion operations
pub type Result<T> = std::result::Result<T, FusionError>;

impl FusionError {
    /// Get the HTTP status code a proxy client sees for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            FusionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            // 501 Not Implemented
            FusionError::UnsupportedMethod(_) => StatusCode::NOT_IMPLEMENTED,

            // 502 Bad Gateway
            FusionError::UpstreamDns(_)
            | FusionError::UpstreamConnect(_)
            | FusionError::UpstreamRead(_)
            | FusionError::UpstreamTimeout { .. } => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            FusionError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error
            FusionError::NoUplinks
            | FusionError::InvalidUplink(_)
            | FusionError::InvalidConfig(_)
            | FusionError::Bind { .. }
            | FusionError::AlreadyRunning { .. }
            | FusionError::NotRunning
            | FusionError::Io(_)
            | FusionError::Http(_)
            | FusionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error is an upstream transport failure
    ///
    /// Transport failures are recovered per request and never end the session.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            FusionError::UpstreamDns(_)
                | FusionError::UpstreamConnect(_)
                | FusionError::UpstreamRead(_)
                | FusionError::UpstreamTimeout { .. }
        )
    }

    /// Render this error as a plain-text proxy response
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        text_response(self.status_code(), &self.to_string())
    }
}

/// Build a plain-text response with the given status
pub fn text_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
