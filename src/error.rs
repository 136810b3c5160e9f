//! Error types for the proxy data path.
//!
//! Every suspension point of an exchange returns a `ProxyResult`; the
//! dispatcher inspects the variant to decide between an HTTP error response
//! (nothing sent yet) and an aborted connection (streaming already started).

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Errors that can occur while relaying an exchange.
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    /// Reading the inbound or backend body failed mid-stream.
    #[error("Stream read error: {0}")]
    StreamRead(String),

    /// The backend could not be connected to or the exchange failed before headers.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend did not produce response headers in time.
    #[error("Backend timed out after {0:?}")]
    BackendTimeout(Duration),

    /// Declared `Content-Length` and relayed byte count disagree.
    #[error("Framing mismatch: declared {declared} bytes, received {received}")]
    FramingMismatch { declared: u64, received: u64 },

    /// The original client went away mid-stream.
    #[error("Client disconnected")]
    ClientDisconnected,

    /// The forwarded request could not be built.
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// The proxy is draining and accepts no new exchanges.
    #[error("Proxy is shutting down")]
    ShuttingDown,
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// Status code used when the error surfaces before any response bytes.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::StreamRead(_)
            | ProxyError::BackendUnavailable(_)
            | ProxyError::FramingMismatch { .. }
            | ProxyError::ClientDisconnected
            | ProxyError::InvalidTarget(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::StreamRead(_) => "stream_read",
            ProxyError::BackendUnavailable(_) => "backend_unavailable",
            ProxyError::BackendTimeout(_) => "backend_timeout",
            ProxyError::FramingMismatch { .. } => "framing_mismatch",
            ProxyError::ClientDisconnected => "client_disconnected",
            ProxyError::InvalidTarget(_) => "invalid_target",
            ProxyError::ShuttingDown => "shutting_down",
        }
    }

    /// Find a `ProxyError` somewhere in an error's source chain.
    ///
    /// Body errors raised by our own streams come back wrapped by hyper and axum.
    pub fn find_in(err: &(dyn std::error::Error + 'static)) -> Option<ProxyError> {
        let mut current = Some(err);
        while let Some(e) = current {
            if let Some(found) = e.downcast_ref::<ProxyError>() {
                return Some(found.clone());
            }
            current = e.source();
        }
        None
    }
}

/// Errors that stop the server from starting or running.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid backend: {0}")]
    Backend(#[source] ProxyError),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}
