//! Streaming proxy core.
//!
//! # Data Flow
//! ```text
//! inbound request
//!     → request.rs (method, URL join, header filter, chunked body)
//!     → pool (lease a backend connection)
//!     → backend response headers
//!     → response.rs (status, header filter, chunked body)
//!     → dispatcher.rs (relay body chunks to the client as they arrive)
//! ```
//!
//! # Design Decisions
//! - Bodies are never buffered; stream.rs relays one chunk at a time
//! - Errors before response headers become 5xx responses, errors after abort the connection
//! - The connection pool is the only state shared between exchanges

pub mod dispatcher;
pub mod exchange;
pub mod headers;
pub mod request;
pub mod response;
pub mod stream;
pub mod upstream;

pub use dispatcher::Dispatcher;
pub use exchange::{ExchangeState, ExchangeTracker};
pub use headers::filter_headers;
pub use request::{transpose_request, OutboundBody, OutboundRequest};
pub use response::{transpose_response, OutboundResponse};
pub use stream::{BodyOutcome, BodyWatch, ChunkStream};
pub use upstream::{ReloadableUpstream, ResolveUpstream, Upstream};

/// Which leg of an exchange a body or header set belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client → proxy → backend.
    Request,
    /// Backend → proxy → client.
    Response,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Request => "request",
            Direction::Response => "response",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
