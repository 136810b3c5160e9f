//! Request transposition: inbound client request → backend request.
//!
//! # Responsibilities
//! - Join the backend base URL with the inbound path+query
//! - Filter request headers
//! - Wrap the inbound body as a chunked stream
//! - Produce the on-the-wire request for an HTTP/1.1 backend connection
//!
//! # Design Decisions
//! - The forwarded body is always chunked, even when the client declared a
//!   length: recomputing the length would mean buffering. The client's declared
//!   length is still enforced while relaying.
//! - No `Content-Type` means no body is forwarded

use axum::{
    body::Body,
    http::{
        header::{self, HeaderValue},
        uri::PathAndQuery,
        HeaderMap, Method, Request, Uri,
    },
};

use crate::error::{ProxyError, ProxyResult};
use crate::proxy::headers::{declared_length, filter_headers};
use crate::proxy::stream::{BodyWatch, ChunkStream};
use crate::proxy::upstream::Upstream;
use crate::proxy::Direction;

/// Body policy of a forwarded request.
pub enum OutboundBody {
    Empty,
    Chunked(ChunkStream<Body>),
}

impl std::fmt::Debug for OutboundBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutboundBody::Empty => f.write_str("Empty"),
            OutboundBody::Chunked(stream) => f
                .debug_struct("Chunked")
                .field("declared", &stream.declared_length())
                .finish(),
        }
    }
}

/// The request to send to the backend.
#[derive(Debug)]
pub struct OutboundRequest {
    pub method: Method,
    /// Absolute backend URL.
    pub url: Uri,
    pub headers: HeaderMap,
    pub body: OutboundBody,
    /// Reports when the forwarded body has been fully sent.
    pub upload: BodyWatch,
}

/// Build the backend request from an inbound one.
pub fn transpose_request(inbound: Request<Body>, upstream: &Upstream) -> ProxyResult<OutboundRequest> {
    let (parts, body) = inbound.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = upstream.join(path_and_query)?;

    let mut headers = filter_headers(&parts.headers, Direction::Request);

    let (body, upload) = if parts.headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        let mut stream = ChunkStream::new(body, Direction::Request)
            .with_declared_length(declared_length(&parts.headers));
        let upload = stream.watch();
        (OutboundBody::Chunked(stream), upload)
    } else {
        (OutboundBody::Empty, BodyWatch::finished())
    };

    Ok(OutboundRequest {
        method: parts.method,
        url,
        headers,
        body,
        upload,
    })
}

impl OutboundRequest {
    pub fn has_body(&self) -> bool {
        matches!(self.body, OutboundBody::Chunked(_))
    }

    /// Convert to an origin-form request for a backend connection.
    ///
    /// The client's `Host` is kept when `preserve_host` is set and one was sent;
    /// otherwise the backend authority is used.
    pub fn into_wire(self, upstream: &Upstream, preserve_host: bool) -> ProxyResult<Request<Body>> {
        let target = self
            .url
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        let mut headers = self.headers;
        if !(preserve_host && headers.contains_key(header::HOST)) {
            headers.insert(header::HOST, upstream.host_header()?);
        }

        let body = match self.body {
            OutboundBody::Empty => Body::empty(),
            OutboundBody::Chunked(stream) => stream.into_body(),
        };

        let mut request = Request::builder()
            .method(self.method)
            .uri(Uri::from(target))
            .body(body)
            .map_err(|e| ProxyError::InvalidTarget(e.to_string()))?;
        *request.headers_mut() = headers;
        Ok(request)
    }
}
