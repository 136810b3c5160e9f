//! Response transposition: backend response → client response.
//!
//! # Responsibilities
//! - Copy the backend status verbatim
//! - Filter response headers (Date, Server and framing are regenerated)
//! - Wrap the backend body as a chunk stream with its declared length enforced

use std::fmt::Display;

use axum::http::{header, HeaderMap, HeaderValue, Method, Response, StatusCode};
use bytes::Bytes;
use http_body::Body;

use crate::proxy::headers::{declared_length, filter_headers};
use crate::proxy::stream::ChunkStream;
use crate::proxy::Direction;

const OCTET_STREAM: HeaderValue = HeaderValue::from_static("application/octet-stream");

/// The response to relay to the client.
pub struct OutboundResponse<B> {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Media type of the streamed body. Defaults to `application/octet-stream`
    /// when the backend sent none; this is never injected as a header.
    pub media_type: HeaderValue,
    pub body: ChunkStream<B>,
}

/// Build the client response from the backend's.
///
/// `request_method` decides whether the backend body may carry a payload at all.
pub fn transpose_response<B>(backend: Response<B>, request_method: &Method) -> OutboundResponse<B>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    let (parts, body) = backend.into_parts();

    let media_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or(OCTET_STREAM);

    let declared = if carries_payload(request_method, parts.status) {
        declared_length(&parts.headers)
    } else {
        None
    };

    OutboundResponse {
        status: parts.status,
        headers: filter_headers(&parts.headers, Direction::Response),
        media_type,
        body: ChunkStream::new(body, Direction::Response).with_declared_length(declared),
    }
}

/// HEAD responses and 1xx/204/304 never have a body, whatever Content-Length says.
fn carries_payload(method: &Method, status: StatusCode) -> bool {
    !(method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}
