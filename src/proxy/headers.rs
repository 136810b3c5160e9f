//! Header filtering between the client and backend legs.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers in both directions
//! - Strip framing headers the outbound layer regenerates
//! - Optionally add X-Forwarded-* headers (off by default)
//!
//! # Design Decisions
//! - Filtering rebuilds the map instead of removing in place. Values of one
//!   name keep their order and duplicates are appended, never merged.
//! - `HeaderMap` groups values by name, so interleaving across different names
//!   (`a`, `b`, `a`) is not kept. Receivers must not depend on it anyway.

use std::net::SocketAddr;

use axum::http::{
    header::{self, HeaderName, HeaderValue},
    HeaderMap,
};

use crate::proxy::Direction;

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Headers meaningful only on a single transport connection.
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    KEEP_ALIVE,
    PROXY_CONNECTION,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
];

/// Produce the header set to forward for `direction`.
pub fn filter_headers(headers: &HeaderMap, direction: Direction) -> HeaderMap {
    let nominated = connection_nominated(headers);
    let mut forwarded = HeaderMap::with_capacity(headers.len());

    for (name, value) in headers {
        if is_hop_by_hop(name) || nominated.contains(name) || is_regenerated(name, direction) {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }

    forwarded
}

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name)
}

/// Headers the outbound framing layer produces itself.
fn is_regenerated(name: &HeaderName, direction: Direction) -> bool {
    match direction {
        Direction::Request => name == header::CONTENT_LENGTH,
        Direction::Response => {
            name == header::CONTENT_LENGTH || name == header::DATE || name == header::SERVER
        }
    }
}

/// Header names listed in `Connection`, which are hop-by-hop as well.
fn connection_nominated(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect()
}

/// Declared `Content-Length`, if present and well-formed.
pub fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Append X-Forwarded-For/Host/Proto describing the client leg.
pub fn append_forwarded(
    headers: &mut HeaderMap,
    client: Option<SocketAddr>,
    original_host: Option<HeaderValue>,
    proto: &'static str,
) {
    if let Some(client) = client {
        let ip = client.ip().to_string();
        let chained = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{}, {}", existing, ip),
            None => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&chained) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
}
