//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): requests by method, status
//! - `proxy_request_duration_seconds` (histogram): time to response headers
//! - `proxy_stream_failures_total` (counter): failed exchanges by error kind
//! - `proxy_bytes_relayed_total` (counter): body bytes by direction
//! - `proxy_pool_connections` (gauge): backend connections by state (idle, in_use)

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::pool::PoolStats;
use crate::proxy::Direction;

/// Install the Prometheus recorder with its HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    counter!(
        "proxy_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("proxy_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_failure(kind: &'static str) {
    counter!("proxy_stream_failures_total", "kind" => kind).increment(1);
}

pub fn record_bytes(direction: Direction, bytes: u64) {
    counter!("proxy_bytes_relayed_total", "direction" => direction.as_str()).increment(bytes);
}

pub fn record_pool(stats: PoolStats) {
    gauge!("proxy_pool_connections", "state" => "idle").set(stats.idle as f64);
    gauge!("proxy_pool_connections", "state" => "in_use").set(stats.in_use as f64);
}
