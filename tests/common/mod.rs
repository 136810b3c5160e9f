//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, Query},
    http::{header, HeaderMap, Method, Uri},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use streaming_proxy::config::ProxyConfig;
use streaming_proxy::error::ServerError;
use streaming_proxy::http::HttpServer;
use streaming_proxy::lifecycle::Shutdown;
use streaming_proxy::pool::ConnectionPool;
use streaming_proxy::proxy::ExchangeTracker;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A proxy running on an ephemeral port.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub pool: Arc<ConnectionPool>,
    pub exchanges: ExchangeTracker,
    pub shutdown: Shutdown,
    pub handle: JoinHandle<Result<(), ServerError>>,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Wait until no backend connection is leased and no exchange is in flight.
    pub async fn settled(&self, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if self.pool.total_stats().in_use == 0 && self.exchanges.active_count() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

pub fn proxy_config(backend: SocketAddr) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.backend.url = format!("http://{}", backend);
    config.observability.metrics_enabled = false;
    config
}

pub async fn start_proxy(backend: SocketAddr) -> TestProxy {
    start_proxy_with(proxy_config(backend)).await
}

pub async fn start_proxy_with(config: ProxyConfig) -> TestProxy {
    let listener = TcpListener::bind(&config.listener.bind_address).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = HttpServer::new(config).unwrap();
    let pool = server.pool().clone();
    let exchanges = server.exchanges().clone();

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    let handle = tokio::spawn(async move { server.run(listener, server_shutdown).await });

    TestProxy {
        addr,
        pool,
        exchanges,
        shutdown,
        handle,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// Deterministic payload of `len` bytes.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// An axum backend with echo, header dump and streaming endpoints.
///
/// - `ANY /echo`: streams the request body back with the same content type
/// - `ANY /count`: replies with the number of body bytes received
/// - `ANY /headers`: replies with the request line and headers as text
/// - `GET /size/{n}`: streams `pattern(n)` in 64 KiB chunks
/// - `GET /slow?chunks=N&delay_ms=M`: emits `chunk i\n` after each delay
pub async fn start_echo_backend() -> SocketAddr {
    let app = Router::new()
        .route("/echo", any(echo))
        .route("/count", any(count))
        .route("/headers", any(dump_headers))
        .route("/size/{n}", get(sized))
        .route("/slow", get(slow));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn echo(headers: HeaderMap, body: Body) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| header::HeaderValue::from_static("application/octet-stream"));
    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::SERVER, "echo-backend")
        .header("x-backend", "echo")
        .header(header::SET_COOKIE, "a=1")
        .header(header::SET_COOKIE, "b=2")
        .body(Body::from_stream(body.into_data_stream()))
        .unwrap()
}

async fn count(body: Body) -> String {
    let mut total = 0usize;
    let mut data = body.into_data_stream();
    while let Some(chunk) = data.next().await {
        total += chunk.unwrap().len();
    }
    total.to_string()
}

async fn dump_headers(method: Method, uri: Uri, headers: HeaderMap) -> impl IntoResponse {
    let mut out = format!("{} {}\n", method, uri);
    for (name, value) in headers.iter() {
        out.push_str(&format!("{}: {}\n", name, value.to_str().unwrap_or("<binary>")));
    }
    (
        [(header::CONTENT_TYPE, "text/plain"), (header::SERVER, "echo-backend")],
        out,
    )
}

async fn sized(Path(n): Path<usize>) -> Response {
    let data = pattern(n);
    let chunks: Vec<Result<Bytes, std::io::Error>> = data
        .chunks(64 * 1024)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from_stream(stream::iter(chunks)))
        .unwrap()
}

async fn slow(Query(params): Query<HashMap<String, u64>>) -> Response {
    let chunks = params.get("chunks").copied().unwrap_or(5);
    let delay = Duration::from_millis(params.get("delay_ms").copied().unwrap_or(100));
    let body = stream::unfold(0u64, move |i| async move {
        if i == chunks {
            return None;
        }
        tokio::time::sleep(delay).await;
        Some((Ok::<_, std::io::Error>(Bytes::from(format!("chunk {}\n", i))), i + 1))
    });
    Response::builder()
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from_stream(body))
        .unwrap()
}

/// Expected body of `/slow?chunks=n`.
pub fn slow_body(chunks: u64) -> String {
    (0..chunks).map(|i| format!("chunk {}\n", i)).collect()
}

/// A raw backend that declares `declared` bytes, sends `sent`, then closes.
pub async fn start_short_body_backend(declared: usize, sent: usize) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\n\r\n",
                    declared
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&pattern(sent)).await;
                let _ = socket.flush().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// A backend that accepts connections and never answers.
pub async fn start_silent_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

/// A backend that answers `200 ok` as soon as it has the request head, then
/// reads whatever body follows without answering again.
pub async fn start_early_response_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 4096];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let reply = b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok";
                if socket.write_all(reply).await.is_err() {
                    return;
                }
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// A request body fed from the returned sender; it ends when the sender drops.
pub fn channel_body() -> (
    tokio::sync::mpsc::Sender<Result<Bytes, std::io::Error>>,
    reqwest::Body,
) {
    let (tx, rx) = tokio::sync::mpsc::channel(4);
    let chunks = stream::unfold(rx, |mut rx: tokio::sync::mpsc::Receiver<Result<Bytes, std::io::Error>>| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    (tx, reqwest::Body::wrap_stream(chunks))
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
