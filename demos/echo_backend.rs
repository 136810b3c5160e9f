//! Demo backend for trying the proxy by hand.
//!
//! ```text
//! cargo run --example echo_backend
//! cargo run -- --backend http://127.0.0.1:44777
//! curl 'http://127.0.0.1:8080/hello-world?name=Rust'
//! curl -T big.iso -H 'content-type: application/octet-stream' http://127.0.0.1:8080/upload
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::Body,
    extract::Query,
    http::{header, HeaderMap},
    response::IntoResponse,
    routing::{any, get, post},
    Router,
};
use bytes::Bytes;
use futures_util::{stream, StreamExt};

async fn hello_world(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    let name = params.get("name").map(String::as_str).unwrap_or("World");
    ([(header::CONTENT_TYPE, "text/plain")], format!("Hello, {}!", name))
}

/// Counts the uploaded bytes without storing them.
async fn upload(body: Body) -> impl IntoResponse {
    let mut total = 0u64;
    let mut data = body.into_data_stream();
    while let Some(chunk) = data.next().await {
        match chunk {
            Ok(bytes) => total += bytes.len() as u64,
            Err(e) => return format!("upload aborted after {} bytes: {}", total, e),
        }
    }
    format!("received {} bytes", total)
}

/// Streams the request body straight back.
async fn echo(headers: HeaderMap, body: Body) -> impl IntoResponse {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| header::HeaderValue::from_static("application/octet-stream"));
    (
        [(header::CONTENT_TYPE, content_type)],
        Body::from_stream(body.into_data_stream()),
    )
}

/// Ten lines, one every 200ms.
async fn ticker() -> impl IntoResponse {
    let ticks = stream::unfold(0u32, |n| async move {
        if n == 10 {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        Some((Ok::<_, std::io::Error>(Bytes::from(format!("tick {}\n", n))), n + 1))
    });
    ([(header::CONTENT_TYPE, "text/plain")], Body::from_stream(ticks))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let app = Router::new()
        .route("/hello-world", get(hello_world))
        .route("/upload", post(upload))
        .route("/echo", any(echo))
        .route("/ticker", get(ticker));

    let addr = SocketAddr::from(([127, 0, 0, 1], 44777));
    println!("Echo backend listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
