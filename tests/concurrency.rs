//! Concurrent exchanges, client disconnects and graceful shutdown.

use std::time::{Duration, Instant};

use axum::http::StatusCode;
use bytes::Bytes;

mod common;

#[tokio::test]
async fn concurrent_exchanges_are_isolated() {
    let backend = common::start_echo_backend().await;
    let proxy = common::start_proxy(backend).await;
    let client = common::client();

    for n in [1usize, 10, 100] {
        let mut tasks = Vec::with_capacity(n);
        for i in 0..n {
            let client = client.clone();
            let url = proxy.url("/echo");
            tasks.push(tokio::spawn(async move {
                let payload = format!("client-{}-", i).repeat(2048).into_bytes();
                let res = client
                    .post(url)
                    .header("content-type", "application/octet-stream")
                    .body(payload.clone())
                    .send()
                    .await
                    .unwrap();
                assert_eq!(res.status(), StatusCode::OK);
                let body = res.bytes().await.unwrap();
                assert!(body.as_ref() == payload.as_slice(), "client {} got another body", i);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(proxy.settled(Duration::from_secs(2)).await, "leak after {} clients", n);
    }

    proxy.shutdown.trigger();
}

#[tokio::test]
async fn pool_limit_queues_excess_exchanges() {
    let backend = common::start_echo_backend().await;
    let mut config = common::proxy_config(backend);
    config.pool.max_connections_per_authority = 2;
    config.pool.max_idle_per_authority = 2;
    let proxy = common::start_proxy_with(config).await;
    let client = common::client();

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let client = client.clone();
        let url = proxy.url("/slow?chunks=2&delay_ms=100");
        tasks.push(tokio::spawn(async move {
            client.get(url).send().await.unwrap().text().await.unwrap()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), common::slow_body(2));
    }

    assert!(proxy.settled(Duration::from_secs(2)).await);
    assert!(proxy.pool.total_stats().idle <= 2);
    proxy.shutdown.trigger();
}

#[tokio::test]
async fn client_disconnect_releases_backend_connection() {
    let backend = common::start_echo_backend().await;
    let proxy = common::start_proxy(backend).await;

    let client = reqwest::Client::builder()
        .no_proxy()
        .pool_max_idle_per_host(0)
        .build()
        .unwrap();
    let mut res = client
        .get(proxy.url("/slow?chunks=100&delay_ms=100"))
        .send()
        .await
        .unwrap();
    let first = res.chunk().await.unwrap().unwrap();
    assert_eq!(first.as_ref(), b"chunk 0\n");
    assert_eq!(proxy.pool.total_stats().in_use, 1);

    drop(res);
    drop(client);

    assert!(
        proxy.settled(Duration::from_secs(5)).await,
        "backend connection still leased after client left"
    );
    assert_eq!(proxy.pool.total_stats().idle, 0, "half-read connection must not be pooled");
    proxy.shutdown.trigger();
}

#[tokio::test]
async fn shutdown_drains_in_flight_and_refuses_new() {
    let backend = common::start_echo_backend().await;
    let mut config = common::proxy_config(backend);
    config.shutdown.grace_period_secs = 10;
    let proxy = common::start_proxy_with(config).await;

    let res = common::client()
        .get(proxy.url("/slow?chunks=5&delay_ms=200"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    proxy.shutdown.trigger();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let refused = common::client().get(proxy.url("/headers")).send().await;
    assert!(refused.is_err(), "new connections must be refused while draining");

    assert_eq!(res.text().await.unwrap(), common::slow_body(5));

    let result = tokio::time::timeout(Duration::from_secs(5), proxy.handle)
        .await
        .expect("server did not stop after draining")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn shutdown_cancels_streams_after_grace_period() {
    let backend = common::start_echo_backend().await;
    let mut config = common::proxy_config(backend);
    config.shutdown.grace_period_secs = 1;
    let proxy = common::start_proxy_with(config).await;

    let res = common::client()
        .get(proxy.url("/slow?chunks=100&delay_ms=100"))
        .send()
        .await
        .unwrap();

    proxy.shutdown.trigger();

    let body = tokio::time::timeout(Duration::from_secs(5), res.bytes())
        .await
        .expect("stream was not cancelled");
    assert!(body.is_err(), "a cancelled stream must not look complete");

    let result = tokio::time::timeout(Duration::from_secs(5), proxy.handle)
        .await
        .expect("server did not stop after the grace period")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(proxy.pool.total_stats().in_use, 0);
}

#[tokio::test]
async fn early_response_holds_connection_until_upload_finishes() {
    let backend = common::start_early_response_backend().await;
    let mut config = common::proxy_config(backend);
    config.timeouts.request_secs = 2;
    let proxy = common::start_proxy_with(config).await;
    let client = common::client();

    let (tx, body) = common::channel_body();
    tx.send(Ok(Bytes::from_static(b"first"))).await.unwrap();
    let upload = {
        let client = client.clone();
        let url = proxy.url("/upload");
        tokio::spawn(async move {
            let res = client
                .post(url)
                .header("content-type", "application/octet-stream")
                .body(body)
                .send()
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::OK);
            assert_eq!(res.bytes().await.unwrap().as_ref(), b"ok");
        })
    };

    // The backend has answered, but the upload is still streaming.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let stats = proxy.pool.total_stats();
    assert_eq!(stats.idle, 0, "busy connection was returned to the pool");
    assert_eq!(stats.in_use, 1);
    assert_eq!(proxy.exchanges.active_count(), 1, "upload no longer counted in flight");

    let started = Instant::now();
    let res = client.get(proxy.url("/other")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.bytes().await.unwrap().as_ref(), b"ok");
    assert!(started.elapsed() < Duration::from_secs(2));

    tx.send(Ok(Bytes::from_static(b"last"))).await.unwrap();
    drop(tx);
    upload.await.unwrap();
    assert!(proxy.settled(Duration::from_secs(2)).await);

    proxy.shutdown.trigger();
}
