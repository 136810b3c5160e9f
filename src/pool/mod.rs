//! Backend connection pool.
//!
//! # Responsibilities
//! - Keep idle HTTP/1.1 connections per backend authority
//! - Bound leased connections per authority
//! - Hand out leases that return or discard the connection
//!
//! # Design Decisions
//! - One bucket per authority; bucket access goes through a `DashMap` shard lock
//!   that is never held across an `.await`
//! - A semaphore per bucket bounds connections in use; callers wait for a permit
//! - Connections are only reused after a fully relayed exchange

pub mod lease;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use dashmap::DashMap;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::PoolConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::observability::metrics;

pub use lease::Lease;

/// Identifies a backend authority: scheme, host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    scheme: String,
    host: String,
    port: u16,
}

impl PoolKey {
    pub fn new(scheme: &str, host: &str, port: u16) -> Self {
        Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

/// Snapshot of a bucket (or the whole pool).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
}

/// An established backend connection.
pub(crate) struct Connection {
    sender: SendRequest<Body>,
    task: JoinHandle<()>,
}

impl Connection {
    fn is_open(&self) -> bool {
        !self.sender.is_closed() && !self.task.is_finished()
    }

    /// Tear the connection down.
    pub(crate) fn close(self) {
        self.task.abort();
    }
}

struct IdleConnection {
    conn: Connection,
    since: Instant,
}

struct Bucket {
    idle: Vec<IdleConnection>,
    permits: Arc<Semaphore>,
    max_connections: usize,
}

impl Bucket {
    fn new(max_connections: usize) -> Self {
        Self {
            idle: Vec::new(),
            permits: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.len(),
            in_use: self.max_connections - self.permits.available_permits(),
        }
    }
}

/// Shared pool of backend connections, one bucket per authority.
pub struct ConnectionPool {
    buckets: DashMap<PoolKey, Bucket>,
    config: PoolConfig,
    connect_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, connect_timeout: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
            connect_timeout,
        }
    }

    /// Lease a connection to `key`, reusing an idle one when possible.
    ///
    /// Waits while the bucket is at its connection limit.
    pub async fn acquire(self: &Arc<Self>, key: &PoolKey) -> ProxyResult<Lease> {
        let permits = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| Bucket::new(self.config.max_connections_per_authority))
            .permits
            .clone();

        let permit = permits
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::BackendUnavailable("connection pool closed".to_string()))?;

        while let Some(mut conn) = self.checkout_idle(key) {
            match conn.sender.ready().await {
                Ok(()) => {
                    tracing::trace!(backend = %key, "Reusing pooled connection");
                    self.publish_stats();
                    return Ok(Lease::new(self.clone(), key.clone(), conn, permit));
                }
                Err(e) => {
                    tracing::debug!(backend = %key, error = %e, "Pooled connection went stale");
                    conn.close();
                }
            }
        }

        let conn = self.connect(key).await?;
        self.publish_stats();
        Ok(Lease::new(self.clone(), key.clone(), conn, permit))
    }

    fn checkout_idle(&self, key: &PoolKey) -> Option<Connection> {
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs);
        let mut bucket = self.buckets.get_mut(key)?;
        while let Some(idle) = bucket.idle.pop() {
            if idle.conn.is_open() && idle.since.elapsed() < idle_timeout {
                return Some(idle.conn);
            }
            idle.conn.close();
        }
        None
    }

    async fn connect(&self, key: &PoolKey) -> ProxyResult<Connection> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((key.host(), key.port())),
        )
        .await
        .map_err(|_| ProxyError::BackendTimeout(self.connect_timeout))?
        .map_err(|e| ProxyError::BackendUnavailable(format!("connect to {}: {}", key, e)))?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(backend = %key, error = %e, "Failed to set TCP_NODELAY");
        }

        let (sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ProxyError::BackendUnavailable(format!("handshake with {}: {}", key, e)))?;

        let backend = key.to_string();
        let task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(backend = %backend, error = %e, "Backend connection closed with error");
            }
        });

        tracing::debug!(backend = %key, "Opened backend connection");
        Ok(Connection { sender, task })
    }

    /// Return a connection after a fully relayed exchange.
    pub(crate) fn check_in(&self, key: &PoolKey, conn: Connection) {
        if !conn.is_open() {
            conn.close();
            return;
        }
        let Some(mut bucket) = self.buckets.get_mut(key) else {
            conn.close();
            return;
        };
        if bucket.idle.len() >= self.config.max_idle_per_authority {
            drop(bucket);
            conn.close();
            return;
        }
        bucket.idle.push(IdleConnection {
            conn,
            since: Instant::now(),
        });
    }

    /// Stats for a single authority.
    pub fn stats(&self, key: &PoolKey) -> PoolStats {
        self.buckets.get(key).map(|b| b.stats()).unwrap_or_default()
    }

    /// Aggregate stats across all authorities.
    pub fn total_stats(&self) -> PoolStats {
        self.buckets.iter().fold(PoolStats::default(), |acc, bucket| {
            let s = bucket.stats();
            PoolStats {
                idle: acc.idle + s.idle,
                in_use: acc.in_use + s.in_use,
            }
        })
    }

    /// Close every idle connection. Leased connections are unaffected.
    pub fn clear(&self) {
        for mut bucket in self.buckets.iter_mut() {
            for idle in bucket.idle.drain(..) {
                idle.conn.close();
            }
        }
        self.publish_stats();
    }

    pub(crate) fn publish_stats(&self) {
        metrics::record_pool(self.total_stats());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    /// Accepts connections and keeps them open without ever answering.
    async fn silent_backend() -> SocketAddr {
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

    fn pool(max: usize) -> Arc<ConnectionPool> {
        let config = PoolConfig {
            max_connections_per_authority: max,
            max_idle_per_authority: max,
            idle_timeout_secs: 60,
        };
        Arc::new(ConnectionPool::new(config, Duration::from_secs(2)))
    }

    #[test]
    fn pool_key_display() {
        assert_eq!(PoolKey::new("HTTP", "Example.COM", 80).to_string(), "http://example.com:80");
        assert_eq!(PoolKey::new("http", "::1", 8080).to_string(), "http://[::1]:8080");
    }

    #[tokio::test]
    async fn released_connection_is_reused() {
        let addr = silent_backend().await;
        let key = PoolKey::new("http", "127.0.0.1", addr.port());
        let pool = pool(4);

        let lease = pool.acquire(&key).await.unwrap();
        assert_eq!(pool.stats(&key), PoolStats { idle: 0, in_use: 1 });

        lease.release();
        assert_eq!(pool.stats(&key), PoolStats { idle: 1, in_use: 0 });

        let lease = pool.acquire(&key).await.unwrap();
        assert_eq!(pool.stats(&key), PoolStats { idle: 0, in_use: 1 });

        lease.discard();
        assert_eq!(pool.stats(&key), PoolStats { idle: 0, in_use: 0 });
    }

    #[tokio::test]
    async fn dropped_lease_is_discarded() {
        let addr = silent_backend().await;
        let key = PoolKey::new("http", "127.0.0.1", addr.port());
        let pool = pool(4);

        let lease = pool.acquire(&key).await.unwrap();
        drop(lease);
        assert_eq!(pool.stats(&key), PoolStats::default());
    }

    #[tokio::test]
    async fn acquire_waits_at_connection_limit() {
        let addr = silent_backend().await;
        let key = PoolKey::new("http", "127.0.0.1", addr.port());
        let pool = pool(1);

        let first = pool.acquire(&key).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(100), pool.acquire(&key)).await;
        assert!(blocked.is_err(), "second lease must wait for the first");

        first.release();
        let second = tokio::time::timeout(Duration::from_secs(1), pool.acquire(&key))
            .await
            .expect("lease after release")
            .unwrap();
        assert_eq!(pool.stats(&key).in_use, 1);
        drop(second);
    }

    #[tokio::test]
    async fn refused_connection_is_backend_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let key = PoolKey::new("http", "127.0.0.1", port);
        let pool = pool(2);
        match pool.acquire(&key).await {
            Err(ProxyError::BackendUnavailable(_)) => {}
            other => panic!("expected backend unavailable, got {:?}", other.map(|_| ())),
        }
        assert_eq!(pool.stats(&key).in_use, 0);
    }

    #[tokio::test]
    async fn clear_closes_idle_connections() {
        let addr = silent_backend().await;
        let key = PoolKey::new("http", "127.0.0.1", addr.port());
        let pool = pool(2);

        let a = pool.acquire(&key).await.unwrap();
        let b = pool.acquire(&key).await.unwrap();
        a.release();
        b.release();
        assert_eq!(pool.total_stats().idle, 2);

        pool.clear();
        assert_eq!(pool.total_stats(), PoolStats::default());
    }
}
