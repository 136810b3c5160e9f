//! Exclusive lease on a pooled backend connection.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};
use hyper::body::Incoming;
use tokio::sync::OwnedSemaphorePermit;

use crate::error::{ProxyError, ProxyResult};
use crate::pool::{Connection, ConnectionPool, PoolKey};

/// A RAII guard owning one backend connection for the duration of an exchange.
///
/// `release` hands the connection back to the pool. Dropping the lease any
/// other way discards the connection, since its state is unknown.
pub struct Lease {
    pool: Arc<ConnectionPool>,
    key: PoolKey,
    conn: Option<Connection>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Lease {
    pub(crate) fn new(
        pool: Arc<ConnectionPool>,
        key: PoolKey,
        conn: Connection,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            pool,
            key,
            conn: Some(conn),
            permit: Some(permit),
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Send a request on the leased connection and wait for response headers.
    pub async fn send(&mut self, request: Request<Body>) -> ProxyResult<Response<Incoming>> {
        let key = &self.key;
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| ProxyError::BackendUnavailable(format!("lease on {} already ended", key)))?;

        conn.sender
            .ready()
            .await
            .map_err(|e| ProxyError::BackendUnavailable(format!("{}: {}", key, e)))?;

        conn.sender.send_request(request).await.map_err(|e| {
            // A failing request body surfaces here wrapped in a hyper error.
            ProxyError::find_in(&e)
                .unwrap_or_else(|| ProxyError::BackendUnavailable(format!("{}: {}", key, e)))
        })
    }

    /// Return the connection to the pool.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(&self.key, conn);
        }
        self.finish();
    }

    /// Close the connection instead of pooling it.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::debug!(backend = %self.key, "Discarding backend connection");
            conn.close();
        }
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(permit) = self.permit.take() {
            drop(permit);
            self.pool.publish_stats();
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::debug!(backend = %self.key, "Lease dropped mid-exchange, discarding connection");
            conn.close();
        }
        self.finish();
    }
}
