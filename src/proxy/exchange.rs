//! Per-exchange state machine and in-flight tracking.
//!
//! # States
//! ```text
//! Received → TransposedRequest → AwaitingBackendHeaders → StreamingResponse → Complete
//!     any state → Failed
//! ```
//!
//! # Responsibilities
//! - Generate unique exchange IDs for tracing
//! - Log state transitions and outcomes
//! - Count in-flight exchanges so shutdown can drain them

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::Method;

use crate::error::ProxyError;
use crate::observability::metrics;

/// Relaxed ordering is enough; IDs only need to be unique.
static EXCHANGE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for one request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeId(u64);

impl ExchangeId {
    pub fn new() -> Self {
        Self(EXCHANGE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ExchangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ex-{}", self.0)
    }
}

/// Where an exchange is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Received,
    TransposedRequest,
    AwaitingBackendHeaders,
    StreamingResponse,
    Complete,
    Failed,
}

impl ExchangeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExchangeState::Complete | ExchangeState::Failed)
    }

    /// Whether response headers have already gone to the client.
    pub fn response_started(&self) -> bool {
        matches!(self, ExchangeState::StreamingResponse | ExchangeState::Complete)
    }
}

/// Counts in-flight exchanges.
#[derive(Debug, Clone, Default)]
pub struct ExchangeTracker {
    active: Arc<AtomicU64>,
}

impl ExchangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a new exchange. The count drops when the `Exchange` does.
    pub fn track(&self, method: &Method, path: &str) -> Exchange {
        self.active.fetch_add(1, Ordering::SeqCst);
        Exchange {
            id: ExchangeId::new(),
            state: ExchangeState::Received,
            method: method.clone(),
            path: path.to_string(),
            started: Instant::now(),
            active: Arc::clone(&self.active),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait until no exchange is in flight, or `timeout` elapses.
    ///
    /// Returns `true` if everything drained.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.active_count() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}

/// One tracked exchange.
#[derive(Debug)]
pub struct Exchange {
    id: ExchangeId,
    state: ExchangeState,
    method: Method,
    path: String,
    started: Instant,
    active: Arc<AtomicU64>,
}

impl Exchange {
    pub fn id(&self) -> ExchangeId {
        self.id
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn advance(&mut self, next: ExchangeState) {
        if self.state.is_terminal() {
            return;
        }
        tracing::trace!(exchange_id = %self.id, from = ?self.state, to = ?next, "Exchange transition");
        self.state = next;
    }

    /// Body fully relayed.
    pub fn complete(&mut self, bytes: u64) {
        if self.state.is_terminal() {
            return;
        }
        self.advance(ExchangeState::Complete);
        tracing::debug!(
            exchange_id = %self.id,
            method = %self.method,
            path = %self.path,
            bytes,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Exchange complete"
        );
    }

    pub fn fail(&mut self, err: &ProxyError) {
        if self.state.is_terminal() {
            return;
        }
        let started = self.state.response_started();
        self.advance(ExchangeState::Failed);
        metrics::record_failure(err.kind());

        match err {
            ProxyError::ClientDisconnected => tracing::info!(
                exchange_id = %self.id,
                method = %self.method,
                path = %self.path,
                "Client disconnected mid-stream, exchange cancelled"
            ),
            _ if started => tracing::error!(
                exchange_id = %self.id,
                method = %self.method,
                path = %self.path,
                error = %err,
                "Exchange failed after response started, aborting client connection"
            ),
            _ => tracing::warn!(
                exchange_id = %self.id,
                method = %self.method,
                path = %self.path,
                error = %err,
                status = err.status_code().as_u16(),
                "Exchange failed"
            ),
        }
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
