//! The proxy request handler.
//!
//! # Responsibilities
//! - Drive each exchange through its state machine
//! - Lease a backend connection, send, and wait for response headers
//! - Return the client response as soon as backend headers arrive
//! - Relay the backend body and settle the lease when it ends
//!
//! # Design Decisions
//! - Connect, send and header wait share one deadline (504 on expiry)
//! - Errors before headers become 5xx responses. Errors after headers make
//!   the body stream fail, which aborts the client connection; a half-sent
//!   response cannot be turned into an error response.
//! - The lease goes back to the pool only after both bodies end cleanly; any
//!   failure or early drop discards the connection. A backend may answer before
//!   it has read the whole upload, so a finished response alone does not free
//!   the connection, and the exchange stays in flight until the upload ends.
//! - No retries: a partially streamed request cannot be replayed without buffering
//! - Once shutdown cancels in-flight work, waiting exchanges fail with 503 and
//!   relaying ones abort their client connection

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, Request, Response},
    response::IntoResponse,
};
use bytes::Bytes;
use futures_util::Stream;
use hyper::body::Incoming;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::lifecycle::DrainWatch;
use crate::observability::metrics;
use crate::pool::{ConnectionPool, Lease, PoolKey};
use crate::proxy::exchange::{Exchange, ExchangeState, ExchangeTracker};
use crate::proxy::headers::append_forwarded;
use crate::proxy::request::transpose_request;
use crate::proxy::response::{transpose_response, OutboundResponse};
use crate::proxy::stream::{BodyOutcome, BodyWatch, ChunkStream};
use crate::proxy::upstream::ResolveUpstream;

/// Forwards inbound requests to the backend.
pub struct Dispatcher {
    upstream: Arc<dyn ResolveUpstream>,
    pool: Arc<ConnectionPool>,
    exchanges: ExchangeTracker,
    request_timeout: Duration,
    preserve_host: bool,
    forwarded_headers: bool,
    drain: DrainWatch,
}

impl Dispatcher {
    pub fn new(
        config: &ProxyConfig,
        upstream: Arc<dyn ResolveUpstream>,
        pool: Arc<ConnectionPool>,
        exchanges: ExchangeTracker,
        drain: DrainWatch,
    ) -> Self {
        Self {
            upstream,
            pool,
            exchanges,
            request_timeout: Duration::from_secs(config.timeouts.request_secs),
            preserve_host: config.backend.preserve_host,
            forwarded_headers: config.backend.forwarded_headers,
            drain,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn exchanges(&self) -> &ExchangeTracker {
        &self.exchanges
    }

    /// Handle one inbound request. Never fails: errors become responses or aborts.
    pub async fn dispatch(&self, request: Request<Body>) -> Response<Body> {
        let mut exchange = self.exchanges.track(request.method(), request.uri().path());
        let method = exchange.method().to_string();

        tracing::debug!(
            exchange_id = %exchange.id(),
            method = %method,
            path = %request.uri().path(),
            "Proxying request"
        );

        match self.forward(request, &mut exchange).await {
            Ok((lease, outbound, upload)) => {
                metrics::record_request(&method, outbound.status.as_u16(), exchange.started());
                exchange.advance(ExchangeState::StreamingResponse);
                relay_response(outbound, Settle {
                    lease,
                    exchange,
                    upload,
                    drain: self.drain.clone(),
                })
            }
            Err(err) => {
                metrics::record_request(&method, err.status_code().as_u16(), exchange.started());
                exchange.fail(&err);
                err.into_response()
            }
        }
    }

    /// RECEIVED → TRANSPOSED_REQUEST → AWAITING_BACKEND_HEADERS.
    async fn forward(
        &self,
        request: Request<Body>,
        exchange: &mut Exchange,
    ) -> ProxyResult<(Lease, OutboundResponse<Incoming>, BodyWatch)> {
        if self.drain.is_draining() {
            return Err(ProxyError::ShuttingDown);
        }

        let upstream = self.upstream.resolve(&request)?;
        let method = request.method().clone();
        let client = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        let original_host = request.headers().get(header::HOST).cloned();

        let mut outbound = transpose_request(request, &upstream)?;
        if self.forwarded_headers {
            append_forwarded(&mut outbound.headers, client, original_host, "http");
        }
        let upload = outbound.upload.clone();
        let wire = outbound.into_wire(&upstream, self.preserve_host)?;
        exchange.advance(ExchangeState::TransposedRequest);

        exchange.advance(ExchangeState::AwaitingBackendHeaders);
        let headers = tokio::time::timeout(self.request_timeout, self.send(upstream.key(), wire));
        let (lease, response) = tokio::select! {
            result = headers => result.map_err(|_| ProxyError::BackendTimeout(self.request_timeout))??,
            _ = self.drain.clone().cancelled() => return Err(ProxyError::ShuttingDown),
        };

        let outbound = transpose_response(response, &method);
        tracing::debug!(
            exchange_id = %exchange.id(),
            backend = %upstream.base_url(),
            status = outbound.status.as_u16(),
            media_type = ?outbound.media_type,
            declared_length = ?outbound.body.declared_length(),
            "Backend headers received"
        );
        Ok((lease, outbound, upload))
    }

    async fn send(&self, key: &PoolKey, request: Request<Body>) -> ProxyResult<(Lease, Response<Incoming>)> {
        let mut lease = self.pool.acquire(key).await?;
        // On error the lease is dropped here, discarding the connection.
        let response = lease.send(request).await?;
        Ok((lease, response))
    }
}

/// STREAMING_RESPONSE: hand the client a response whose body pulls from the backend.
fn relay_response(outbound: OutboundResponse<Incoming>, settle: Settle) -> Response<Body> {
    let OutboundResponse {
        status,
        headers,
        body,
        ..
    } = outbound;

    let body = if body.is_end_stream() {
        settle.response_finished(0);
        Body::empty()
    } else {
        Body::from_stream(Relay {
            stream: body,
            cancelled: Box::pin(settle.drain.clone().cancelled()),
            settle: Some(settle),
        })
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Everything an exchange holds until it reaches a terminal state.
struct Settle {
    lease: Lease,
    exchange: Exchange,
    upload: BodyWatch,
    drain: DrainWatch,
}

impl Settle {
    /// The response body ended cleanly; finish once the upload has too.
    fn response_finished(self, bytes: u64) {
        match self.upload.outcome() {
            BodyOutcome::Pending => {
                tracing::debug!(
                    exchange_id = %self.exchange.id(),
                    "Response relayed, request body still streaming"
                );
                tokio::spawn(async move {
                    let outcome = tokio::select! {
                        outcome = self.upload.clone().settled() => outcome,
                        _ = self.drain.clone().cancelled() => BodyOutcome::Pending,
                    };
                    self.finish(outcome, bytes);
                });
            }
            outcome => self.finish(outcome, bytes),
        }
    }

    /// STREAMING_RESPONSE → COMPLETE, or FAILED if the upload did not finish.
    fn finish(self, upload: BodyOutcome, bytes: u64) {
        let Settle {
            lease, mut exchange, ..
        } = self;
        match upload {
            BodyOutcome::Finished => {
                lease.release();
                exchange.complete(bytes);
            }
            BodyOutcome::Failed => {
                lease.discard();
                exchange.fail(&ProxyError::StreamRead(
                    "request body ended before it was fully sent".to_string(),
                ));
            }
            // Still going when shutdown cancelled it.
            BodyOutcome::Pending => {
                lease.discard();
                exchange.fail(&ProxyError::ShuttingDown);
            }
        }
    }

    /// STREAMING_RESPONSE → FAILED.
    fn fail(self, err: &ProxyError) {
        let Settle {
            lease, mut exchange, ..
        } = self;
        lease.discard();
        exchange.fail(err);
    }
}

/// Relays backend chunks to the client and settles the exchange at the end.
struct Relay<B> {
    stream: ChunkStream<B>,
    settle: Option<Settle>,
    cancelled: Pin<Box<dyn Future<Output = ()> + Send>>,
}

impl<B> Stream for Relay<B>
where
    B: http_body::Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    type Item = Result<Bytes, ProxyError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.settle.is_some() && this.cancelled.as_mut().poll(cx).is_ready() {
            let err = ProxyError::ShuttingDown;
            if let Some(settle) = this.settle.take() {
                settle.fail(&err);
            }
            return Poll::Ready(Some(Err(err)));
        }
        match Pin::new(&mut this.stream).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(err))) => {
                if let Some(settle) = this.settle.take() {
                    settle.fail(&err);
                }
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                if let Some(settle) = this.settle.take() {
                    settle.response_finished(this.stream.bytes_received());
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<B> Drop for Relay<B> {
    fn drop(&mut self) {
        // Dropped before the end: the client is gone and the backend read is abandoned.
        if let Some(settle) = self.settle.take() {
            settle.fail(&ProxyError::ClientDisconnected);
        }
    }
}
