//! Stream adapter between HTTP bodies and lazy chunk sequences.
//!
//! # Responsibilities
//! - Pull body frames one at a time and yield their data chunks
//! - Count relayed bytes and enforce a declared `Content-Length`
//! - Turn a chunk sequence back into a body without buffering
//!
//! # Design Decisions
//! - Single pass: after end-of-stream or an error the sequence stays finished
//! - Trailers frames are dropped; only data frames make up the byte sequence
//! - A read error is never reported as end-of-stream
//! - The outcome can be watched from elsewhere, so the other leg of an
//!   exchange knows whether this body ended cleanly, failed, or is still going

use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body as AxumBody;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http_body::Body;
use tokio::sync::watch;

use crate::error::ProxyError;
use crate::observability::metrics;
use crate::proxy::Direction;

/// How a relayed body ended, as seen by its [`BodyWatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyOutcome {
    Pending,
    Finished,
    Failed,
}

/// Observes the outcome of a [`ChunkStream`] that is consumed elsewhere.
#[derive(Debug, Clone)]
pub struct BodyWatch(watch::Receiver<BodyOutcome>);

impl BodyWatch {
    /// A watch for a body that carries nothing.
    pub fn finished() -> Self {
        let (_tx, rx) = watch::channel(BodyOutcome::Finished);
        Self(rx)
    }

    pub fn outcome(&self) -> BodyOutcome {
        *self.0.borrow()
    }

    /// Wait until the body has finished or failed.
    pub async fn settled(mut self) -> BodyOutcome {
        loop {
            let outcome = *self.0.borrow_and_update();
            if outcome != BodyOutcome::Pending {
                return outcome;
            }
            if self.0.changed().await.is_err() {
                return BodyOutcome::Failed;
            }
        }
    }
}

/// A pull-based, single-pass sequence of body chunks.
pub struct ChunkStream<B> {
    body: Pin<Box<B>>,
    direction: Direction,
    declared: Option<u64>,
    received: u64,
    finished: bool,
    outcome: Option<watch::Sender<BodyOutcome>>,
}

impl<B> ChunkStream<B> {
    fn settle(&mut self, outcome: BodyOutcome) {
        self.finished = true;
        if let Some(tx) = self.outcome.take() {
            tx.send_replace(outcome);
        }
    }
}

impl<B> Drop for ChunkStream<B> {
    fn drop(&mut self) {
        // Abandoned before the end.
        self.settle(BodyOutcome::Failed);
    }
}

impl<B> ChunkStream<B>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    pub fn new(body: B, direction: Direction) -> Self {
        Self {
            body: Box::pin(body),
            direction,
            declared: None,
            received: 0,
            finished: false,
            outcome: None,
        }
    }

    /// Start reporting this sequence's outcome to the returned watch.
    pub fn watch(&mut self) -> BodyWatch {
        let initial = if self.finished {
            BodyOutcome::Failed
        } else {
            BodyOutcome::Pending
        };
        let (tx, rx) = watch::channel(initial);
        if !self.finished {
            self.outcome = Some(tx);
        }
        BodyWatch(rx)
    }

    /// Enforce that the sequence carries exactly `declared` bytes.
    pub fn with_declared_length(mut self, declared: Option<u64>) -> Self {
        self.declared = declared;
        self
    }

    /// Produce the next chunk, `None` at end-of-stream.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, ProxyError>> {
        self.next().await
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn declared_length(&self) -> Option<u64> {
        self.declared
    }

    /// Bytes yielded so far.
    pub fn bytes_received(&self) -> u64 {
        self.received
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// True when the underlying body is known to carry nothing more.
    pub fn is_end_stream(&self) -> bool {
        self.finished || (self.received == 0 && self.declared.unwrap_or(0) == 0 && self.body.is_end_stream())
    }

    fn read_error(&self, err: B::Error) -> ProxyError {
        match self.declared {
            // The transport gave up before the declared length was reached.
            Some(declared) if self.received < declared => ProxyError::FramingMismatch {
                declared,
                received: self.received,
            },
            _ => ProxyError::StreamRead(format!("{} body: {}", self.direction, err)),
        }
    }
}

impl<B> ChunkStream<B>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Display,
{
    /// Wrap the sequence back into a body with unknown length (chunked framing).
    pub fn into_body(self) -> AxumBody {
        AxumBody::from_stream(self)
    }
}

impl<B> Stream for ChunkStream<B>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    type Item = Result<Bytes, ProxyError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.finished {
                return Poll::Ready(None);
            }

            match this.body.as_mut().poll_frame(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(frame))) => {
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    if data.is_empty() {
                        continue;
                    }
                    this.received += data.len() as u64;
                    if let Some(declared) = this.declared {
                        if this.received > declared {
                            this.settle(BodyOutcome::Failed);
                            return Poll::Ready(Some(Err(ProxyError::FramingMismatch {
                                declared,
                                received: this.received,
                            })));
                        }
                    }
                    metrics::record_bytes(this.direction, data.len() as u64);
                    return Poll::Ready(Some(Ok(data)));
                }
                Poll::Ready(Some(Err(err))) => {
                    let err = this.read_error(err);
                    this.settle(BodyOutcome::Failed);
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    if let Some(declared) = this.declared {
                        if this.received != declared {
                            this.settle(BodyOutcome::Failed);
                            return Poll::Ready(Some(Err(ProxyError::FramingMismatch {
                                declared,
                                received: this.received,
                            })));
                        }
                    }
                    this.settle(BodyOutcome::Finished);
                    return Poll::Ready(None);
                }
            }
        }
    }
}
