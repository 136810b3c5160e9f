//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, tracing)
//!     → proxy::Dispatcher (transpose, lease, forward, relay)
//!     → Send to client
//! ```

pub mod server;

pub use server::{AppState, HttpServer};
