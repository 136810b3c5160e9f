//! Streaming HTTP reverse proxy library.

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod pool;
pub mod proxy;

pub use config::schema::ProxyConfig;
pub use error::{ProxyError, ProxyResult, ServerError};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
