//! Backend base URL handling.
//!
//! # Responsibilities
//! - Parse and validate the configured backend base URL
//! - Join the base with an inbound path+query
//! - Resolve the backend for each exchange (fixed or hot-reloadable)

use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    http::{HeaderValue, Request, Uri},
};
use url::Url;

use crate::config::BackendConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::pool::PoolKey;

/// A parsed backend base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// Base URL without a trailing slash, e.g. `http://127.0.0.1:44777/api`.
    base: String,
    /// Value for the `Host` header when the client's is not preserved.
    authority: String,
    key: PoolKey,
}

impl Upstream {
    /// Parse a base URL. Only plain `http` backends are supported.
    pub fn parse(raw: &str) -> ProxyResult<Self> {
        let url = Url::parse(raw).map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", raw, e)))?;

        if url.scheme() != "http" {
            return Err(ProxyError::InvalidTarget(format!(
                "{}: unsupported scheme `{}`",
                raw,
                url.scheme()
            )));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(ProxyError::InvalidTarget(format!(
                "{}: base URL must not carry a query or fragment",
                raw
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::InvalidTarget(format!("{}: missing host", raw)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ProxyError::InvalidTarget(format!("{}: missing port", raw)))?;

        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let base = format!(
            "{}://{}{}",
            url.scheme(),
            authority,
            url.path().trim_end_matches('/')
        );
        let key = PoolKey::new(
            url.scheme(),
            host.trim_start_matches('[').trim_end_matches(']'),
            port,
        );

        Ok(Self { base, authority, key })
    }

    /// Absolute URL: base followed by `path_and_query` verbatim.
    pub fn join(&self, path_and_query: &str) -> ProxyResult<Uri> {
        let joined = format!("{}{}", self.base, path_and_query);
        joined
            .parse()
            .map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", joined, e)))
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn host_header(&self) -> ProxyResult<HeaderValue> {
        HeaderValue::from_str(&self.authority)
            .map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", self.authority, e)))
    }
}

/// Picks the backend for an inbound request.
pub trait ResolveUpstream: Send + Sync {
    fn resolve(&self, request: &Request<Body>) -> ProxyResult<Arc<Upstream>>;
}

impl ResolveUpstream for Upstream {
    fn resolve(&self, _request: &Request<Body>) -> ProxyResult<Arc<Upstream>> {
        Ok(Arc::new(self.clone()))
    }
}

/// A backend that can be swapped atomically on config reload.
#[derive(Debug)]
pub struct ReloadableUpstream {
    current: ArcSwap<Upstream>,
}

impl ReloadableUpstream {
    pub fn new(upstream: Upstream) -> Self {
        Self {
            current: ArcSwap::from_pointee(upstream),
        }
    }

    pub fn from_config(config: &BackendConfig) -> ProxyResult<Self> {
        Ok(Self::new(Upstream::parse(&config.url)?))
    }

    pub fn current(&self) -> Arc<Upstream> {
        self.current.load_full()
    }

    /// Apply a reloaded backend section. In-flight exchanges keep their backend.
    pub fn reload(&self, config: &BackendConfig) -> ProxyResult<()> {
        let next = Upstream::parse(&config.url)?;
        if *self.current.load_full() == next {
            return Ok(());
        }
        tracing::info!(
            previous = %self.current.load().base_url(),
            next = %next.base_url(),
            "Backend URL reloaded"
        );
        self.current.store(Arc::new(next));
        Ok(())
    }
}

impl ResolveUpstream for ReloadableUpstream {
    fn resolve(&self, _request: &Request<Body>) -> ProxyResult<Arc<Upstream>> {
        Ok(self.current())
    }
}
