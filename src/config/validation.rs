//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, pool limits consistent)
//! - Check addresses and the backend URL parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Pure function: ProxyConfig → Result<(), Vec<ValidationError>>

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ProxyConfig;
use crate::proxy::Upstream;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field}: `{value}` is not a socket address")]
    InvalidAddress { field: &'static str, value: String },

    #[error("backend.url: {0}")]
    InvalidBackendUrl(String),

    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),

    #[error("pool.max_idle_per_authority ({idle}) exceeds pool.max_connections_per_authority ({max})")]
    IdleExceedsMax { idle: usize, max: usize },

    #[error("observability.log_level: unknown level `{0}`")]
    InvalidLogLevel(String),
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Check a configuration, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "listener.bind_address",
            value: config.listener.bind_address.clone(),
        });
    }

    if let Err(e) = Upstream::parse(&config.backend.url) {
        errors.push(ValidationError::InvalidBackendUrl(e.to_string()));
    }

    if config.pool.max_connections_per_authority == 0 {
        errors.push(ValidationError::MustBePositive("pool.max_connections_per_authority"));
    }
    if config.pool.max_idle_per_authority > config.pool.max_connections_per_authority {
        errors.push(ValidationError::IdleExceedsMax {
            idle: config.pool.max_idle_per_authority,
            max: config.pool.max_connections_per_authority,
        });
    }
    if config.timeouts.connect_secs == 0 {
        errors.push(ValidationError::MustBePositive("timeouts.connect_secs"));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::MustBePositive("timeouts.request_secs"));
    }

    if !LOG_LEVELS.contains(&config.observability.log_level.to_ascii_lowercase().as_str()) {
        errors.push(ValidationError::InvalidLogLevel(config.observability.log_level.clone()));
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
