//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! dispatcher, pool, stream relay
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (pretty or JSON lines)
//!     → Prometheus scrape endpoint
//! ```
//!
//! # Design Decisions
//! - Every exchange carries an exchange ID in its log fields
//! - The x-request-id header is assigned at the edge and echoed back
//! - Metric updates are cheap; the recorder is a no-op until installed

pub mod logging;
pub mod metrics;
