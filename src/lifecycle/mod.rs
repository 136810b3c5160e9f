//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → stop accepting, refuse new exchanges (draining)
//!             → wait up to the grace period for in-flight exchanges
//!             → cancel whatever is left → close idle backend connections
//! ```
//!
//! # Design Decisions
//! - Shutdown has a deadline: in-flight streams are cancelled after the grace period
//! - Draining and cancellation are level-triggered (`watch`), so late
//!   subscribers still observe them

pub mod shutdown;
pub mod signals;

pub use shutdown::{DrainController, DrainWatch, Shutdown};
pub use signals::wait_for_signal;
