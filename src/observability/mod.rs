//! Observability: structured logging and Prometheus metrics.
//!
//! - Logging with configurable formats (pretty, compact, JSON) and `RUST_LOG` overrides
//! - Prometheus counters and histograms for relay outcomes, quota settlement and stream lifecycles

pub mod metrics;
#[cfg(feature = "server")]
mod tracing_init;

#[cfg(feature = "server")]
pub use tracing_init::*;
