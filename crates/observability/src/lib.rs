//! Tracing, logging, metrics (shared setup).

/// Initialize process-wide tracing with the default settings.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&tracing::LogSettings::default());
}

/// Tracing configuration (filters, output format).
pub mod tracing;

/// Prometheus instruments and text exposition.
pub mod metrics;

pub use metrics::{IdempotencyCounters, Metrics};
pub use tracing::{LogFormat, LogSettings};
