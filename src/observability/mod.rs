//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → stdout (pretty or JSON lines)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured fields on every event (backend, listener, connection id)
//! - Metrics are cheap (atomic increments), recorded even when no exporter runs
//! - Log level from config, overridable with `RUST_LOG`

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::init_metrics;
