//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (pretty or JSON lines)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Webhook tokens never appear in logs or metric labels; keys are
//!   rendered through their redacting `Display`
//! - Request ID flows through the HTTP layer into every request span
//! - Metric updates are no-ops until a recorder is installed, so tests
//!   need no setup

pub mod logging;
pub mod metrics;
