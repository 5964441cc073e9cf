//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events with request_id / task_id fields)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (tracing-subscriber fmt layer)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Every request runs inside a `request` span carrying its Identifier
//! - Metric names live in one place (`metrics.rs`); call sites use the
//!   `record_*` helpers and never spell a name
//! - Without an installed recorder the `metrics` macros are no-ops, so tests
//!   and embedders pay nothing

pub mod logging;
pub mod metrics;
