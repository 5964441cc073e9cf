//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Downstream call from a handler:
//!     → circuit_breaker.rs (guard: permit or fail fast)
//!     → timeouts.rs (enforce the downstream deadline)
//!     → circuit_breaker.rs (report success/failure, drive state machine)
//!
//! Task retries:
//!     → backoff.rs (exponential delay with jitter, capped)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every downstream call has a deadline
//! - A timed-out call is a failure as far as the breaker is concerned
//! - Circuit breaker prevents cascading failures

pub mod backoff;
pub mod circuit_breaker;
pub mod timeouts;

pub use circuit_breaker::{
    BreakerState, CallOutcome, CircuitBreakers, DownstreamError, Permit, Rejected,
};
