//! Request pipeline subsystem.
//!
//! # Data Flow
//! ```text
//! PipelineRequest (from transport)
//!     → assign Identifier
//!     → RateLimiter::check (reject: RateLimited + retry hint)
//!     → TransformStage::negotiate + decode (reject: TransformError[kind])
//!     → Handler::handle with HandlerContext
//!           ├─ call_downstream → CircuitBreakers (reject: CircuitOpen)
//!           └─ enqueue → TaskEngine (reject: TaskRejectedOverload)
//!     → TransformStage::encode
//!     → PipelineResponse { outcome, status, body, codings, task ids }
//! ```
//!
//! # Design Decisions
//! - `process` is the single place stage errors become caller-visible outcomes
//! - Rejection bodies are plaintext JSON; only handler output is encoded
//! - The per-request TransformContext (and its key) lives only inside `process`

pub mod handler;
pub mod orchestrator;
pub mod request;
pub mod response;

pub use handler::{Handler, HandlerContext, HandlerError, HandlerResponse};
pub use orchestrator::{Pipeline, PipelineError};
pub use request::{DecodedRequest, PipelineRequest};
pub use response::{Outcome, PipelineResponse};
