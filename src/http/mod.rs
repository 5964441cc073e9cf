//! HTTP transport adapter.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum router, tracing + timeout layers, bounded body read)
//!     → PipelineRequest { method, path, client, headers, body }
//!     → Pipeline::process
//!     → PipelineResponse → HTTP response (x-request-id, content-encoding,
//!       x-cipher-suite, retry-after, x-pipeline-overload)
//!
//! /tasks/{id}:
//!     GET → TaskEngine::status     DELETE → TaskEngine::cancel
//! ```

pub mod server;

pub use server::{into_http, AppState, HttpServer};
