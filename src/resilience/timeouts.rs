//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap downstream calls with a deadline
//! - Cancel the in-flight future when the deadline passes
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Timeout errors are distinct from the call's own errors

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// The wrapped call did not finish in time.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("call timed out after {0:?}")]
pub struct Elapsed(pub Duration);

/// Run `call` with a deadline. The future is dropped when the deadline
/// passes, which cancels any work it was awaiting.
pub async fn with_timeout<F, T>(limit: Duration, call: F) -> Result<T, Elapsed>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| Elapsed(limit))
}
