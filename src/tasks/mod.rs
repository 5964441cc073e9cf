//! Background task subsystem.
//!
//! # Data Flow
//! ```text
//! Handler
//!     → TaskEngine::enqueue (try_send into bounded queue; full = RejectedOverload)
//!     → dispatcher (waits for a worker permit, then pulls the next task)
//!     → worker (attempt → backoff → attempt ... → terminal state)
//!       or schedule driver (tick → worker permit → attempts → tick ...)
//!     → tracking table (status / subscribe / wait / cancel)
//!     → cleanup loop (drops terminal records by age and/or count)
//! ```
//!
//! # Design Decisions
//! - Work never runs on the request path; `enqueue` only records and queues
//! - Attempts of one task are strictly sequential
//! - Terminal states are final; the first one recorded wins
//! - A panic inside work ends the task as `Failed`; it never strands a record
//!   in `Running`

pub mod engine;
pub mod types;

pub use engine::TaskEngine;
pub use types::{
    CancelOutcome, Repeat, RetryPolicy, Schedule, TaskContext, TaskError, TaskFailure, TaskResult,
    TaskSpec, TaskState, TaskStatus, Trigger,
};
