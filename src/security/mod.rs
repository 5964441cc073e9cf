//! Admission control.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → RateLimiter::key_for (strategy: client / route / client-route / global)
//!     → PolicyTable::classify (longest path prefix, optional method)
//!     → TokenBucket::try_acquire
//!     → Allow | RetryAfter(wait) | Deny
//! ```
//!
//! # Design Decisions
//! - One bucket per key in a DashMap; contention stays per shard
//! - Policies are swapped atomically on reload; existing buckets keep their tokens
//! - Idle buckets are only evicted once they have refilled to capacity
//!   (dropping them then is indistinguishable from keeping them)

pub mod rate_limit;

pub use rate_limit::{Decision, RateLimitKey, RateLimiter};
