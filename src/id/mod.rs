//! Identifier generation subsystem.
//!
//! # Data Flow
//! ```text
//! Pipeline::process / TaskEngine::enqueue
//!     → snowflake.rs (SnowflakeGenerator::next)
//!     → Identifier (copied into logs, response headers, task records)
//! ```
//!
//! # Design Decisions
//! - One generator per process, shared via Arc
//! - Worker id validated at construction; a bad id is a startup error
//! - Ordering is per generator; uniqueness across processes needs unique worker ids

pub mod snowflake;

pub use snowflake::{IdError, Identifier, SnowflakeGenerator};
