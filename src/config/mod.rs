//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → PipelineConfig (validated, immutable)
//!     → sections handed to each subsystem at startup
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → Pipeline::apply_config swaps limiter and breaker policies
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Secrets (the transform master key) come from the environment, never the file

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use schema::{
    BreakerPolicyConfig, BucketPolicyConfig, CircuitBreakerConfig, Fallback, IdentifierConfig,
    KeyStrategy, ListenerConfig, ObservabilityConfig, PipelineConfig, RateClassConfig,
    RateLimitConfig, RetentionPolicy, TaskConfig, TimeoutConfig, TransformConfig,
};
