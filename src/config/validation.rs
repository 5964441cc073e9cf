//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds > 0, worker id within its bit budget)
//! - Detect duplicate rate-limit classes
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: PipelineConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{BreakerPolicyConfig, PipelineConfig};
use crate::id::snowflake::MAX_WORKER_ID;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Check every section, collecting all problems.
pub fn validate_config(config: &PipelineConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_body_bytes == 0 {
        errors.push(ValidationError::new("listener.max_body_bytes", "must be > 0"));
    }

    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be > 0"));
    }
    if config.timeouts.downstream_ms == 0 {
        errors.push(ValidationError::new("timeouts.downstream_ms", "must be > 0"));
    }

    if config.identifier.worker_id > MAX_WORKER_ID as u32 {
        errors.push(ValidationError::new(
            "identifier.worker_id",
            format!("{} exceeds maximum {}", config.identifier.worker_id, MAX_WORKER_ID),
        ));
    }

    validate_rate_limit(config, &mut errors);

    validate_breaker_policy(
        "circuit_breaker.default",
        &config.circuit_breaker.default,
        &mut errors,
    );
    for (name, policy) in &config.circuit_breaker.dependencies {
        let field = format!("circuit_breaker.dependencies.{name}");
        validate_breaker_policy(&field, policy, &mut errors);
    }

    let transform = &config.transform;
    if transform.max_decompressed_size == 0 {
        errors.push(ValidationError::new("transform.max_decompressed_size", "must be > 0"));
    }
    if transform.compression_level > 22 {
        errors.push(ValidationError::new("transform.compression_level", "must be <= 22"));
    }
    if !transform.cipher_suites.is_empty() && transform.master_key_env.trim().is_empty() {
        errors.push(ValidationError::new(
            "transform.master_key_env",
            "required when cipher suites are enabled",
        ));
    }

    let tasks = &config.tasks;
    if tasks.max_attempts == 0 {
        errors.push(ValidationError::new("tasks.max_attempts", "must be >= 1"));
    }
    if tasks.queue_bound == 0 {
        errors.push(ValidationError::new("tasks.queue_bound", "must be >= 1"));
    }
    if tasks.retention_policy.by_count() && tasks.keep_count == 0 {
        errors.push(ValidationError::new(
            "tasks.keep_count",
            "must be >= 1 when the retention policy counts records",
        ));
    }
    if tasks.workers == 0 {
        errors.push(ValidationError::new("tasks.workers", "must be >= 1"));
    }
    if tasks.backoff_base_ms > tasks.backoff_cap_ms {
        errors.push(ValidationError::new(
            "tasks.backoff_base_ms",
            "must not exceed tasks.backoff_cap_ms",
        ));
    }
    if tasks.cleanup_interval_ms == 0 {
        errors.push(ValidationError::new("tasks.cleanup_interval_ms", "must be > 0"));
    }
    if tasks.attempt_timeout_ms == Some(0) {
        errors.push(ValidationError::new("tasks.attempt_timeout_ms", "must be > 0 when set"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_rate_limit(config: &PipelineConfig, errors: &mut Vec<ValidationError>) {
    let limits = &config.rate_limit;

    check_bucket("rate_limit.default", limits.default.rate, limits.default.burst, errors);

    let mut names = HashSet::new();
    for (i, class) in limits.classes.iter().enumerate() {
        let field = format!("rate_limit.classes[{i}]");
        if !names.insert(class.name.as_str()) {
            errors.push(ValidationError::new(
                format!("{field}.name"),
                format!("duplicate class '{}'", class.name),
            ));
        }
        if class.name == "default" {
            errors.push(ValidationError::new(
                format!("{field}.name"),
                "'default' is reserved for the fallback class",
            ));
        }
        if let Some(prefix) = &class.path_prefix {
            if !prefix.starts_with('/') {
                errors.push(ValidationError::new(
                    format!("{field}.path_prefix"),
                    "must start with '/'",
                ));
            }
        }
        check_bucket(&field, class.rate, class.burst, errors);
    }

    if limits.idle_ttl_secs == 0 {
        errors.push(ValidationError::new("rate_limit.idle_ttl_secs", "must be > 0"));
    }
    if limits.sweep_interval_secs == 0 {
        errors.push(ValidationError::new("rate_limit.sweep_interval_secs", "must be > 0"));
    }
}

fn check_bucket(field: &str, rate: f64, burst: u32, errors: &mut Vec<ValidationError>) {
    if !rate.is_finite() || rate <= 0.0 {
        errors.push(ValidationError::new(format!("{field}.rate"), "must be a positive number"));
    }
    if burst == 0 {
        errors.push(ValidationError::new(format!("{field}.burst"), "must be >= 1"));
    }
}

fn validate_breaker_policy(
    field: &str,
    policy: &BreakerPolicyConfig,
    errors: &mut Vec<ValidationError>,
) {
    if policy.failure_threshold == 0 {
        errors.push(ValidationError::new(format!("{field}.failure_threshold"), "must be >= 1"));
    }
    if policy.window_ms == 0 {
        errors.push(ValidationError::new(format!("{field}.window_ms"), "must be > 0"));
    }
    if policy.half_open_trial_limit == 0 {
        errors.push(ValidationError::new(format!("{field}.half_open_trial_limit"), "must be >= 1"));
    }
    if policy.success_threshold == 0 {
        errors.push(ValidationError::new(format!("{field}.success_threshold"), "must be >= 1"));
    }
}
