//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the pipeline.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::id::snowflake::DEFAULT_EPOCH_MS;
use crate::transform::CipherSuite;

/// Root configuration for the request pipeline.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    /// Listener configuration for the HTTP adapter.
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Identifier generator settings.
    pub identifier: IdentifierConfig,

    /// Rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Circuit breaker policies.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Payload transform settings.
    pub transform: TransformConfig,

    /// Background task engine settings.
    pub tasks: TaskConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Largest request body accepted from the transport, in bytes.
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Whole-request timeout in seconds.
    pub request_secs: u64,

    /// Deadline for each downstream call made through a circuit breaker.
    pub downstream_ms: u64,
}

impl TimeoutConfig {
    pub fn downstream(&self) -> Duration {
        Duration::from_millis(self.downstream_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 30,
            downstream_ms: 5_000,
        }
    }
}

/// Identifier generator configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentifierConfig {
    /// Worker id embedded in every identifier (0..=1023).
    pub worker_id: u32,

    /// Custom epoch, milliseconds since the Unix epoch.
    pub epoch_ms: u64,
}

impl Default for IdentifierConfig {
    fn default() -> Self {
        Self {
            worker_id: 0,
            epoch_ms: DEFAULT_EPOCH_MS,
        }
    }
}

/// Which request attributes form a rate-limit bucket key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum KeyStrategy {
    /// One bucket per client identity.
    #[default]
    Client,
    /// One bucket per route.
    Route,
    /// One bucket per (client, route) pair.
    ClientRoute,
    /// A single bucket shared by everyone in the class.
    Global,
}

/// What happens to requests that match no configured class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Fallback {
    /// Apply `rate_limit.default`.
    #[default]
    Default,
    /// Do not limit.
    Unlimited,
}

/// Token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct BucketPolicyConfig {
    /// Refill rate in tokens per second.
    pub rate: f64,

    /// Bucket capacity (burst size).
    pub burst: u32,
}

impl Default for BucketPolicyConfig {
    fn default() -> Self {
        Self {
            rate: 100.0,
            burst: 50,
        }
    }
}

/// A named key class with its own bucket policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateClassConfig {
    /// Class name used in metrics and logs.
    pub name: String,

    /// Path prefix to match (longest prefix wins).
    #[serde(default)]
    pub path_prefix: Option<String>,

    /// HTTP method to match (case-insensitive). Any method when absent.
    #[serde(default)]
    pub method: Option<String>,

    /// Refill rate in tokens per second.
    pub rate: f64,

    /// Bucket capacity.
    pub burst: u32,
}

impl RateClassConfig {
    pub fn policy(&self) -> BucketPolicyConfig {
        BucketPolicyConfig {
            rate: self.rate,
            burst: self.burst,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// How bucket keys are derived from a request.
    pub strategy: KeyStrategy,

    /// Policy for requests matching no class.
    pub fallback: Fallback,

    /// Bucket parameters used by the default class.
    pub default: BucketPolicyConfig,

    /// Configured key classes.
    pub classes: Vec<RateClassConfig>,

    /// Buckets idle for this long (and full again) may be evicted.
    pub idle_ttl_secs: u64,

    /// How often the idle sweeper runs.
    pub sweep_interval_secs: u64,
}

impl RateLimitConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: KeyStrategy::Client,
            fallback: Fallback::Default,
            default: BucketPolicyConfig::default(),
            classes: Vec::new(),
            idle_ttl_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

/// Circuit breaker parameters for one dependency.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerPolicyConfig {
    /// Consecutive failures (within `window_ms`) that open the circuit.
    pub failure_threshold: u32,

    /// Rolling window for counting failures, in milliseconds.
    pub window_ms: u64,

    /// Cool-down before an open circuit admits trial calls.
    pub open_duration_ms: u64,

    /// Maximum concurrent trial calls while half-open.
    pub half_open_trial_limit: u32,

    /// Trial successes needed to close the circuit.
    pub success_threshold: u32,
}

impl BreakerPolicyConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }
}

impl Default for BreakerPolicyConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 60_000,
            open_duration_ms: 30_000,
            half_open_trial_limit: 1,
            success_threshold: 2,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaking.
    pub enabled: bool,

    /// Policy for dependencies without their own entry.
    pub default: BreakerPolicyConfig,

    /// Per-dependency overrides.
    pub dependencies: HashMap<String, BreakerPolicyConfig>,
}

impl CircuitBreakerConfig {
    pub fn policy_for(&self, dependency: &str) -> &BreakerPolicyConfig {
        self.dependencies.get(dependency).unwrap_or(&self.default)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default: BreakerPolicyConfig::default(),
            dependencies: HashMap::new(),
        }
    }
}

/// Payload transform configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Cipher suites a client may negotiate. Empty disables encryption.
    pub cipher_suites: Vec<CipherSuite>,

    /// Environment variable holding the base64 master key.
    pub master_key_env: String,

    /// Hard ceiling on decompressed request bodies, in bytes.
    pub max_decompressed_size: usize,

    /// Maximum output/input ratio for decompression (0 disables the ratio check).
    pub max_expansion_ratio: u32,

    /// Responses smaller than this are never compressed.
    pub compression_threshold: usize,

    /// Compression level (gzip/deflate 0-9, zstd 1-22).
    pub compression_level: u32,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            cipher_suites: Vec::new(),
            master_key_env: "PIPELINE_MASTER_KEY".to_string(),
            max_decompressed_size: 8 * 1024 * 1024,
            max_expansion_ratio: 100,
            compression_threshold: 1024,
            compression_level: 6,
        }
    }
}

/// Which limits the retention sweep applies to finished task records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionPolicy {
    /// Drop records older than `retention_ms`.
    Age,
    /// Keep at most `keep_count` records, dropping the oldest first.
    Count,
    /// Both limits.
    #[default]
    CountAndAge,
}

impl RetentionPolicy {
    pub fn by_age(&self) -> bool {
        matches!(self, RetentionPolicy::Age | RetentionPolicy::CountAndAge)
    }

    pub fn by_count(&self) -> bool {
        matches!(self, RetentionPolicy::Count | RetentionPolicy::CountAndAge)
    }
}

/// Background task engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Default attempt budget per task.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub backoff_base_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub backoff_cap_ms: u64,

    /// Maximum number of queued (not yet started) tasks.
    pub queue_bound: usize,

    /// How long terminal task records are kept, in milliseconds.
    pub retention_ms: u64,

    /// Most terminal task records kept at once.
    pub keep_count: usize,

    /// Which of the two retention limits apply.
    pub retention_policy: RetentionPolicy,

    /// Maximum number of tasks running at once.
    pub workers: usize,

    /// Interval of the retention sweep, in milliseconds.
    pub cleanup_interval_ms: u64,

    /// Optional per-attempt timeout in milliseconds.
    pub attempt_timeout_ms: Option<u64>,
}

impl TaskConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 100,
            backoff_cap_ms: 10_000,
            queue_bound: 1024,
            retention_ms: 5 * 60 * 1000,
            keep_count: 10_000,
            retention_policy: RetentionPolicy::CountAndAge,
            workers: 16,
            cleanup_interval_ms: 500,
            attempt_timeout_ms: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
