//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define pipeline metrics (outcomes, latency, limiter and breaker activity)
//! - Expose Prometheus-compatible metrics endpoint
//! - Track per-dependency and per-class metrics
//!
//! # Metrics
//! - `pipeline_requests_total` (counter): requests by outcome
//! - `pipeline_request_duration_seconds` (histogram): end-to-end latency
//! - `pipeline_rate_limited_total` (counter): rejections by key class
//! - `pipeline_breaker_transitions_total` (counter): state changes by dependency
//! - `pipeline_breaker_rejections_total` (counter): fast-fails by dependency
//! - `pipeline_transform_errors_total` (counter): transform failures by kind
//! - `pipeline_tasks_total` (counter): tasks reaching a state
//! - `pipeline_task_queue_depth` (gauge): tasks waiting for a worker
//!
//! # Design Decisions
//! - Recording without an installed recorder is a no-op, so library users
//!   and tests pay nothing
//! - Labels are bounded sets (outcome, class, dependency, state)

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

pub const REQUESTS_TOTAL: &str = "pipeline_requests_total";
pub const REQUEST_DURATION: &str = "pipeline_request_duration_seconds";
pub const RATE_LIMITED_TOTAL: &str = "pipeline_rate_limited_total";
pub const BREAKER_TRANSITIONS_TOTAL: &str = "pipeline_breaker_transitions_total";
pub const BREAKER_REJECTIONS_TOTAL: &str = "pipeline_breaker_rejections_total";
pub const TRANSFORM_ERRORS_TOTAL: &str = "pipeline_transform_errors_total";
pub const TASKS_TOTAL: &str = "pipeline_tasks_total";
pub const TASK_QUEUE_DEPTH: &str = "pipeline_task_queue_depth";

/// Install the Prometheus recorder with an HTTP scrape listener on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            describe_counter!(REQUESTS_TOTAL, "Requests processed, by outcome");
            describe_histogram!(REQUEST_DURATION, "End-to-end request latency in seconds");
            describe_counter!(RATE_LIMITED_TOTAL, "Requests rejected by the rate limiter");
            describe_counter!(BREAKER_TRANSITIONS_TOTAL, "Circuit breaker state transitions");
            describe_counter!(BREAKER_REJECTIONS_TOTAL, "Calls rejected by an open breaker");
            describe_counter!(TRANSFORM_ERRORS_TOTAL, "Payload transform failures");
            describe_counter!(TASKS_TOTAL, "Background tasks reaching a state");
            describe_gauge!(TASK_QUEUE_DEPTH, "Background tasks waiting for a worker");
            tracing::info!(address = %addr, "Metrics endpoint listening");
        }
        Err(e) => {
            tracing::error!(error = %e, address = %addr, "Failed to install metrics exporter");
        }
    }
}

pub fn record_request(outcome: &str, start: Instant) {
    counter!(REQUESTS_TOTAL, "outcome" => outcome.to_string()).increment(1);
    histogram!(REQUEST_DURATION).record(start.elapsed().as_secs_f64());
}

pub fn record_rate_limited(class: &str) {
    counter!(RATE_LIMITED_TOTAL, "class" => class.to_string()).increment(1);
}

pub fn record_breaker_transition(dependency: &str, to: &str) {
    counter!(
        BREAKER_TRANSITIONS_TOTAL,
        "dependency" => dependency.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

pub fn record_breaker_rejection(dependency: &str) {
    counter!(BREAKER_REJECTIONS_TOTAL, "dependency" => dependency.to_string()).increment(1);
}

pub fn record_transform_error(kind: &str) {
    counter!(TRANSFORM_ERRORS_TOTAL, "kind" => kind.to_string()).increment(1);
}

pub fn record_task_state(state: &str) {
    counter!(TASKS_TOTAL, "state" => state.to_string()).increment(1);
}

pub fn set_task_queue_depth(depth: usize) {
    gauge!(TASK_QUEUE_DEPTH).set(depth as f64);
}
