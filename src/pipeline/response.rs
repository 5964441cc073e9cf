//! Typed request outcomes and the response the orchestrator returns.

use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use serde::Serialize;

use crate::id::Identifier;
use crate::pipeline::handler::HandlerError;
use crate::transform::{CipherSuite, EncodedBody, Encoding, TransformError};

/// How a request ended. Every stage failure maps to exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RateLimited { retry_after: Option<Duration> },
    CircuitOpen { dependency: String, retry_after: Option<Duration> },
    TransformError { kind: &'static str },
    HandlerError { message: String },
    TaskRejectedOverload,
}

impl Outcome {
    /// Stable label for metrics and rejection bodies.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::RateLimited { .. } => "rate_limited",
            Outcome::CircuitOpen { .. } => "circuit_open",
            Outcome::TransformError { .. } => "transform_error",
            Outcome::HandlerError { .. } => "handler_error",
            Outcome::TaskRejectedOverload => "task_rejected_overload",
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Outcome::RateLimited { retry_after } | Outcome::CircuitOpen { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        }
    }

    /// True for rejections caused by load or dependency health, which a
    /// client should back off from.
    pub fn is_overload(&self) -> bool {
        matches!(
            self,
            Outcome::RateLimited { .. }
                | Outcome::CircuitOpen { .. }
                | Outcome::TaskRejectedOverload
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl From<&TransformError> for Outcome {
    fn from(err: &TransformError) -> Self {
        Outcome::TransformError { kind: err.kind() }
    }
}

impl From<&HandlerError> for Outcome {
    fn from(err: &HandlerError) -> Self {
        match err {
            HandlerError::CircuitOpen(rejected) => Outcome::CircuitOpen {
                dependency: rejected.dependency.clone(),
                retry_after: rejected.retry_after,
            },
            HandlerError::Overloaded { .. } => Outcome::TaskRejectedOverload,
            other => Outcome::HandlerError {
                message: other.to_string(),
            },
        }
    }
}

/// HTTP status for a transform failure.
pub fn transform_status(err: &TransformError) -> StatusCode {
    match err {
        TransformError::AuthFailure
        | TransformError::MalformedPayload(_)
        | TransformError::KeyProvisioning(_) => StatusCode::BAD_REQUEST,
        TransformError::DecompressionLimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        TransformError::UnsupportedAlgorithm(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        TransformError::NonceExhausted | TransformError::Codec(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[derive(Debug, Serialize)]
struct RejectionBody<'a> {
    error: &'static str,
    request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dependency: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

/// Result of [`Pipeline::process`](crate::pipeline::Pipeline::process).
#[derive(Debug, Clone)]
pub struct PipelineResponse {
    pub request_id: Identifier,
    pub outcome: Outcome,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Content coding applied to `body`.
    pub encoding: Encoding,
    /// Suite `body` is sealed with, if any.
    pub cipher: Option<CipherSuite>,
    /// Tasks the handler enqueued for this request.
    pub tasks: Vec<Identifier>,
}

impl PipelineResponse {
    pub(crate) fn success(
        request_id: Identifier,
        status: StatusCode,
        headers: HeaderMap,
        encoded: EncodedBody,
        tasks: Vec<Identifier>,
    ) -> Self {
        Self {
            request_id,
            outcome: Outcome::Success,
            status,
            headers,
            body: encoded.bytes,
            encoding: encoded.encoding,
            cipher: encoded.cipher,
            tasks,
        }
    }

    /// A rejection with a plaintext JSON body describing it.
    pub(crate) fn rejected(request_id: Identifier, outcome: Outcome, status: StatusCode) -> Self {
        let (kind, dependency, message) = match &outcome {
            Outcome::TransformError { kind } => (Some(*kind), None, None),
            Outcome::CircuitOpen { dependency, .. } => (None, Some(dependency.as_str()), None),
            Outcome::HandlerError { message } => (None, None, Some(message.as_str())),
            _ => (None, None, None),
        };
        let body = RejectionBody {
            error: outcome.label(),
            request_id: request_id.to_string(),
            kind,
            retry_after_ms: outcome.retry_after().map(|d| d.as_millis() as u64),
            dependency,
            message,
        };
        let body = serde_json::to_vec(&body).unwrap_or_default();

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        Self {
            request_id,
            outcome,
            status,
            headers,
            body,
            encoding: Encoding::Identity,
            cipher: None,
            tasks: Vec::new(),
        }
    }

    pub(crate) fn with_tasks(mut self, tasks: Vec<Identifier>) -> Self {
        self.tasks = tasks;
        self
    }

    /// Parse a rejection body back into JSON.
    pub fn rejection(&self) -> Option<serde_json::Value> {
        if self.outcome.is_success() {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }
}
