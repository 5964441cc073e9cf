//! Application handler contract and the services handlers may use.

use std::fmt::Display;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::Serialize;
use thiserror::Error;

use crate::id::Identifier;
use crate::pipeline::request::DecodedRequest;
use crate::resilience::{CircuitBreakers, DownstreamError, Rejected};
use crate::tasks::{TaskEngine, TaskError, TaskSpec};

/// Application logic invoked once per admitted, decoded request.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(
        &self,
        request: DecodedRequest,
        ctx: &HandlerContext,
    ) -> Result<HandlerResponse, HandlerError>;
}

/// Plaintext response produced by a handler, before egress transforms.
#[derive(Debug, Clone)]
pub struct HandlerResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HandlerResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self, HandlerError> {
        let body = serde_json::to_vec(value)
            .map_err(|e| HandlerError::Internal(format!("serialize response: {e}")))?;
        let mut response = Self::ok(body);
        response.headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Ok(response)
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    CircuitOpen(#[from] Rejected),

    #[error("downstream {dependency} timed out after {after:?}")]
    DownstreamTimeout { dependency: String, after: Duration },

    #[error("downstream {dependency} failed: {message}")]
    Downstream { dependency: String, message: String },

    #[error("task queue full ({bound} pending)")]
    Overloaded { bound: usize },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl From<TaskError> for HandlerError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::RejectedOverload { bound } => HandlerError::Overloaded { bound },
            other => HandlerError::Internal(other.to_string()),
        }
    }
}

impl HandlerError {
    pub fn status(&self) -> StatusCode {
        match self {
            HandlerError::CircuitOpen(_) | HandlerError::Overloaded { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            HandlerError::DownstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            HandlerError::Downstream { .. } => StatusCode::BAD_GATEWAY,
            HandlerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HandlerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Per-request services: breaker-guarded downstream calls and task enqueue.
pub struct HandlerContext {
    request_id: Identifier,
    breakers: CircuitBreakers,
    tasks: TaskEngine,
    downstream_timeout: Duration,
    enqueued: Mutex<Vec<Identifier>>,
}

impl HandlerContext {
    pub fn new(
        request_id: Identifier,
        breakers: CircuitBreakers,
        tasks: TaskEngine,
        downstream_timeout: Duration,
    ) -> Self {
        Self {
            request_id,
            breakers,
            tasks,
            downstream_timeout,
            enqueued: Mutex::new(Vec::new()),
        }
    }

    pub fn request_id(&self) -> Identifier {
        self.request_id
    }

    /// Call `dependency` through its breaker with the configured downstream
    /// timeout. Timeouts and errors are reported to the breaker as failures.
    pub async fn call_downstream<F, T, E>(
        &self,
        dependency: &str,
        call: F,
    ) -> Result<T, HandlerError>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.breakers
            .call(dependency, self.downstream_timeout, call)
            .await
            .map_err(|e| match e {
                DownstreamError::Rejected(rejected) => HandlerError::CircuitOpen(rejected),
                DownstreamError::TimedOut(after) => HandlerError::DownstreamTimeout {
                    dependency: dependency.to_string(),
                    after,
                },
                DownstreamError::Failed(err) => HandlerError::Downstream {
                    dependency: dependency.to_string(),
                    message: err.to_string(),
                },
            })
    }

    /// Queue follow-up work tagged with this request's id.
    pub fn enqueue(&self, spec: TaskSpec) -> Result<Identifier, HandlerError> {
        let id = self.tasks.enqueue(spec.correlated_with(self.request_id))?;
        if let Ok(mut ids) = self.enqueued.lock() {
            ids.push(id);
        }
        Ok(id)
    }

    /// Direct access to the engine for status and cancellation.
    pub fn tasks(&self) -> &TaskEngine {
        &self.tasks
    }

    pub(crate) fn take_enqueued(&self) -> Vec<Identifier> {
        self.enqueued
            .lock()
            .map(|mut ids| std::mem::take(&mut *ids))
            .unwrap_or_default()
    }
}
