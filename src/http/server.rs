//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the pipeline and task routes
//! - Wire up middleware (tracing, request timeout)
//! - Bound request bodies at `listener.max_body_bytes` (413 with a JSON body)
//! - Translate between HTTP and `PipelineRequest` / `PipelineResponse`
//! - Bind server to listener and stop on shutdown

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::PipelineConfig;
use crate::id::Identifier;
use crate::pipeline::{Pipeline, PipelineRequest, PipelineResponse};
use crate::tasks::{CancelOutcome, TaskError};
use crate::transform::negotiate::CIPHER_SUITE_HEADER;

pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_CLIENT_ID: &str = "x-client-id";
pub const X_PIPELINE_OVERLOAD: &str = "x-pipeline-overload";

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub max_body_bytes: usize,
}

/// HTTP front end for a [`Pipeline`].
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(pipeline: Arc<Pipeline>, config: &PipelineConfig) -> Self {
        let state = AppState {
            pipeline,
            max_body_bytes: config.listener.max_body_bytes,
        };
        Self {
            router: Self::build_router(config, state),
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &PipelineConfig, state: AppState) -> Router {
        Router::new()
            .route("/tasks/{id}", get(task_status).delete(cancel_task))
            .route("/{*path}", any(pipeline_handler))
            .route("/", any(pipeline_handler))
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs))),
            )
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve until `shutdown` resolves.
    pub async fn run<S>(self, listener: TcpListener, shutdown: S) -> Result<(), std::io::Error>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Hand every non-task request to the pipeline.
async fn pipeline_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();

    let client = parts
        .headers
        .get(X_CLIENT_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    let body = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(path = %parts.uri.path(), error = %e, "Request body rejected");
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({ "error": "body_too_large", "limit": state.max_body_bytes })),
            )
                .into_response();
        }
    };

    let request = PipelineRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        client,
        headers: parts.headers,
        body,
    };

    into_http(state.pipeline.process(request).await)
}

/// Render a pipeline response, adding the headers that describe it.
pub fn into_http(response: PipelineResponse) -> Response {
    let mut builder = Response::builder().status(response.status);

    if let Some(headers) = builder.headers_mut() {
        headers.extend(response.headers);
        if let Ok(value) = HeaderValue::from_str(&response.request_id.to_string()) {
            headers.insert(X_REQUEST_ID, value);
        }
        if !response.encoding.is_identity() {
            headers.insert(
                header::CONTENT_ENCODING,
                HeaderValue::from_static(response.encoding.as_str()),
            );
            headers.insert(header::VARY, HeaderValue::from_static("accept-encoding"));
        }
        if let Some(suite) = response.cipher {
            headers.insert(CIPHER_SUITE_HEADER, HeaderValue::from_static(suite.as_str()));
        }
        if let Some(wait) = response.outcome.retry_after() {
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        if response.outcome.is_overload() {
            headers.insert(X_PIPELINE_OVERLOAD, HeaderValue::from_static("true"));
        }
    }

    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn parse_task_id(raw: &str) -> Result<Identifier, Response> {
    raw.parse::<Identifier>().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_task_id", "id": raw })),
        )
            .into_response()
    })
}

fn task_not_found(id: Identifier) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "task_not_found", "id": id.to_string() })),
    )
        .into_response()
}

async fn task_status(State(state): State<AppState>, Path(raw): Path<String>) -> Response {
    let id = match parse_task_id(&raw) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.pipeline.tasks().status(id) {
        Ok(status) => Json(status).into_response(),
        Err(_) => task_not_found(id),
    }
}

async fn cancel_task(State(state): State<AppState>, Path(raw): Path<String>) -> Response {
    let id = match parse_task_id(&raw) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.pipeline.tasks().cancel(id) {
        Ok(outcome) => {
            let (label, status) = match outcome {
                CancelOutcome::Cancelled => ("cancelled", StatusCode::OK),
                CancelOutcome::Signalled => ("signalled", StatusCode::ACCEPTED),
                CancelOutcome::AlreadyFinished(_) => ("already_finished", StatusCode::CONFLICT),
            };
            let state = state.pipeline.tasks().state(id);
            let body = json!({ "id": id.to_string(), "outcome": label, "state": state });
            (status, Json(body)).into_response()
        }
        Err(TaskError::NotFound(_)) => task_not_found(id),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}
