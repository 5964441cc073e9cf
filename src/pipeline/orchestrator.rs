//! The request pipeline: one entry point composing every stage.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::clock::{self, SharedClock};
use crate::config::validation::{validate_config, ValidationError};
use crate::config::PipelineConfig;
use crate::id::{IdError, Identifier, SnowflakeGenerator};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::pipeline::handler::{Handler, HandlerContext};
use crate::pipeline::request::{DecodedRequest, PipelineRequest};
use crate::pipeline::response::{transform_status, Outcome, PipelineResponse};
use crate::resilience::CircuitBreakers;
use crate::security::rate_limit::{Decision, RateLimiter};
use crate::tasks::TaskEngine;
use crate::transform::{KeyProvider, TransformError, TransformStage};

/// Startup failures. None of these can happen per request.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {}", join(.0))]
    Config(Vec<ValidationError>),

    #[error(transparent)]
    Identifier(#[from] IdError),

    #[error(transparent)]
    Transform(#[from] TransformError),
}

fn join(errors: &[ValidationError]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(", ")
}

pub struct Pipeline {
    ids: Arc<SnowflakeGenerator>,
    limiter: Arc<RateLimiter>,
    breakers: CircuitBreakers,
    transform: TransformStage,
    tasks: TaskEngine,
    handler: Arc<dyn Handler>,
    downstream_timeout: Duration,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("limiter", &self.limiter)
            .field("breakers", &self.breakers)
            .field("transform", &self.transform)
            .field("tasks", &self.tasks)
            .finish()
    }
}

impl Pipeline {
    /// Build every stage, failing fast on misconfiguration.
    pub fn new(
        config: &PipelineConfig,
        handler: Arc<dyn Handler>,
        clock: SharedClock,
        keys: Option<Arc<dyn KeyProvider>>,
    ) -> Result<Self, PipelineError> {
        validate_config(config).map_err(PipelineError::Config)?;

        let ids = Arc::new(SnowflakeGenerator::new(
            config.identifier.worker_id,
            config.identifier.epoch_ms,
            clock.clone(),
        )?);
        let transform = TransformStage::new(&config.transform, keys)?;

        tracing::info!(
            worker_id = config.identifier.worker_id,
            rate_classes = config.rate_limit.classes.len(),
            cipher_suites = config.transform.cipher_suites.len(),
            task_workers = config.tasks.workers,
            "Pipeline initialized"
        );

        Ok(Self {
            limiter: Arc::new(RateLimiter::new(&config.rate_limit, clock.clone())),
            breakers: CircuitBreakers::new(config.circuit_breaker.clone(), clock.clone()),
            tasks: TaskEngine::new(&config.tasks, ids.clone(), clock),
            ids,
            transform,
            handler,
            downstream_timeout: config.timeouts.downstream(),
        })
    }

    /// System clock, master key from the environment when encryption is on.
    pub fn from_config(
        config: &PipelineConfig,
        handler: Arc<dyn Handler>,
    ) -> Result<Self, PipelineError> {
        let keys: Option<Arc<dyn KeyProvider>> = if config.transform.cipher_suites.is_empty() {
            None
        } else {
            Some(Arc::new(crate::transform::MasterKey::from_env(
                &config.transform.master_key_env,
            )?))
        };
        Self::new(config, handler, clock::system(), keys)
    }

    /// Spawn background loops: limiter sweeper, task dispatcher and cleanup.
    pub fn start(&self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let mut handles = self.tasks.start(shutdown);
        handles.push(tokio::spawn(self.limiter.clone().run_sweeper(shutdown.subscribe())));
        handles
    }

    /// Swap limiter and breaker policies. Identifier, transform and task
    /// settings only take effect on restart.
    pub fn apply_config(&self, config: &PipelineConfig) {
        self.limiter.update_config(&config.rate_limit);
        self.breakers.update_config(config.circuit_breaker.clone());
        tracing::info!("Pipeline policies reloaded");
    }

    pub fn tasks(&self) -> &TaskEngine {
        &self.tasks
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Run one request through every stage. Never fails: each stage error
    /// becomes an [`Outcome`].
    pub async fn process(&self, request: PipelineRequest) -> PipelineResponse {
        let start = Instant::now();
        let id = self.ids.next();
        let span = tracing::info_span!(
            "request",
            request_id = %id,
            method = %request.method,
            path = %request.path,
        );

        let response = self.run(id, request).instrument(span).await;

        metrics::record_request(response.outcome.label(), start);
        tracing::debug!(
            request_id = %id,
            outcome = response.outcome.label(),
            status = response.status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Request processed"
        );
        response
    }

    async fn run(&self, id: Identifier, request: PipelineRequest) -> PipelineResponse {
        let key = self
            .limiter
            .key_for(request.method.as_str(), &request.path, &request.client);
        if let Some(key) = key {
            let retry_after = match self.limiter.check(&key) {
                Decision::Allow => None,
                Decision::RetryAfter(wait) => Some(Some(wait)),
                Decision::Deny => Some(None),
            };
            if let Some(retry_after) = retry_after {
                tracing::debug!(key = %key, "Request rate limited");
                return PipelineResponse::rejected(
                    id,
                    Outcome::RateLimited { retry_after },
                    StatusCode::TOO_MANY_REQUESTS,
                );
            }
        }

        let mut ctx = match self.transform.negotiate(&request.headers, id) {
            Ok(ctx) => ctx,
            Err(e) => return self.transform_failure(id, e),
        };
        let body = match self.transform.decode(&request.body, &ctx) {
            Ok(body) => body,
            Err(e) => return self.transform_failure(id, e),
        };

        let handler_ctx = HandlerContext::new(
            id,
            self.breakers.clone(),
            self.tasks.clone(),
            self.downstream_timeout,
        );
        let decoded = DecodedRequest {
            id,
            method: request.method,
            path: request.path,
            client: request.client,
            headers: request.headers,
            body,
        };

        let reply = match self.handler.handle(decoded, &handler_ctx).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(request_id = %id, error = %e, "Handler failed");
                return PipelineResponse::rejected(id, Outcome::from(&e), e.status())
                    .with_tasks(handler_ctx.take_enqueued());
            }
        };

        match self.transform.encode(&reply.body, &mut ctx) {
            Ok(encoded) => PipelineResponse::success(
                id,
                reply.status,
                reply.headers,
                encoded,
                handler_ctx.take_enqueued(),
            ),
            Err(e) => self.transform_failure(id, e).with_tasks(handler_ctx.take_enqueued()),
        }
    }

    fn transform_failure(&self, id: Identifier, err: TransformError) -> PipelineResponse {
        tracing::warn!(request_id = %id, kind = err.kind(), error = %err, "Transform failed");
        metrics::record_transform_error(err.kind());
        PipelineResponse::rejected(id, Outcome::from(&err), transform_status(&err))
    }
}
