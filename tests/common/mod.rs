//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use request_pipeline::clock::{ManualClock, SharedClock};
use request_pipeline::config::PipelineConfig;
use request_pipeline::lifecycle::Shutdown;
use request_pipeline::pipeline::{
    DecodedRequest, Handler, HandlerContext, HandlerError, HandlerResponse, Pipeline,
    PipelineRequest,
};
use request_pipeline::tasks::{TaskFailure, TaskSpec};
use request_pipeline::transform::{CipherSuite, KeyProvider, MasterKey};
use request_pipeline::HttpServer;
use serde_json::json;
use tokio::net::TcpListener;

pub const MASTER_KEY: [u8; 32] = [7u8; 32];

/// Routes:
/// - `/downstream/fail` calls "billing" and fails
/// - `/downstream/ok` calls "billing" and succeeds
/// - `POST /jobs` queues a task that runs until cancelled
/// - anything else echoes the body
pub struct TestHandler;

#[async_trait]
impl Handler for TestHandler {
    async fn handle(
        &self,
        request: DecodedRequest,
        ctx: &HandlerContext,
    ) -> Result<HandlerResponse, HandlerError> {
        match (request.method.clone(), request.path.as_str()) {
            (_, "/downstream/fail") => {
                ctx.call_downstream("billing", async { Err::<(), _>("connection refused") })
                    .await?;
                Ok(HandlerResponse::ok("unreachable"))
            }
            (_, "/downstream/ok") => {
                let value = ctx
                    .call_downstream("billing", async { Ok::<_, String>("paid") })
                    .await?;
                Ok(HandlerResponse::ok(value))
            }
            (Method::POST, "/jobs") => {
                let id = ctx.enqueue(TaskSpec::new("wait-for-cancel", |task| async move {
                    task.cancelled().await;
                    Err(TaskFailure::permanent("cancelled"))
                }))?;
                let accepted = HandlerResponse::json(&json!({ "task_id": id.to_string() }))?;
                Ok(accepted.with_status(StatusCode::ACCEPTED))
            }
            _ => Ok(HandlerResponse::ok(request.body)),
        }
    }
}

/// Small, fast settings shared by the integration tests.
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.rate_limit.default.rate = 1000.0;
    config.rate_limit.default.burst = 1000;
    config.circuit_breaker.default.failure_threshold = 3;
    config.circuit_breaker.default.open_duration_ms = 5_000;
    config.circuit_breaker.default.success_threshold = 1;
    config.timeouts.downstream_ms = 500;
    config.transform.cipher_suites = vec![CipherSuite::Aes256Gcm, CipherSuite::ChaCha20Poly1305];
    config.transform.compression_threshold = 64;
    config.transform.max_expansion_ratio = 200;
    config.tasks.queue_bound = 8;
    config.tasks.workers = 4;
    config
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::default())
}

pub fn master_key() -> MasterKey {
    MasterKey::from_bytes(MASTER_KEY)
}

/// Build a pipeline on `clock` with the test handler and master key.
pub fn build_pipeline(config: &PipelineConfig, clock: SharedClock) -> Arc<Pipeline> {
    let keys: Arc<dyn KeyProvider> = Arc::new(master_key());
    let pipeline = Pipeline::new(config, Arc::new(TestHandler), clock, Some(keys));
    Arc::new(pipeline.expect("valid test pipeline"))
}

pub fn request(method: Method, path: &str, client: &str) -> PipelineRequest {
    PipelineRequest::new(method, path).with_client(client)
}

pub fn header(name: &'static str, value: &str) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static(name),
        HeaderValue::from_str(value).expect("valid header value"),
    )
}

/// A running HTTP front end bound to an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub pipeline: Arc<Pipeline>,
    pub shutdown: Shutdown,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn stop(&self) {
        self.shutdown.trigger();
    }
}

/// Start the pipeline's background loops and serve it over HTTP.
pub async fn spawn_server(
    config: PipelineConfig,
    clock: SharedClock,
    start_loops: bool,
) -> TestServer {
    let pipeline = build_pipeline(&config, clock);
    let shutdown = Shutdown::new();
    if start_loops {
        let _ = pipeline.start(&shutdown);
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let server = HttpServer::new(pipeline.clone(), &config);

    let mut stop = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server
            .run(listener, async move {
                let _ = stop.recv().await;
            })
            .await;
    });

    // Give the accept loop a moment to start.
    tokio::time::sleep(Duration::from_millis(20)).await;

    TestServer {
        addr,
        pipeline,
        shutdown,
    }
}
