//! Request pipeline server.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ http server ──▶ Pipeline::process
//!                                        │
//!                                        ├─ SnowflakeGenerator   (request id)
//!                                        ├─ RateLimiter          (admission)
//!                                        ├─ TransformStage       (decrypt, decompress)
//!                                        ├─ Handler              (application logic)
//!                                        │     ├─ CircuitBreakers (downstream calls)
//!                                        │     └─ TaskEngine      (background work)
//!                                        └─ TransformStage       (compress, encrypt)
//!     Client Response
//!     ◀────────────── http server ◀── PipelineResponse
//! ```
//!
//! The bundled handler echoes request bodies and queues a background job for
//! `POST /jobs`. Embedders supply their own [`Handler`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{Method, StatusCode};
use clap::Parser;
use serde_json::json;
use tokio::net::TcpListener;

use request_pipeline::config::loader::load_config;
use request_pipeline::config::watcher::ConfigWatcher;
use request_pipeline::config::PipelineConfig;
use request_pipeline::lifecycle::{wait_for_signal, Shutdown};
use request_pipeline::observability::{logging, metrics};
use request_pipeline::pipeline::{
    DecodedRequest, Handler, HandlerContext, HandlerError, HandlerResponse, Pipeline,
};
use request_pipeline::tasks::{TaskFailure, TaskSpec};
use request_pipeline::HttpServer;

#[derive(Parser)]
#[command(name = "request-pipeline")]
#[command(about = "Resilient request pipeline server", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "pipeline.toml")]
    config: PathBuf,

    /// Do not reload the configuration when the file changes
    #[arg(long)]
    no_watch: bool,
}

/// Echoes requests; `POST /jobs` queues a background job.
struct DemoHandler;

#[async_trait]
impl Handler for DemoHandler {
    async fn handle(
        &self,
        request: DecodedRequest,
        ctx: &HandlerContext,
    ) -> Result<HandlerResponse, HandlerError> {
        if request.method == Method::POST && request.path == "/jobs" {
            let payload = request.body.clone();
            let id = ctx.enqueue(TaskSpec::new("demo-job", move |task| {
                let payload = payload.clone();
                async move {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                        _ = task.cancelled() => return Err(TaskFailure::permanent("cancelled")),
                    }
                    Ok(json!({ "bytes": payload.len(), "attempt": task.attempt() }))
                }
            }))?;
            let accepted = HandlerResponse::json(&json!({ "task_id": id.to_string() }))?;
            return Ok(accepted.with_status(StatusCode::ACCEPTED));
        }

        Ok(HandlerResponse::ok(request.body))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        PipelineConfig::default()
    };

    logging::init(&config.observability.log_level);
    tracing::info!("request-pipeline v{} starting", env!("CARGO_PKG_VERSION"));
    if !cli.config.exists() {
        tracing::warn!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    tracing::info!(
        bind_address = %config.listener.bind_address,
        worker_id = config.identifier.worker_id,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let pipeline = Arc::new(Pipeline::from_config(&config, Arc::new(DemoHandler))?);
    let shutdown = Shutdown::new();
    let mut handles = pipeline.start(&shutdown);

    // Held for the lifetime of the process; dropping it stops the watch.
    let _watcher = if !cli.no_watch && cli.config.exists() {
        let (watcher, mut updates) = ConfigWatcher::new(&cli.config, Duration::from_millis(250))
            .spawn(shutdown.subscribe())?;

        let pipeline = pipeline.clone();
        let mut stop = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Some(new_config) => pipeline.apply_config(&new_config),
                        None => break,
                    },
                    _ = stop.recv() => break,
                }
            }
        }));
        Some(watcher)
    } else {
        None
    };

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let server = HttpServer::new(pipeline.clone(), &config);

    let signal = shutdown.clone();
    server
        .run(listener, async move {
            wait_for_signal().await;
            signal.trigger();
        })
        .await?;

    shutdown.drain(handles, Duration::from_secs(config.timeouts.request_secs)).await;

    tracing::info!("Shutdown complete");
    Ok(())
}
