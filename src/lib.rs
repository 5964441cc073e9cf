//! Resilient request pipeline: identifiers, admission control, circuit
//! breaking, payload transforms and background tasks behind one `process`
//! entry point.

pub mod clock;
pub mod config;
pub mod http;
pub mod id;
pub mod lifecycle;
pub mod observability;
pub mod pipeline;
pub mod resilience;
pub mod security;
pub mod tasks;
pub mod transform;

pub use config::schema::PipelineConfig;
pub use http::HttpServer;
pub use id::Identifier;
pub use lifecycle::Shutdown;
pub use pipeline::Pipeline;
