//! Requests entering and leaving the transform stage.

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::de::DeserializeOwned;

use crate::id::Identifier;
use crate::pipeline::handler::HandlerError;

/// A request as handed over by the transport layer: body still encoded.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub method: Method,
    pub path: String,
    /// Client identity used for rate-limit keys (peer address or API client id).
    pub client: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl PipelineRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            client: "anonymous".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = client.into();
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// A request after ingress transforms: verified, decrypted and decompressed.
#[derive(Debug)]
pub struct DecodedRequest {
    pub id: Identifier,
    pub method: Method,
    pub path: String,
    pub client: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl DecodedRequest {
    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| HandlerError::BadRequest(format!("invalid JSON body: {e}")))
    }
}
