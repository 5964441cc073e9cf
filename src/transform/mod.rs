//! Payload transform subsystem.
//!
//! # Data Flow
//! ```text
//! Request headers
//!     → negotiate.rs (content-encoding, accept-encoding, x-cipher-suite, x-session-salt)
//!     → TransformContext (codings + request/response session keys)
//!
//! Ingress body:  cipher::open (verify tag) → compression::decompress (bounded)
//! Egress body:   compression::compress (when it helps) → cipher::seal (fresh nonce)
//! ```
//!
//! # Design Decisions
//! - Nothing is handed to the application before the tag verifies
//! - Response keys bind the request id and are zeroized when the context drops
//! - Decompression output is capped by size and by expansion ratio

pub mod cipher;
pub mod compression;
pub mod context;
pub mod negotiate;
pub mod stage;

use thiserror::Error;

pub use cipher::{CipherSuite, KeyProvider, KeyScope, MasterKey, SessionKey};
pub use compression::Encoding;
pub use context::{SessionKeys, TransformContext};
pub use stage::{EncodedBody, TransformStage};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("authentication failed: payload rejected")]
    AuthFailure,

    #[error("decompressed body exceeds {limit} bytes")]
    DecompressionLimitExceeded { limit: usize },

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("nonce space exhausted for this session key")]
    NonceExhausted,

    #[error("key provisioning failed: {0}")]
    KeyProvisioning(String),

    #[error("codec error: {0}")]
    Codec(#[from] std::io::Error),
}

impl TransformError {
    /// Stable label for responses and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            TransformError::AuthFailure => "auth_failure",
            TransformError::DecompressionLimitExceeded { .. } => "decompression_limit_exceeded",
            TransformError::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            TransformError::MalformedPayload(_) => "malformed_payload",
            TransformError::NonceExhausted => "nonce_exhausted",
            TransformError::KeyProvisioning(_) => "key_provisioning",
            TransformError::Codec(_) => "codec",
        }
    }
}
