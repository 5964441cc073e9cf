//! The transform stage: codings and encryption applied around the handler.

use std::sync::Arc;

use axum::http::HeaderMap;

use crate::config::TransformConfig;
use crate::id::Identifier;
use crate::transform::cipher::{self, CipherSuite, KeyProvider, KeyScope, MasterKey};
use crate::transform::compression::{self, DecompressionLimits, Encoding};
use crate::transform::context::{SessionKeys, TransformContext};
use crate::transform::negotiate;
use crate::transform::TransformError;

/// Response body after [`TransformStage::encode`], with the codings actually
/// applied.
#[derive(Debug, Clone)]
pub struct EncodedBody {
    pub bytes: Vec<u8>,
    pub encoding: Encoding,
    pub cipher: Option<CipherSuite>,
}

pub struct TransformStage {
    suites: Vec<CipherSuite>,
    keys: Option<Arc<dyn KeyProvider>>,
    limits: DecompressionLimits,
    compression_threshold: usize,
    compression_level: u32,
}

impl std::fmt::Debug for TransformStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformStage")
            .field("suites", &self.suites)
            .field("limits", &self.limits)
            .field("compression_threshold", &self.compression_threshold)
            .finish()
    }
}

impl TransformStage {
    /// Build with an explicit key source. Enabling suites without one is a
    /// startup error.
    pub fn new(
        config: &TransformConfig,
        keys: Option<Arc<dyn KeyProvider>>,
    ) -> Result<Self, TransformError> {
        if !config.cipher_suites.is_empty() && keys.is_none() {
            return Err(TransformError::KeyProvisioning(
                "cipher suites are enabled but no key provider is configured".to_string(),
            ));
        }
        Ok(Self {
            suites: config.cipher_suites.clone(),
            keys,
            limits: DecompressionLimits::from_config(config),
            compression_threshold: config.compression_threshold,
            compression_level: config.compression_level,
        })
    }

    /// Build from config, reading the master key from the environment when
    /// encryption is enabled.
    pub fn from_config(config: &TransformConfig) -> Result<Self, TransformError> {
        let keys: Option<Arc<dyn KeyProvider>> = if config.cipher_suites.is_empty() {
            None
        } else {
            Some(Arc::new(MasterKey::from_env(&config.master_key_env)?))
        };
        Self::new(config, keys)
    }

    /// Build the per-request context from the request headers. The egress
    /// key is bound to `request_id`, so it is never shared with another
    /// request.
    pub fn negotiate(
        &self,
        headers: &HeaderMap,
        request_id: Identifier,
    ) -> Result<TransformContext, TransformError> {
        let request_encoding = negotiate::request_encoding(headers)?;
        let response_encoding = negotiate::response_encoding(headers);

        let cipher = match negotiate::cipher_suite(headers, &self.suites)? {
            None => None,
            Some(suite) => {
                let keys = self.keys.as_ref().ok_or_else(|| {
                    TransformError::KeyProvisioning("no key provider configured".to_string())
                })?;
                let salt = negotiate::session_salt(headers)?;
                Some(SessionKeys {
                    suite,
                    ingress: keys.session_key(suite, &salt, KeyScope::Request)?,
                    egress: keys.session_key(suite, &salt, KeyScope::Response(request_id))?,
                })
            }
        };

        Ok(TransformContext::new(request_encoding, response_encoding, cipher))
    }

    /// Ingress: verify and decrypt, then decompress.
    pub fn decode(&self, body: &[u8], ctx: &TransformContext) -> Result<Vec<u8>, TransformError> {
        let plaintext = match ctx.cipher() {
            Some(binding) => cipher::open(binding.suite, &binding.ingress, body)?,
            None => body.to_vec(),
        };
        compression::decompress(ctx.request_encoding(), &plaintext, &self.limits)
    }

    /// Egress: compress when it pays off, then encrypt.
    pub fn encode(
        &self,
        body: &[u8],
        ctx: &mut TransformContext,
    ) -> Result<EncodedBody, TransformError> {
        let (bytes, encoding) = self.maybe_compress(body, ctx.response_encoding())?;

        match ctx.cipher_mut() {
            Some(binding) => {
                let sealed =
                    cipher::seal(binding.suite, &binding.egress, &mut binding.nonces, &bytes)?;
                Ok(EncodedBody {
                    bytes: sealed,
                    encoding,
                    cipher: Some(binding.suite),
                })
            }
            None => Ok(EncodedBody {
                bytes,
                encoding,
                cipher: None,
            }),
        }
    }

    fn maybe_compress(
        &self,
        body: &[u8],
        encoding: Encoding,
    ) -> Result<(Vec<u8>, Encoding), TransformError> {
        if encoding.is_identity()
            || body.len() < self.compression_threshold
            || compression::looks_compressed(body)
        {
            return Ok((body.to_vec(), Encoding::Identity));
        }

        let packed = compression::compress(encoding, body, self.compression_level)?;
        if packed.len() >= body.len() {
            tracing::trace!(
                encoding = %encoding,
                size = body.len(),
                "Compression not beneficial, sending identity"
            );
            return Ok((body.to_vec(), Encoding::Identity));
        }
        Ok((packed, encoding))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::cipher::KEY_LEN;

    const SALT_HEADER: &str = "MDEyMzQ1Njc4OWFiY2RlZg==";

    fn config(suites: Vec<CipherSuite>) -> TransformConfig {
        TransformConfig {
            cipher_suites: suites,
            compression_threshold: 64,
            ..TransformConfig::default()
        }
    }

    fn keys() -> Arc<dyn KeyProvider> {
        Arc::new(MasterKey::from_bytes([3u8; KEY_LEN]))
    }

    fn sealing_stage(suite: CipherSuite) -> TransformStage {
        TransformStage::new(&config(vec![suite]), Some(keys())).unwrap()
    }

    fn sealed_headers(suite: &str, encoding: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("accept-encoding", encoding.parse().unwrap());
        headers.insert("x-cipher-suite", suite.parse().unwrap());
        headers.insert("x-session-salt", SALT_HEADER.parse().unwrap());
        headers
    }

    /// The client's view of a request: it opens with the response key and
    /// seals with the request key.
    fn client(encoding: Encoding, suite: CipherSuite, request_id: Identifier) -> TransformContext {
        let salt = b"0123456789abcdef";
        let keys = keys();
        TransformContext::new(
            encoding,
            encoding,
            Some(SessionKeys {
                suite,
                ingress: keys.session_key(suite, salt, KeyScope::Response(request_id)).unwrap(),
                egress: keys.session_key(suite, salt, KeyScope::Request).unwrap(),
            }),
        )
    }

    #[test]
    fn encrypted_compressed_round_trip() {
        let stage = sealing_stage(CipherSuite::Aes256Gcm);
        let id = Identifier::from_raw(41);
        let mut server = stage.negotiate(&sealed_headers("aes-256-gcm", "gzip"), id).unwrap();
        let body = br#"{"items":[1,2,3,4,5,6,7,8,9,10]}"#.repeat(20);

        let encoded = stage.encode(&body, &mut server).unwrap();
        assert_eq!(encoded.encoding, Encoding::Gzip);
        assert_eq!(encoded.cipher, Some(CipherSuite::Aes256Gcm));

        let client = client(encoded.encoding, CipherSuite::Aes256Gcm, id);
        assert_eq!(stage.decode(&encoded.bytes, &client).unwrap(), body);
    }

    #[test]
    fn client_sealed_request_decodes() {
        let stage = sealing_stage(CipherSuite::Aes256Gcm);
        let id = Identifier::from_raw(7);
        let mut client = client(Encoding::Identity, CipherSuite::Aes256Gcm, id);
        let sealed = stage.encode(b"hello server", &mut client).unwrap();

        let server = stage.negotiate(&sealed_headers("aes-256-gcm", "identity"), id).unwrap();
        assert_eq!(stage.decode(&sealed.bytes, &server).unwrap(), b"hello server");
    }

    #[test]
    fn responses_with_a_replayed_salt_use_distinct_keys() {
        let stage = sealing_stage(CipherSuite::ChaCha20Poly1305);
        let headers = sealed_headers("chacha20-poly1305", "identity");
        let first_id = Identifier::from_raw(100);
        let second_id = Identifier::from_raw(101);

        let mut first = stage.negotiate(&headers, first_id).unwrap();
        let mut second = stage.negotiate(&headers, second_id).unwrap();
        let a = stage.encode(b"same body", &mut first).unwrap();
        let b = stage.encode(b"same body", &mut second).unwrap();
        assert_ne!(a.bytes, b.bytes);

        let wrong = client(Encoding::Identity, CipherSuite::ChaCha20Poly1305, second_id);
        assert!(matches!(stage.decode(&a.bytes, &wrong), Err(TransformError::AuthFailure)));
        let right = client(Encoding::Identity, CipherSuite::ChaCha20Poly1305, first_id);
        assert_eq!(stage.decode(&a.bytes, &right).unwrap(), b"same body");

        // A response never opens under the request direction's key.
        assert!(matches!(stage.decode(&a.bytes, &first), Err(TransformError::AuthFailure)));
    }

    #[test]
    fn tampered_body_never_decodes() {
        let stage = sealing_stage(CipherSuite::ChaCha20Poly1305);
        let id = Identifier::from_raw(9);
        let headers = sealed_headers("chacha20-poly1305", "identity");
        let mut ctx = stage.negotiate(&headers, id).unwrap();
        let mut encoded = stage.encode(b"secret", &mut ctx).unwrap();

        let last = encoded.bytes.len() - 1;
        encoded.bytes[last] ^= 0x01;
        let client = client(Encoding::Identity, CipherSuite::ChaCha20Poly1305, id);
        assert!(matches!(stage.decode(&encoded.bytes, &client), Err(TransformError::AuthFailure)));
    }

    #[test]
    fn skips_small_and_precompressed_bodies() {
        let stage = TransformStage::new(&config(Vec::new()), None).unwrap();
        let mut ctx = TransformContext::new(Encoding::Identity, Encoding::Gzip, None);

        let small = stage.encode(b"tiny", &mut ctx).unwrap();
        assert_eq!(small.encoding, Encoding::Identity);
        assert_eq!(small.bytes, b"tiny");

        let already = compression::compress(Encoding::Gzip, &vec![b'z'; 4096], 6).unwrap();
        let padded = [already.clone(), vec![0u8; 128]].concat();
        let encoded = stage.encode(&padded, &mut ctx).unwrap();
        assert_eq!(encoded.encoding, Encoding::Identity);

        let text = b"compressible text ".repeat(50);
        assert_eq!(stage.encode(&text, &mut ctx).unwrap().encoding, Encoding::Gzip);
    }

    #[test]
    fn suites_without_keys_fail_fast() {
        let err = TransformStage::new(&config(vec![CipherSuite::Aes256Gcm]), None).unwrap_err();
        assert!(matches!(err, TransformError::KeyProvisioning(_)));
    }

    #[test]
    fn negotiates_from_headers() {
        let stage = sealing_stage(CipherSuite::Aes256Gcm);
        let mut headers = sealed_headers("aes-256-gcm", "zstd");
        headers.insert("content-encoding", "deflate".parse().unwrap());
        let id = Identifier::from_raw(1);

        let ctx = stage.negotiate(&headers, id).unwrap();
        assert_eq!(ctx.request_encoding(), Encoding::Deflate);
        assert_eq!(ctx.response_encoding(), Encoding::Zstd);
        assert_eq!(ctx.cipher_suite(), Some(CipherSuite::Aes256Gcm));

        headers.remove("x-session-salt");
        assert!(matches!(stage.negotiate(&headers, id), Err(TransformError::KeyProvisioning(_))));
    }
}
