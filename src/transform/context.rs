//! Per-request transform state.

use crate::transform::cipher::{CipherSuite, NonceSequence, SessionKey};
use crate::transform::compression::Encoding;

/// Key material negotiated for one request, one key per direction.
#[derive(Debug)]
pub struct SessionKeys {
    pub suite: CipherSuite,
    /// Opens bodies the peer sealed.
    pub ingress: SessionKey,
    /// Seals bodies sent back to the peer.
    pub egress: SessionKey,
}

/// Negotiated codings and key material for one request.
///
/// Owned by the request; both session keys are wiped when the context drops,
/// on every exit path.
#[derive(Debug)]
pub struct TransformContext {
    request_encoding: Encoding,
    response_encoding: Encoding,
    cipher: Option<CipherBinding>,
}

#[derive(Debug)]
pub(crate) struct CipherBinding {
    pub(crate) suite: CipherSuite,
    pub(crate) ingress: SessionKey,
    pub(crate) egress: SessionKey,
    pub(crate) nonces: NonceSequence,
}

impl TransformContext {
    pub fn new(
        request_encoding: Encoding,
        response_encoding: Encoding,
        keys: Option<SessionKeys>,
    ) -> Self {
        Self {
            request_encoding,
            response_encoding,
            cipher: keys.map(|keys| CipherBinding {
                suite: keys.suite,
                ingress: keys.ingress,
                egress: keys.egress,
                nonces: NonceSequence::new(),
            }),
        }
    }

    /// No coding, no encryption.
    pub fn plaintext() -> Self {
        Self::new(Encoding::Identity, Encoding::Identity, None)
    }

    pub fn request_encoding(&self) -> Encoding {
        self.request_encoding
    }

    pub fn response_encoding(&self) -> Encoding {
        self.response_encoding
    }

    pub fn cipher_suite(&self) -> Option<CipherSuite> {
        self.cipher.as_ref().map(|c| c.suite)
    }

    pub(crate) fn cipher(&self) -> Option<&CipherBinding> {
        self.cipher.as_ref()
    }

    pub(crate) fn cipher_mut(&mut self) -> Option<&mut CipherBinding> {
        self.cipher.as_mut()
    }
}
