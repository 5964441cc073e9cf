//! Authenticated encryption of payload bodies.
//!
//! Wire format: `nonce(12) || ciphertext || tag(16)`.
//!
//! Keys are scoped by direction. Bodies the peer seals use a key derived
//! from the master key, the peer's salt and the suite. Bodies this process
//! seals use a key that also binds the request [`Identifier`], so no two
//! responses share an egress key even when a peer replays its salt.
//!
//! Nonces are a 4-byte random prefix chosen per context followed by an
//! 8-byte big-endian counter. Each egress key seals at most one context's
//! worth of messages, so a (key, nonce) pair never repeats.

use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::generic_array::GenericArray;
use base64::Engine;
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::id::Identifier;
use crate::transform::TransformError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Supported AEAD suites. Both use 256-bit keys and 96-bit nonces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherSuite {
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl CipherSuite {
    pub fn as_str(&self) -> &'static str {
        match self {
            CipherSuite::Aes256Gcm => "aes-256-gcm",
            CipherSuite::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherSuite {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes-256-gcm" => Ok(CipherSuite::Aes256Gcm),
            "chacha20-poly1305" => Ok(CipherSuite::ChaCha20Poly1305),
            other => Err(TransformError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// A per-request symmetric key. Wiped from memory on drop.
pub struct SessionKey(Zeroizing<[u8; KEY_LEN]>);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// Which direction a session key protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScope {
    /// Bodies sealed by the peer.
    Request,
    /// Bodies sealed here in reply to the request with this id.
    Response(Identifier),
}

impl KeyScope {
    fn info(&self, suite: CipherSuite) -> String {
        match self {
            KeyScope::Request => format!("request-pipeline {} request", suite.as_str()),
            KeyScope::Response(id) => {
                format!("request-pipeline {} response {}", suite.as_str(), id)
            }
        }
    }
}

/// Source of per-request session keys.
pub trait KeyProvider: Send + Sync + fmt::Debug {
    /// Derive the key for one direction of one request. `salt` is supplied by
    /// the peer.
    fn session_key(
        &self,
        suite: CipherSuite,
        salt: &[u8],
        scope: KeyScope,
    ) -> Result<SessionKey, TransformError>;
}

/// Long-lived master secret. Session keys are HKDF-SHA256 expansions of it.
pub struct MasterKey(Zeroizing<[u8; KEY_LEN]>);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, TransformError> {
        let decoded = Zeroizing::new(
            base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| {
                    TransformError::KeyProvisioning(format!("master key is not base64: {e}"))
                })?,
        );
        let bytes: [u8; KEY_LEN] = decoded.as_slice().try_into().map_err(|_| {
            TransformError::KeyProvisioning(format!(
                "master key must be {KEY_LEN} bytes, got {}",
                decoded.len()
            ))
        })?;
        Ok(Self::from_bytes(bytes))
    }

    /// Read the key from the environment variable `var`.
    pub fn from_env(var: &str) -> Result<Self, TransformError> {
        let value = Zeroizing::new(std::env::var(var).map_err(|_| {
            TransformError::KeyProvisioning(format!("environment variable {var} is not set"))
        })?);
        Self::from_base64(&value)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

impl KeyProvider for MasterKey {
    fn session_key(
        &self,
        suite: CipherSuite,
        salt: &[u8],
        scope: KeyScope,
    ) -> Result<SessionKey, TransformError> {
        let hk = Hkdf::<Sha256>::new(Some(salt), self.0.as_slice());
        let info = scope.info(suite);
        let mut okm = Zeroizing::new([0u8; KEY_LEN]);
        hk.expand(info.as_bytes(), okm.as_mut_slice())
            .map_err(|_| TransformError::KeyProvisioning("key derivation failed".to_string()))?;
        Ok(SessionKey(okm))
    }
}

/// Counter-based nonce source for one session key.
#[derive(Debug)]
pub struct NonceSequence {
    prefix: [u8; 4],
    counter: u64,
}

impl NonceSequence {
    pub fn new() -> Self {
        let mut prefix = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut prefix);
        Self { prefix, counter: 0 }
    }

    #[cfg(test)]
    fn starting_at(counter: u64) -> Self {
        Self {
            prefix: [0; 4],
            counter,
        }
    }

    pub fn next_nonce(&mut self) -> Result<[u8; NONCE_LEN], TransformError> {
        if self.counter == u64::MAX {
            return Err(TransformError::NonceExhausted);
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&self.prefix);
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter += 1;
        Ok(nonce)
    }
}

impl Default for NonceSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Encrypt `plaintext` under a fresh nonce from `nonces`.
pub fn seal(
    suite: CipherSuite,
    key: &SessionKey,
    nonces: &mut NonceSequence,
    plaintext: &[u8],
) -> Result<Vec<u8>, TransformError> {
    let nonce = nonces.next_nonce()?;

    let ciphertext = match suite {
        CipherSuite::Aes256Gcm => {
            use aes_gcm::aead::{Aead, KeyInit};
            aes_gcm::Aes256Gcm::new(GenericArray::from_slice(key.as_bytes().as_slice()))
                .encrypt(GenericArray::from_slice(nonce.as_slice()), plaintext)
                .map_err(|_| TransformError::MalformedPayload("encryption failed".to_string()))?
        }
        CipherSuite::ChaCha20Poly1305 => {
            use chacha20poly1305::aead::{Aead, KeyInit};
            let key = chacha20poly1305::Key::from_slice(key.as_bytes().as_slice());
            chacha20poly1305::ChaCha20Poly1305::new(key)
                .encrypt(chacha20poly1305::Nonce::from_slice(nonce.as_slice()), plaintext)
                .map_err(|_| TransformError::MalformedPayload("encryption failed".to_string()))?
        }
    };

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Verify and decrypt a sealed message. Nothing is returned unless the tag
/// verifies.
pub fn open(
    suite: CipherSuite,
    key: &SessionKey,
    sealed: &[u8],
) -> Result<Vec<u8>, TransformError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(TransformError::MalformedPayload(format!(
            "sealed payload shorter than {} bytes",
            NONCE_LEN + TAG_LEN
        )));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

    match suite {
        CipherSuite::Aes256Gcm => {
            use aes_gcm::aead::{Aead, KeyInit};
            aes_gcm::Aes256Gcm::new(GenericArray::from_slice(key.as_bytes().as_slice()))
                .decrypt(GenericArray::from_slice(nonce), ciphertext)
                .map_err(|_| TransformError::AuthFailure)
        }
        CipherSuite::ChaCha20Poly1305 => {
            use chacha20poly1305::aead::{Aead, KeyInit};
            let key = chacha20poly1305::Key::from_slice(key.as_bytes().as_slice());
            chacha20poly1305::ChaCha20Poly1305::new(key)
                .decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| TransformError::AuthFailure)
        }
    }
}
