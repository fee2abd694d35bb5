//! Outbound request signing.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::canonical::{Canonicalizer, RequestParts};
use crate::clock::{Clock, SystemClock};
use crate::config::{HeaderNames, SignatureConfig};
use crate::crypto;
use crate::error::SigvaultError;
use crate::keystore::SecretLookup;

/// The four values a signed request carries besides its own content.
/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEnvelope {
    key_id: String,
    signature: String,
    timestamp: i64,
    nonce: String,
}

impl SignatureEnvelope {
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// base64 HMAC-SHA256.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// The protocol headers to attach to the outbound request.
    pub fn to_headers(&self, names: &HeaderNames) -> [(String, String); 4] {
        [
            (names.key_id.clone(), self.key_id.clone()),
            (names.signature.clone(), self.signature.clone()),
            (names.timestamp.clone(), self.timestamp.to_string()),
            (names.nonce.clone(), self.nonce.clone()),
        ]
    }
}

/// base64(HMAC-SHA256(canonical, secret)).
pub fn compute_signature(canonical: &str, secret: &[u8]) -> String {
    STANDARD.encode(crypto::hmac_sha256(secret, canonical.as_bytes()))
}

/// Signs requests with secrets from a [`SecretLookup`].
pub struct RequestSigner {
    secrets: Arc<dyn SecretLookup>,
    canonicalizer: Canonicalizer,
    clock: Arc<dyn Clock>,
}

impl RequestSigner {
    pub fn new(secrets: Arc<dyn SecretLookup>, config: &SignatureConfig) -> Self {
        Self::with_clock(secrets, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        secrets: Arc<dyn SecretLookup>,
        config: &SignatureConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            secrets,
            canonicalizer: config.canonicalizer(),
            clock,
        }
    }

    /// Sign a request now, with a fresh random (v4 UUID) nonce.
    pub fn sign(
        &self,
        key_id: &str,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<SignatureEnvelope, SigvaultError> {
        let nonce = Uuid::new_v4().to_string();
        self.sign_at(
            key_id,
            method,
            path,
            headers,
            body,
            self.clock.now_secs(),
            &nonce,
        )
    }

    /// Sign with a caller-chosen timestamp and nonce. The nonce must carry
    /// enough entropy to never repeat within the validity window.
    #[allow(clippy::too_many_arguments)]
    pub fn sign_at(
        &self,
        key_id: &str,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        body: &[u8],
        timestamp: i64,
        nonce: &str,
    ) -> Result<SignatureEnvelope, SigvaultError> {
        let secrets = self
            .secrets
            .lookup(key_id)
            .ok_or(SigvaultError::UnknownKey)?;

        let canonical = self.canonicalizer.canonical_string(&RequestParts {
            method,
            path,
            timestamp,
            nonce,
            key_id,
            headers,
            body,
        })?;
        let signature = compute_signature(&canonical, secrets.current.expose());
        debug!(key_id, method, path, "signed request");

        Ok(SignatureEnvelope {
            key_id: key_id.to_string(),
            signature,
            timestamp,
            nonce: nonce.to_string(),
        })
    }
}
