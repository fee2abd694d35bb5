//! Inbound signature verification.
//!
//! Checks run in a fixed order and stop at the first failure:
//!
//! 1. key lookup
//! 2. timestamp window
//! 3. nonce freshness
//! 4. canonical string rebuilt, HMAC recomputed, constant-time comparison
//! 5. nonce recorded
//!
//! The public `verify` answers only yes or no. The reason is logged for
//! operators and otherwise discarded.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::{debug, warn};

use crate::canonical::{Canonicalizer, RequestParts};
use crate::clock::{Clock, SystemClock};
use crate::config::SignatureConfig;
use crate::crypto::{self, MAC_LEN};
use crate::error::SigvaultError;
use crate::keystore::SecretLookup;
use crate::replay::ReplayGuard;

/// Everything an inbound request presents for verification.
#[derive(Debug, Clone, Copy)]
pub struct SignedRequest<'a> {
    pub key_id: &'a str,
    /// base64 HMAC-SHA256 as sent by the caller.
    pub signature: &'a str,
    pub timestamp: i64,
    pub nonce: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub headers: &'a [(&'a str, &'a str)],
    pub body: &'a [u8],
}

impl<'a> SignedRequest<'a> {
    fn parts(&self) -> RequestParts<'a> {
        RequestParts {
            method: self.method,
            path: self.path,
            timestamp: self.timestamp,
            nonce: self.nonce,
            key_id: self.key_id,
            headers: self.headers,
            body: self.body,
        }
    }
}

/// Accepts or rejects signed requests.
pub struct SignatureVerifier {
    secrets: Arc<dyn SecretLookup>,
    replay: Arc<ReplayGuard>,
    canonicalizer: Canonicalizer,
    clock: Arc<dyn Clock>,
    window_secs: i64,
    /// Stand-in secret so unknown keys cost the same HMAC work as known ones.
    decoy_secret: [u8; MAC_LEN],
}

impl SignatureVerifier {
    /// Build a verifier with its own replay store and the system clock.
    pub fn new(
        secrets: Arc<dyn SecretLookup>,
        config: &SignatureConfig,
    ) -> Result<Self, SigvaultError> {
        let replay = Arc::new(ReplayGuard::new(
            config.validity_window_secs,
            &config.replay,
        ));
        Self::with_parts(secrets, replay, Arc::new(SystemClock), config)
    }

    /// Build a verifier around an existing replay store and clock. Several
    /// verifiers sharing one `ReplayGuard` share one replay window.
    pub fn with_parts(
        secrets: Arc<dyn SecretLookup>,
        replay: Arc<ReplayGuard>,
        clock: Arc<dyn Clock>,
        config: &SignatureConfig,
    ) -> Result<Self, SigvaultError> {
        config.validate()?;
        let mut decoy_secret = [0u8; MAC_LEN];
        crypto::fill_random(&mut decoy_secret)?;
        Ok(Self {
            secrets,
            replay,
            canonicalizer: config.canonicalizer(),
            clock,
            window_secs: i64::try_from(config.validity_window_secs)
                .map_err(|_| SigvaultError::InvalidConfig("validity window".into()))?,
            decoy_secret,
        })
    }

    pub fn replay_guard(&self) -> &Arc<ReplayGuard> {
        &self.replay
    }

    /// `true` if the request is authentic, fresh and not a replay.
    /// Never fails; the rejection reason goes to the log only.
    pub fn verify(&self, request: &SignedRequest<'_>) -> bool {
        match self.check(request) {
            Ok(()) => {
                debug!(
                    key_id = request.key_id,
                    method = request.method,
                    path = request.path,
                    "request signature verified"
                );
                true
            }
            Err(err) => {
                warn!(
                    key_id = request.key_id,
                    method = request.method,
                    path = request.path,
                    reason = err.reason_code(),
                    "request signature rejected"
                );
                false
            }
        }
    }

    /// Run every check and report which one failed.
    ///
    /// For server-side use only: the error must not reach the caller.
    pub fn check(&self, request: &SignedRequest<'_>) -> Result<(), SigvaultError> {
        let now = self.clock.now_secs();
        let presented = decode_signature(request.signature);

        // 1. Key lookup. An unknown key still pays for one HMAC and one
        //    comparison so it is not distinguishable by timing.
        let Some(secrets) = self.secrets.lookup(request.key_id) else {
            let canonical = self
                .canonicalizer
                .canonical_string(&request.parts())
                .unwrap_or_default();
            let decoy = crypto::hmac_sha256(&self.decoy_secret, canonical.as_bytes());
            let _ = crypto::mac_eq(&decoy, &presented);
            return Err(SigvaultError::UnknownKey);
        };

        // 2. Timestamp window.
        if now.abs_diff(request.timestamp) > self.window_secs.unsigned_abs() {
            return Err(SigvaultError::TimestampOutOfWindow);
        }

        // 3. Nonce freshness.
        if self.replay.is_replayed(request.key_id, request.nonce, now) {
            return Err(SigvaultError::NonceReplayed);
        }

        // 4. Recompute and compare. During a rotation grace period both
        //    secrets are always tried.
        let canonical = self.canonicalizer.canonical_string(&request.parts())?;
        let expected = crypto::hmac_sha256(secrets.current.expose(), canonical.as_bytes());
        let mut matched = crypto::mac_eq(&expected, &presented);
        if let Some(previous) = &secrets.previous {
            let expected = crypto::hmac_sha256(previous.expose(), canonical.as_bytes());
            matched |= crypto::mac_eq(&expected, &presented);
        }
        if !bool::from(matched) {
            return Err(SigvaultError::SignatureMismatch);
        }

        // 5. Record. Fails if a concurrent request with the same nonce won.
        self.replay
            .record(request.key_id, request.nonce, request.timestamp, now)
    }
}

/// Decode a presented signature into a fixed-size MAC. Anything that is not
/// valid base64 of exactly 32 bytes becomes all zeroes, which is compared
/// like any other value and simply fails to match.
fn decode_signature(signature: &str) -> [u8; MAC_LEN] {
    let mut out = [0u8; MAC_LEN];
    if let Ok(bytes) = STANDARD.decode(signature.trim()) {
        if bytes.len() == MAC_LEN {
            out.copy_from_slice(&bytes);
        }
    }
    out
}
