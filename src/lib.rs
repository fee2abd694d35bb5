//! # sigvault
//!
//! Service-to-service request authentication and field protection.
//!
//! Internal callers sign each request with an HMAC-SHA256 over a canonical
//! rendering of its parts; the receiving side checks key, timestamp window,
//! nonce freshness and signature before the request reaches business logic.
//! Separately, individual sensitive values inside payloads are sealed with
//! AES-256-GCM under versioned, master-key-wrapped data keys.
//!
//! ## Public API
//!
//! Signing side: [`KeyStore`], [`RequestSigner`], [`SignatureEnvelope`].
//! Verifying side: [`SignatureVerifier`], [`ReplayGuard`], and the
//! [`SignatureLayer`] tower middleware. Field protection:
//! [`FieldEncryptionService`], [`SensitiveFieldWalker`]. Low-level AEAD and
//! HMAC primitives stay `pub(crate)`.

// Module declarations.
pub mod canonical;
pub mod clock;
pub mod config;
pub(crate) mod crypto;
pub mod error;
pub mod field;
pub mod interceptor;
pub mod keys;
pub mod keystore;
pub mod replay;
pub mod signer;
pub mod verifier;
pub mod walker;

pub use canonical::{body_hash, Canonicalizer, RequestParts};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BypassConfig, EncryptionConfig, HeaderNames, MissingHeaderPolicy, ReplayConfig,
    SignatureConfig, SigvaultConfig,
};
pub use error::SigvaultError;
pub use field::{
    DekStore, EncryptedBlob, FieldEncryptionService, InMemoryDekStore, JsonFileDekStore,
};
pub use interceptor::{ApiKey, SignatureLayer, SignatureService, SignatureVerified};
pub use keys::{DataEncryptionKey, MasterKey, WrappedDek};
pub use keystore::{ApiKeyRecord, ApiSecret, KeyStore, SecretLookup, SigningSecrets};
pub use replay::{NonceRecord, ReplayGuard};
pub use signer::{compute_signature, RequestSigner, SignatureEnvelope};
pub use verifier::{SignatureVerifier, SignedRequest};
pub use walker::{SensitiveFieldWalker, SensitiveFields, SENSITIVE_FIELDS};

/// Generate a cryptographically secure master key.
///
/// Intended for tests and local development. In production the master key
/// comes from a secret store and is loaded with [`MasterKey::from_base64`].
pub fn generate_master_key() -> Result<MasterKey, SigvaultError> {
    let bytes = crypto::generate_random_key()?;
    Ok(MasterKey::from_bytes(bytes))
}
