//! Error types for sigvault.
//!
//! Every variant is a distinct failure mode. Messages are intentionally
//! minimal: they signal *what* failed without carrying secrets, signatures
//! or plaintext. Signature failures all collapse to a single generic 401 at
//! the HTTP boundary; the variant survives only in server-side logs.

use thiserror::Error;

/// The single error type for all sigvault operations.
#[derive(Debug, Error)]
pub enum SigvaultError {
    /// The key identifier is not registered, or is deactivated.
    #[error("unknown key")]
    UnknownKey,

    /// The request timestamp is further from now than the validity window.
    #[error("timestamp outside validity window")]
    TimestampOutOfWindow,

    /// The `(key id, nonce)` pair was already accepted and has not expired.
    #[error("nonce already used")]
    NonceReplayed,

    /// The replay store is full of unexpired nonces.
    #[error("replay store at capacity")]
    ReplayStoreSaturated,

    /// The presented signature does not match the recomputed one.
    #[error("signature mismatch")]
    SignatureMismatch,

    /// One or more of the protocol headers is absent.
    #[error("missing signature headers")]
    MissingHeaders,

    /// A protocol header is present but cannot be parsed.
    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),

    /// A signable part would make the canonical string ambiguous
    /// (embedded line break, empty identifier).
    #[error("invalid canonical input: {0}")]
    InvalidCanonicalInput(&'static str),

    /// Authenticated decryption failed: wrong key, altered IV, ciphertext
    /// or tag. No plaintext is ever returned in this case.
    #[error("decryption failed")]
    DecryptionTamper,

    /// The blob is not `<dek-id>:<base64>` or is too short to hold an IV and tag.
    #[error("unsupported ciphertext format")]
    UnsupportedCiphertextFormat,

    /// A cryptographic key was invalid (wrong length, weak, malformed).
    #[error("invalid key")]
    InvalidKey,

    /// A key identifier is empty or contains a reserved character.
    #[error("invalid key id: {0}")]
    InvalidKeyId(String),

    /// Encryption failed inside `ring`.
    #[error("encryption failed")]
    EncryptionFailure,

    /// Key derivation (HKDF) failed.
    #[error("key derivation failed")]
    KeyDerivationFailure,

    /// A wrapped data key could not be unwrapped with the master key.
    #[error("data key unwrap failed")]
    KeyUnwrapFailure,

    /// The system's random number generator failed to produce bytes.
    #[error("randomness source failed")]
    RandomnessFailure,

    /// The requested data key does not exist (never created or retired).
    #[error("data key not found: {0}")]
    DataKeyNotFound(String),

    /// The active data key cannot be retired.
    #[error("data key is active: {0}")]
    DataKeyActive(String),

    /// The data key store failed to load or persist.
    #[error("key storage failure: {0}")]
    KeyStorage(String),

    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SigvaultError {
    /// Stable, log-friendly code for this failure.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::UnknownKey => "unknown_key",
            Self::TimestampOutOfWindow => "timestamp_out_of_window",
            Self::NonceReplayed => "nonce_replayed",
            Self::ReplayStoreSaturated => "replay_store_saturated",
            Self::SignatureMismatch => "signature_mismatch",
            Self::MissingHeaders => "missing_headers",
            Self::MalformedHeader(_) => "malformed_header",
            Self::InvalidCanonicalInput(_) => "invalid_canonical_input",
            Self::DecryptionTamper => "decryption_tamper",
            Self::UnsupportedCiphertextFormat => "unsupported_ciphertext_format",
            Self::InvalidKey => "invalid_key",
            Self::InvalidKeyId(_) => "invalid_key_id",
            Self::EncryptionFailure => "encryption_failure",
            Self::KeyDerivationFailure => "key_derivation_failure",
            Self::KeyUnwrapFailure => "key_unwrap_failure",
            Self::RandomnessFailure => "randomness_failure",
            Self::DataKeyNotFound(_) => "data_key_not_found",
            Self::DataKeyActive(_) => "data_key_active",
            Self::KeyStorage(_) => "key_storage",
            Self::InvalidConfig(_) => "invalid_config",
        }
    }
}
