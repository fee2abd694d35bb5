//! Key ownership and envelope wrapping.
//!
//! This module owns two responsibilities:
//! 1. Holding key material (master key, data encryption keys) in types that
//!    are opaque, non-cloneable, and zeroised on drop.
//! 2. Wrapping data encryption keys (DEKs) under a key-wrapping key derived
//!    from the master key, so DEKs can be persisted without exposing them.
//!
//! This is one of exactly two modules permitted to import `ring` directly
//! (the other is `crypto`). The HKDF derivation lives here because it
//! operates on the key material itself, not on field ciphertexts.
//!
//! ## Key hierarchy
//!
//! ```text
//! MasterKey ──HKDF-SHA256(info = "sigvault:dek-wrap")──▶ WrappingKey
//! MasterKey ──HKDF-SHA256(info = "sigvault:search-hash")──▶ SearchKey
//! WrappingKey ──AES-256-GCM(aad = dek id)──▶ WrappedDek (persisted)
//! DataEncryptionKey ──AES-256-GCM──▶ field ciphertext
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use ring::hkdf;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto::{self, KEY_LEN};
use crate::error::SigvaultError;

/// HKDF info string for the key-wrapping key.
const WRAP_INFO: &[u8] = b"sigvault:dek-wrap";

/// HKDF info string for the searchable-hash key.
const SEARCH_INFO: &[u8] = b"sigvault:search-hash";

// ---------------------------------------------------------------------------
// Master key
// ---------------------------------------------------------------------------

/// The master key. This is the single long-lived secret for field
/// encryption and must be supplied by the caller from a secret store.
///
/// - Not `Clone`. Cannot be duplicated without explicit conversion.
/// - Zeroised on drop.
pub struct MasterKey {
    bytes: [u8; KEY_LEN],
}

impl MasterKey {
    /// Construct a `MasterKey` from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Decode a base64 master key as found in configuration.
    ///
    /// Rejects anything that is not exactly 32 bytes, and keys whose bytes
    /// are all identical.
    pub fn from_base64(encoded: &str) -> Result<Self, SigvaultError> {
        let mut decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|_| SigvaultError::InvalidKey)?;
        let result = Self::validate(&decoded);
        let key = result.map(|()| {
            let mut bytes = [0u8; KEY_LEN];
            bytes.copy_from_slice(&decoded);
            Self { bytes }
        });
        decoded.zeroize();
        key
    }

    fn validate(bytes: &[u8]) -> Result<(), SigvaultError> {
        if bytes.len() != KEY_LEN {
            return Err(SigvaultError::InvalidKey);
        }
        if bytes.iter().all(|b| *b == bytes[0]) {
            return Err(SigvaultError::InvalidKey);
        }
        Ok(())
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

// ---------------------------------------------------------------------------
// Wrapping key
// ---------------------------------------------------------------------------

/// The key that wraps DEKs. Derived from the master key, never stored.
pub(crate) struct WrappingKey {
    bytes: [u8; KEY_LEN],
}

impl Drop for WrappingKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// Derive the DEK wrapping key from the master key.
///
/// ```text
/// HKDF-SHA256(ikm = master_key, salt = None, info = "sigvault:dek-wrap")
/// ```
pub(crate) fn derive_wrapping_key(master: &MasterKey) -> Result<WrappingKey, SigvaultError> {
    Ok(WrappingKey {
        bytes: expand_master(master, WRAP_INFO)?,
    })
}

/// The key behind searchable hashes. Derived from the master key, so hashes
/// stay stable across DEK rotations and differ between deployments.
pub(crate) struct SearchKey {
    bytes: [u8; KEY_LEN],
}

impl SearchKey {
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl Drop for SearchKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// ```text
/// HKDF-SHA256(ikm = master_key, salt = None, info = "sigvault:search-hash")
/// ```
pub(crate) fn derive_search_key(master: &MasterKey) -> Result<SearchKey, SigvaultError> {
    Ok(SearchKey {
        bytes: expand_master(master, SEARCH_INFO)?,
    })
}

fn expand_master(master: &MasterKey, info: &[u8]) -> Result<[u8; KEY_LEN], SigvaultError> {
    // An empty salt is treated by HKDF as a zero-filled salt of hash length.
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]);
    let prk = salt.extract(master.as_bytes());

    let info = [info];
    let okm = prk
        .expand(&info, hkdf::HKDF_SHA256)
        .map_err(|_| SigvaultError::KeyDerivationFailure)?;

    let mut bytes = [0u8; KEY_LEN];
    okm.fill(&mut bytes)
        .map_err(|_| SigvaultError::KeyDerivationFailure)?;
    Ok(bytes)
}

// ---------------------------------------------------------------------------
// Data encryption keys
// ---------------------------------------------------------------------------

/// A versioned data encryption key, identified by e.g. `default.v2`.
///
/// Not `Clone`; shared through `Arc` by the field encryption cache.
pub struct DataEncryptionKey {
    key_id: String,
    bytes: [u8; KEY_LEN],
    created_at: DateTime<Utc>,
}

impl DataEncryptionKey {
    /// Generate fresh random key material for `key_id`.
    pub(crate) fn generate(key_id: &str) -> Result<Self, SigvaultError> {
        Ok(Self {
            key_id: key_id.to_string(),
            bytes: crypto::generate_random_key()?,
            created_at: Utc::now(),
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl Drop for DataEncryptionKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for DataEncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataEncryptionKey")
            .field("key_id", &self.key_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// A DEK as persisted: key material encrypted under the wrapping key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedDek {
    pub key_id: String,
    /// base64(IV ‖ wrapped key ‖ tag)
    pub wrapped: String,
    pub created_at: DateTime<Utc>,
}

/// Wrap a DEK for storage. The DEK id is bound as AAD so a wrapped key
/// cannot be replayed under a different id.
pub(crate) fn wrap_dek(
    wrapping: &WrappingKey,
    dek: &DataEncryptionKey,
) -> Result<WrappedDek, SigvaultError> {
    let sealed = crypto::encrypt(&wrapping.bytes, dek.as_bytes(), dek.key_id.as_bytes())?;
    Ok(WrappedDek {
        key_id: dek.key_id.clone(),
        wrapped: STANDARD.encode(sealed),
        created_at: dek.created_at,
    })
}

/// Unwrap a persisted DEK. Fails with `KeyUnwrapFailure` when the master
/// key differs from the one that wrapped it, or the record was altered.
pub(crate) fn unwrap_dek(
    wrapping: &WrappingKey,
    stored: &WrappedDek,
) -> Result<DataEncryptionKey, SigvaultError> {
    let sealed = STANDARD
        .decode(&stored.wrapped)
        .map_err(|_| SigvaultError::KeyUnwrapFailure)?;
    let mut raw = crypto::decrypt(&wrapping.bytes, &sealed, stored.key_id.as_bytes())
        .map_err(|_| SigvaultError::KeyUnwrapFailure)?;
    if raw.len() != KEY_LEN {
        raw.zeroize();
        return Err(SigvaultError::KeyUnwrapFailure);
    }
    let mut bytes = [0u8; KEY_LEN];
    bytes.copy_from_slice(&raw);
    raw.zeroize();
    Ok(DataEncryptionKey {
        key_id: stored.key_id.clone(),
        bytes,
        created_at: stored.created_at,
    })
}
