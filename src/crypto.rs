//! Low-level cryptographic operations.
//!
//! This module is one of exactly two places in the crate that import `ring`
//! directly (the other is `keys`). All other modules sign, hash, encrypt and
//! decrypt exclusively through the functions exposed here.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM (authenticated encryption)
//! - **IV**: 96-bit (12 bytes), generated fresh per operation via `SystemRandom`
//! - **MAC**: HMAC-SHA256
//! - **Digest**: SHA-256

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::digest;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use subtle::ConstantTimeEq;

use crate::error::SigvaultError;

/// The AEAD algorithm used throughout sigvault.
const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// Size of the IV in bytes (96 bits).
pub const IV_LEN: usize = 12;

/// Size of the GCM authentication tag in bytes (128 bits).
pub const TAG_LEN: usize = 16;

/// Size of an AES key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Size of an HMAC-SHA256 output in bytes.
pub const MAC_LEN: usize = 32;

/// An IV generated for a single encryption operation.
/// Newtype to prevent accidental reuse: each `OwnedIv` is consumed on use.
struct OwnedIv(Nonce);

fn generate_iv() -> Result<OwnedIv, SigvaultError> {
    let mut buf = [0u8; IV_LEN];
    fill_random(&mut buf)?;
    Ok(OwnedIv(Nonce::assume_unique_for_key(buf)))
}

/// Fill `buf` from the system CSPRNG.
pub fn fill_random(buf: &mut [u8]) -> Result<(), SigvaultError> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| SigvaultError::RandomnessFailure)
}

/// Encrypt a plaintext using AES-256-GCM, binding `aad` into the tag.
///
/// # Layout of returned bytes
/// ```text
/// [ IV (12 bytes) ][ ciphertext ][ GCM tag (16 bytes) ]
/// ```
pub fn encrypt(
    key_bytes: &[u8; KEY_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, SigvaultError> {
    let unbound = UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| SigvaultError::InvalidKey)?;
    let key = LessSafeKey::new(unbound);

    let iv = generate_iv()?;
    let mut output = Vec::with_capacity(IV_LEN + plaintext.len() + TAG_LEN);
    output.extend_from_slice(iv.0.as_ref());

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(iv.0, Aad::from(aad), &mut in_out)
        .map_err(|_| SigvaultError::EncryptionFailure)?;
    output.extend_from_slice(&in_out);

    Ok(output)
}

/// Decrypt bytes produced by [`encrypt`].
///
/// If the key or `aad` is wrong, or any byte of IV, ciphertext or tag was
/// altered, the GCM check fails and no plaintext is returned.
pub fn decrypt(
    key_bytes: &[u8; KEY_LEN],
    sealed: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, SigvaultError> {
    if sealed.len() < IV_LEN + TAG_LEN {
        return Err(SigvaultError::UnsupportedCiphertextFormat);
    }

    let iv_bytes: [u8; IV_LEN] = sealed[..IV_LEN]
        .try_into()
        .map_err(|_| SigvaultError::UnsupportedCiphertextFormat)?;
    let iv = Nonce::assume_unique_for_key(iv_bytes);

    let unbound = UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| SigvaultError::InvalidKey)?;
    let key = LessSafeKey::new(unbound);

    let mut payload = sealed[IV_LEN..].to_vec();
    let plaintext = key
        .open_in_place(iv, Aad::from(aad), &mut payload)
        .map_err(|_| SigvaultError::DecryptionTamper)?;

    Ok(plaintext.to_vec())
}

/// Generate a cryptographically secure random 256-bit key.
pub fn generate_random_key() -> Result<[u8; KEY_LEN], SigvaultError> {
    let mut key = [0u8; KEY_LEN];
    fill_random(&mut key)?;
    Ok(key)
}

/// HMAC-SHA256 of `data` under `secret`.
pub fn hmac_sha256(secret: &[u8], data: &[u8]) -> [u8; MAC_LEN] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, data);
    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(tag.as_ref());
    out
}

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let d = digest::digest(&digest::SHA256, data);
    let mut out = [0u8; 32];
    out.copy_from_slice(d.as_ref());
    out
}

/// Compare two MACs in constant time.
///
/// Both inputs are fixed-length arrays, so the comparison always touches
/// every byte and has no early exit.
pub fn mac_eq(a: &[u8; MAC_LEN], b: &[u8; MAC_LEN]) -> subtle::Choice {
    a[..].ct_eq(&b[..])
}
