//! API key registry.
//!
//! Maps a key identifier to the shared secret its holder signs with. The
//! verifier never talks to storage directly: it consults a [`SecretLookup`],
//! which [`KeyStore`] implements in memory and which an adapter over an
//! external secret store can implement just as well.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::info;
use zeroize::Zeroizing;

use crate::clock::{Clock, SystemClock};
use crate::error::SigvaultError;

/// Shared secret bytes. Zeroised on drop, redacted in `Debug`.
#[derive(Clone)]
pub struct ApiSecret(Zeroizing<Vec<u8>>);

impl ApiSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(bytes.into()))
    }

    pub(crate) fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for ApiSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiSecret(<redacted>)")
    }
}

/// The secrets a key id currently verifies under.
///
/// `previous` is only present while a rotation grace period is open.
#[derive(Debug, Clone)]
pub struct SigningSecrets {
    pub current: ApiSecret,
    pub previous: Option<ApiSecret>,
}

/// Narrow lookup interface onto whatever holds the shared secrets.
pub trait SecretLookup: Send + Sync {
    /// Secrets for an active key, or `None` if unknown or inactive.
    fn lookup(&self, key_id: &str) -> Option<SigningSecrets>;
}

#[derive(Clone)]
struct RetiringSecret {
    secret: ApiSecret,
    retire_at: i64,
}

/// A registered API key.
#[derive(Clone)]
pub struct ApiKeyRecord {
    key_id: String,
    secret: ApiSecret,
    active: bool,
    created_at: DateTime<Utc>,
    previous: Option<RetiringSecret>,
}

impl ApiKeyRecord {
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl std::fmt::Debug for ApiKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyRecord")
            .field("key_id", &self.key_id)
            .field("active", &self.active)
            .field("created_at", &self.created_at)
            .field("rotating", &self.previous.is_some())
            .finish_non_exhaustive()
    }
}

/// Check that a key id can be embedded in a canonical string and a header.
pub(crate) fn validate_key_id(key_id: &str) -> Result<(), SigvaultError> {
    if key_id.is_empty()
        || key_id.len() > 128
        || !key_id.chars().all(|c| c.is_ascii_graphic() && c != ':')
    {
        return Err(SigvaultError::InvalidKeyId(key_id.escape_debug().to_string()));
    }
    Ok(())
}

/// In-memory, concurrent key registry.
pub struct KeyStore {
    records: DashMap<String, ApiKeyRecord>,
    clock: Arc<dyn Clock>,
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    /// Register (or replace) a key. Replacing drops any rotation in progress.
    pub fn register(&self, key_id: &str, secret: impl Into<Vec<u8>>) -> Result<(), SigvaultError> {
        validate_key_id(key_id)?;
        let secret = secret.into();
        if secret.is_empty() {
            return Err(SigvaultError::InvalidKey);
        }
        self.records.insert(
            key_id.to_string(),
            ApiKeyRecord {
                key_id: key_id.to_string(),
                secret: ApiSecret::new(secret),
                active: true,
                created_at: Utc::now(),
                previous: None,
            },
        );
        info!(key_id, "registered api key");
        Ok(())
    }

    /// Remove a key. Returns whether it existed.
    pub fn revoke(&self, key_id: &str) -> bool {
        let existed = self.records.remove(key_id).is_some();
        if existed {
            info!(key_id, "revoked api key");
        }
        existed
    }

    /// Stop accepting signatures for a key without forgetting it.
    pub fn deactivate(&self, key_id: &str) -> bool {
        self.set_active(key_id, false)
    }

    pub fn activate(&self, key_id: &str) -> bool {
        self.set_active(key_id, true)
    }

    fn set_active(&self, key_id: &str, active: bool) -> bool {
        match self.records.get_mut(key_id) {
            Some(mut record) => {
                record.active = active;
                info!(key_id, active, "changed api key state");
                true
            }
            None => false,
        }
    }

    /// Replace a key's secret. Signatures made with the old secret keep
    /// verifying for `grace`; signing switches to the new secret at once.
    pub fn rotate(
        &self,
        key_id: &str,
        new_secret: impl Into<Vec<u8>>,
        grace: Duration,
    ) -> Result<(), SigvaultError> {
        let new_secret = new_secret.into();
        if new_secret.is_empty() {
            return Err(SigvaultError::InvalidKey);
        }
        let mut record = self
            .records
            .get_mut(key_id)
            .ok_or(SigvaultError::UnknownKey)?;
        let grace_secs = i64::try_from(grace.as_secs()).unwrap_or(i64::MAX);
        let retire_at = self.clock.now_secs().saturating_add(grace_secs);
        let old = std::mem::replace(&mut record.secret, ApiSecret::new(new_secret));
        record.previous = Some(RetiringSecret {
            secret: old,
            retire_at,
        });
        info!(key_id, grace_secs, "rotated api key secret");
        Ok(())
    }

    /// A snapshot of a key's record. The secret stays inside it.
    pub fn record(&self, key_id: &str) -> Option<ApiKeyRecord> {
        self.records.get(key_id).map(|r| r.value().clone())
    }

    pub fn contains(&self, key_id: &str) -> bool {
        self.records.contains_key(key_id)
    }

    /// Registered key ids, sorted. Secrets are never listed.
    pub fn key_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl SecretLookup for KeyStore {
    fn lookup(&self, key_id: &str) -> Option<SigningSecrets> {
        let record = self.records.get(key_id)?;
        if !record.active {
            return None;
        }
        let now = self.clock.now_secs();
        let previous = record
            .previous
            .as_ref()
            .filter(|p| p.retire_at > now)
            .map(|p| p.secret.clone());
        Some(SigningSecrets {
            current: record.secret.clone(),
            previous,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_register_lookup_revoke() {
        let store = KeyStore::new();
        store.register("client-001", "secret").unwrap();

        let secrets = store.lookup("client-001").unwrap();
        assert_eq!(secrets.current.expose(), b"secret");
        assert!(secrets.previous.is_none());

        assert!(store.revoke("client-001"));
        assert!(store.lookup("client-001").is_none());
        assert!(!store.revoke("client-001"));
    }

    #[test]
    fn test_inactive_key_is_not_returned() {
        let store = KeyStore::new();
        store.register("client-001", "secret").unwrap();
        assert!(store.deactivate("client-001"));
        assert!(store.lookup("client-001").is_none());
        assert!(store.contains("client-001"));
        assert!(store.activate("client-001"));
        assert!(store.lookup("client-001").is_some());
    }

    #[test]
    fn test_rotation_grace_period() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = KeyStore::with_clock(clock.clone());
        store.register("client-001", "old").unwrap();
        store
            .rotate("client-001", "new", Duration::from_secs(60))
            .unwrap();

        let during = store.lookup("client-001").unwrap();
        assert_eq!(during.current.expose(), b"new");
        assert_eq!(during.previous.unwrap().expose(), b"old");

        clock.advance(60);
        let after = store.lookup("client-001").unwrap();
        assert!(after.previous.is_none());
    }

    #[test]
    fn test_invalid_key_ids_rejected() {
        let store = KeyStore::new();
        assert!(store.register("", "s").is_err());
        assert!(store.register("a\nb", "s").is_err());
        assert!(store.register("has space", "s").is_err());
        assert!(store.register("a:b", "s").is_err());
        assert!(store.register("ok", "").is_err());
    }

    #[test]
    fn test_debug_never_prints_secret() {
        let store = KeyStore::new();
        store.register("client-001", "super-secret-value").unwrap();
        let record = store.record("client-001").unwrap();
        assert!(record.is_active());
        let text = format!("{record:?} {:?}", store.lookup("client-001").unwrap());
        assert!(!text.contains("super-secret-value"));
    }

    #[test]
    fn test_key_ids_sorted() {
        let store = KeyStore::new();
        store.register("b", "s").unwrap();
        store.register("a", "s").unwrap();
        assert_eq!(store.key_ids(), vec!["a".to_string(), "b".to_string()]);
    }
}
