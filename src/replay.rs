//! Time-bucketed replay protection.
//!
//! A nonce is tracked per key id through `timestamp + window` inclusive, the
//! last second the timestamp check still accepts it. Entries live in
//! two places:
//!
//! - `seen`: a sharded concurrent map from `(key id, nonce)` to expiry, used
//!   for the freshness check and the atomic insert.
//! - `buckets`: expiry buckets keyed by `expires_at / bucket_width`. Pruning
//!   pops whole buckets from the front once every entry in them has
//!   expired, so it never rescans live nonces.
//!
//! The store is never cleared wholesale. When it is full of unexpired
//! nonces, new requests are refused rather than forgetting old ones.

use std::collections::BTreeMap;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ReplayConfig;
use crate::error::SigvaultError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NonceKey {
    key_id: String,
    nonce: String,
}

impl NonceKey {
    fn new(key_id: &str, nonce: &str) -> Self {
        Self {
            key_id: key_id.to_string(),
            nonce: nonce.to_string(),
        }
    }
}

/// A `(key id, nonce)` record and its expiry, as returned by inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceRecord {
    pub key_id: String,
    pub nonce: String,
    pub expires_at: i64,
}

/// Concurrent nonce store.
pub struct ReplayGuard {
    window_secs: i64,
    bucket_width: i64,
    max_entries: usize,
    seen: DashMap<NonceKey, i64>,
    buckets: Mutex<BTreeMap<i64, Vec<NonceKey>>>,
}

impl ReplayGuard {
    pub fn new(window_secs: u64, config: &ReplayConfig) -> Self {
        Self {
            window_secs: i64::try_from(window_secs).unwrap_or(i64::MAX / 2),
            bucket_width: i64::try_from(config.bucket_width_secs.max(1)).unwrap_or(i64::MAX),
            max_entries: config.max_tracked_nonces.max(1),
            seen: DashMap::new(),
            buckets: Mutex::new(BTreeMap::new()),
        }
    }

    /// Whether `(key_id, nonce)` was accepted and is still unexpired.
    pub fn is_replayed(&self, key_id: &str, nonce: &str, now: i64) -> bool {
        self.seen
            .get(&NonceKey::new(key_id, nonce))
            .is_some_and(|expires_at| *expires_at >= now)
    }

    /// Record `(key_id, nonce)` as used through `timestamp + window`.
    ///
    /// Atomic: of two concurrent calls with the same pair, exactly one
    /// succeeds and the other gets `NonceReplayed`.
    pub fn record(
        &self,
        key_id: &str,
        nonce: &str,
        timestamp: i64,
        now: i64,
    ) -> Result<(), SigvaultError> {
        self.prune(now);

        if self.seen.len() >= self.max_entries {
            warn!(
                tracked = self.seen.len(),
                "replay store full of unexpired nonces"
            );
            return Err(SigvaultError::ReplayStoreSaturated);
        }

        let key = NonceKey::new(key_id, nonce);
        let expires_at = timestamp.saturating_add(self.window_secs);

        // The shard lock is released before the bucket lock is taken; prune
        // takes them in the opposite order.
        match self.seen.entry(key.clone()) {
            Entry::Occupied(mut existing) => {
                if *existing.get() >= now {
                    return Err(SigvaultError::NonceReplayed);
                }
                existing.insert(expires_at);
            }
            Entry::Vacant(slot) => {
                slot.insert(expires_at);
            }
        }

        self.buckets
            .lock()
            .entry(expires_at.div_euclid(self.bucket_width))
            .or_default()
            .push(key);
        Ok(())
    }

    /// Drop every bucket whose entries have all expired.
    pub fn prune(&self, now: i64) -> usize {
        let mut removed = 0;
        let mut buckets = self.buckets.lock();
        while let Some((&index, _)) = buckets.first_key_value() {
            // Last expiry the bucket can hold is `bucket_end - 1`.
            let bucket_end = index.saturating_add(1).saturating_mul(self.bucket_width);
            if bucket_end > now {
                break;
            }
            if let Some((_, keys)) = buckets.pop_first() {
                for key in keys {
                    // A pair re-recorded after expiry carries a newer expiry
                    // in a later bucket; leave it alone.
                    if self
                        .seen
                        .remove_if(&key, |_, expires_at| *expires_at < now)
                        .is_some()
                    {
                        removed += 1;
                    }
                }
            }
        }
        if removed > 0 {
            debug!(removed, "pruned expired nonces");
        }
        removed
    }

    /// Number of nonces currently held (expired but unpruned included).
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Snapshot of held records, for diagnostics.
    pub fn records(&self) -> Vec<NonceRecord> {
        self.seen
            .iter()
            .map(|e| NonceRecord {
                key_id: e.key().key_id.clone(),
                nonce: e.key().nonce.clone(),
                expires_at: *e.value(),
            })
            .collect()
    }
}
