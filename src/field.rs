//! Field-level authenticated encryption.
//!
//! Individual string values are sealed with AES-256-GCM under a versioned
//! data encryption key (DEK). Every blob names the DEK that sealed it, so a
//! rotation never strands older data:
//!
//! ```text
//! default.v2:base64( IV (12) ‖ ciphertext ‖ tag (16) )
//! ```
//!
//! The DEK id is also bound as AAD, so a blob relabelled with another id
//! fails authentication. DEKs are persisted wrapped under the master key
//! through a [`DekStore`] and cached unwrapped for the life of the service.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EncryptionConfig;
use crate::crypto::{self, IV_LEN, MAC_LEN, TAG_LEN};
use crate::error::SigvaultError;
use crate::keys::{self, DataEncryptionKey, MasterKey, SearchKey, WrappedDek, WrappingKey};

// ---------------------------------------------------------------------------
// DEK ids
// ---------------------------------------------------------------------------

fn validate_key_name(name: &str) -> Result<(), SigvaultError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SigvaultError::InvalidKeyId(name.escape_debug().to_string()))
    }
}

fn dek_id(name: &str, version: u32) -> String {
    format!("{name}.v{version}")
}

/// Split `name.vN` into its logical name and version.
fn parse_dek_id(id: &str) -> Result<(&str, u32), SigvaultError> {
    let invalid = || SigvaultError::InvalidKeyId(id.escape_debug().to_string());
    let (name, version) = id.rsplit_once(".v").ok_or_else(invalid)?;
    validate_key_name(name).map_err(|_| invalid())?;
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    match version.parse::<u32>() {
        Ok(v) if v > 0 => Ok((name, v)),
        _ => Err(invalid()),
    }
}

// ---------------------------------------------------------------------------
// Encrypted blob
// ---------------------------------------------------------------------------

/// A sealed field value and the id of the DEK that sealed it.
///
/// Text form is `<dek-id>:<base64>`; that is also its serde representation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EncryptedBlob {
    key_id: String,
    bytes: Vec<u8>,
}

impl EncryptedBlob {
    /// Assemble a blob from a DEK id and `IV ‖ ciphertext ‖ tag` bytes.
    pub fn from_parts(key_id: impl Into<String>, bytes: Vec<u8>) -> Result<Self, SigvaultError> {
        let key_id = key_id.into();
        parse_dek_id(&key_id).map_err(|_| SigvaultError::UnsupportedCiphertextFormat)?;
        if bytes.len() < IV_LEN + TAG_LEN {
            return Err(SigvaultError::UnsupportedCiphertextFormat);
        }
        Ok(Self { key_id, bytes })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_parts(self) -> (String, Vec<u8>) {
        (self.key_id, self.bytes)
    }
}

impl fmt::Display for EncryptedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key_id, STANDARD.encode(&self.bytes))
    }
}

impl fmt::Debug for EncryptedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedBlob")
            .field("key_id", &self.key_id)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl FromStr for EncryptedBlob {
    type Err = SigvaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key_id, encoded) = s
            .split_once(':')
            .ok_or(SigvaultError::UnsupportedCiphertextFormat)?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|_| SigvaultError::UnsupportedCiphertextFormat)?;
        Self::from_parts(key_id, bytes)
    }
}

impl TryFrom<String> for EncryptedBlob {
    type Error = SigvaultError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EncryptedBlob> for String {
    fn from(blob: EncryptedBlob) -> Self {
        blob.to_string()
    }
}

// ---------------------------------------------------------------------------
// DEK persistence
// ---------------------------------------------------------------------------

/// Storage for wrapped DEKs and the active version of each logical name.
///
/// Implementations only ever see wrapped key material.
pub trait DekStore: Send + Sync {
    fn load(&self, dek_id: &str) -> Result<Option<WrappedDek>, SigvaultError>;

    fn save(&self, dek: WrappedDek) -> Result<(), SigvaultError>;

    /// Returns whether a record was removed.
    fn remove(&self, dek_id: &str) -> Result<bool, SigvaultError>;

    fn active_version(&self, name: &str) -> Result<Option<u32>, SigvaultError>;

    fn set_active_version(&self, name: &str, version: u32) -> Result<(), SigvaultError>;
}

/// Process-local DEK store. Keys do not survive a restart.
#[derive(Default)]
pub struct InMemoryDekStore {
    keys: DashMap<String, WrappedDek>,
    active: DashMap<String, u32>,
}

impl InMemoryDekStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DekStore for InMemoryDekStore {
    fn load(&self, dek_id: &str) -> Result<Option<WrappedDek>, SigvaultError> {
        Ok(self.keys.get(dek_id).map(|e| e.value().clone()))
    }

    fn save(&self, dek: WrappedDek) -> Result<(), SigvaultError> {
        self.keys.insert(dek.key_id.clone(), dek);
        Ok(())
    }

    fn remove(&self, dek_id: &str) -> Result<bool, SigvaultError> {
        Ok(self.keys.remove(dek_id).is_some())
    }

    fn active_version(&self, name: &str) -> Result<Option<u32>, SigvaultError> {
        Ok(self.active.get(name).map(|v| *v))
    }

    fn set_active_version(&self, name: &str, version: u32) -> Result<(), SigvaultError> {
        self.active.insert(name.to_string(), version);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DekFile {
    #[serde(default)]
    active: BTreeMap<String, u32>,
    #[serde(default)]
    keys: BTreeMap<String, WrappedDek>,
}

/// DEK store backed by a single JSON file.
///
/// The whole file is rewritten on every change, through a temporary file
/// and a rename, so a crash never leaves it half written.
pub struct JsonFileDekStore {
    path: PathBuf,
    state: Mutex<DekFile>,
}

impl JsonFileDekStore {
    /// Open `path`, or start empty if it does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SigvaultError> {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| SigvaultError::KeyStorage(format!("corrupt key file: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => DekFile::default(),
            Err(e) => return Err(SigvaultError::KeyStorage(e.to_string())),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, state: &DekFile) -> Result<(), SigvaultError> {
        let raw = serde_json::to_vec_pretty(state)
            .map_err(|e| SigvaultError::KeyStorage(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, raw).map_err(|e| SigvaultError::KeyStorage(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| SigvaultError::KeyStorage(e.to_string()))
    }
}

impl DekStore for JsonFileDekStore {
    fn load(&self, dek_id: &str) -> Result<Option<WrappedDek>, SigvaultError> {
        Ok(self.state.lock().keys.get(dek_id).cloned())
    }

    fn save(&self, dek: WrappedDek) -> Result<(), SigvaultError> {
        let mut state = self.state.lock();
        state.keys.insert(dek.key_id.clone(), dek);
        self.persist(&state)
    }

    fn remove(&self, dek_id: &str) -> Result<bool, SigvaultError> {
        let mut state = self.state.lock();
        if state.keys.remove(dek_id).is_none() {
            return Ok(false);
        }
        self.persist(&state)?;
        Ok(true)
    }

    fn active_version(&self, name: &str) -> Result<Option<u32>, SigvaultError> {
        Ok(self.state.lock().active.get(name).copied())
    }

    fn set_active_version(&self, name: &str, version: u32) -> Result<(), SigvaultError> {
        let mut state = self.state.lock();
        state.active.insert(name.to_string(), version);
        self.persist(&state)
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Encrypts and decrypts single string values.
pub struct FieldEncryptionService {
    wrapping: WrappingKey,
    search: SearchKey,
    store: Arc<dyn DekStore>,
    cache: DashMap<String, Arc<DataEncryptionKey>>,
    default_name: String,
    enabled: bool,
    /// Serialises DEK creation and activation.
    admin: Mutex<()>,
}

impl FieldEncryptionService {
    /// Build a service whose DEKs are wrapped under `master`.
    pub fn new(
        master: MasterKey,
        store: Arc<dyn DekStore>,
        default_name: &str,
    ) -> Result<Self, SigvaultError> {
        validate_key_name(default_name)?;
        Ok(Self {
            wrapping: keys::derive_wrapping_key(&master)?,
            search: keys::derive_search_key(&master)?,
            store,
            cache: DashMap::new(),
            default_name: default_name.to_string(),
            enabled: true,
            admin: Mutex::new(()),
        })
    }

    /// Build from configuration. Without a configured master key a random
    /// one is generated, and nothing it protects is readable after a restart.
    pub fn from_config(
        config: &EncryptionConfig,
        store: Arc<dyn DekStore>,
    ) -> Result<Self, SigvaultError> {
        let master = match &config.master_key {
            Some(encoded) => MasterKey::from_base64(encoded)?,
            None => {
                warn!("no master key configured; using an ephemeral key, encrypted fields will not survive a restart");
                MasterKey::from_bytes(crypto::generate_random_key()?)
            }
        };
        let mut service = Self::new(master, store, &config.default_key_id)?;
        service.enabled = config.enabled;
        Ok(service)
    }

    /// Whether payload walking should apply this service.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn default_key_name(&self) -> &str {
        &self.default_name
    }

    /// Encrypt under the active DEK of the default name.
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedBlob, SigvaultError> {
        self.encrypt_with(&self.default_name, plaintext)
    }

    /// Encrypt under the active DEK of `name`, creating `name.v1` on first use.
    pub fn encrypt_with(&self, name: &str, plaintext: &str) -> Result<EncryptedBlob, SigvaultError> {
        validate_key_name(name)?;
        let id = self.ensure_active(name)?;
        let dek = self.key(&id)?;
        let bytes = crypto::encrypt(dek.as_bytes(), plaintext.as_bytes(), id.as_bytes())?;
        Ok(EncryptedBlob { key_id: id, bytes })
    }

    /// Decrypt a blob with the DEK it names.
    ///
    /// Any alteration of IV, ciphertext, tag or key id yields
    /// `DecryptionTamper`; no partial plaintext is ever returned.
    pub fn decrypt(&self, blob: &EncryptedBlob) -> Result<String, SigvaultError> {
        let dek = self.key(&blob.key_id)?;
        let raw = crypto::decrypt(dek.as_bytes(), &blob.bytes, blob.key_id.as_bytes())?;
        String::from_utf8(raw).map_err(|_| SigvaultError::UnsupportedCiphertextFormat)
    }

    /// Parse and decrypt the text form of a blob.
    pub fn decrypt_str(&self, blob: &str) -> Result<String, SigvaultError> {
        self.decrypt(&blob.parse()?)
    }

    /// Heuristic: `true` if `value` has the shape of a blob (a DEK id, a
    /// colon, and base64 long enough for an IV and tag). Says nothing about
    /// whether it will decrypt.
    pub fn looks_encrypted(value: &str) -> bool {
        value.parse::<EncryptedBlob>().is_ok()
    }

    /// `true` if `value` parses as a blob whose DEK this service holds.
    /// A blob-shaped plaintext naming an unknown DEK is `false`.
    pub fn is_own_blob(&self, value: &str) -> Result<bool, SigvaultError> {
        let Ok(blob) = value.parse::<EncryptedBlob>() else {
            return Ok(false);
        };
        if self.cache.contains_key(&blob.key_id) {
            return Ok(true);
        }
        Ok(self.store.load(&blob.key_id)?.is_some())
    }

    /// Deterministic keyed hash of `value` for equality lookups on an
    /// encrypted column, e.g. finding a user by email.
    ///
    /// ```text
    /// base64( HMAC-SHA256(search_key, value) )
    /// ```
    ///
    /// The search key is derived from the master key, not from a DEK, so
    /// hashes survive DEK rotation. `None` for an empty value.
    pub fn searchable_hash(&self, value: &str) -> Option<String> {
        if value.is_empty() {
            return None;
        }
        let mac = crypto::hmac_sha256(self.search.as_bytes(), value.as_bytes());
        Some(STANDARD.encode(mac))
    }

    /// Whether `hash` is the searchable hash of `value`. Constant time in
    /// the hash contents.
    pub fn verify_hash(&self, value: &str, hash: &str) -> bool {
        if value.is_empty() {
            return false;
        }
        let mut presented = [0u8; MAC_LEN];
        match STANDARD.decode(hash.trim()) {
            Ok(bytes) if bytes.len() == MAC_LEN => presented.copy_from_slice(&bytes),
            _ => return false,
        }
        let expected = crypto::hmac_sha256(self.search.as_bytes(), value.as_bytes());
        bool::from(crypto::mac_eq(&expected, &presented))
    }

    /// The active DEK id for `name`, if one has been created.
    pub fn active_key_id(&self, name: &str) -> Result<Option<String>, SigvaultError> {
        validate_key_name(name)?;
        Ok(self.store.active_version(name)?.map(|v| dek_id(name, v)))
    }

    /// Create the next DEK version for `name` and make it active. Older
    /// versions stay available for decryption until retired.
    pub fn rotate(&self, name: &str) -> Result<String, SigvaultError> {
        validate_key_name(name)?;
        let _guard = self.admin.lock();
        let mut version = self.store.active_version(name)?.unwrap_or(0) + 1;
        while self.store.load(&dek_id(name, version))?.is_some() {
            version += 1;
        }
        let id = dek_id(name, version);
        self.create(&id)?;
        self.store.set_active_version(name, version)?;
        info!(dek_id = %id, "data encryption key rotated");
        Ok(id)
    }

    /// Remove a non-active DEK version. Blobs sealed under it become
    /// unreadable.
    pub fn retire(&self, id: &str) -> Result<(), SigvaultError> {
        let (name, version) = parse_dek_id(id)?;
        let _guard = self.admin.lock();
        if self.store.active_version(name)? == Some(version) {
            return Err(SigvaultError::DataKeyActive(id.to_string()));
        }
        if !self.store.remove(id)? {
            return Err(SigvaultError::DataKeyNotFound(id.to_string()));
        }
        self.cache.remove(id);
        info!(dek_id = %id, "data encryption key retired");
        Ok(())
    }

    fn ensure_active(&self, name: &str) -> Result<String, SigvaultError> {
        if let Some(version) = self.store.active_version(name)? {
            return Ok(dek_id(name, version));
        }
        let _guard = self.admin.lock();
        if let Some(version) = self.store.active_version(name)? {
            return Ok(dek_id(name, version));
        }
        let id = dek_id(name, 1);
        self.create(&id)?;
        self.store.set_active_version(name, 1)?;
        info!(dek_id = %id, "data encryption key created");
        Ok(id)
    }

    /// Generate, wrap, persist and cache a new DEK. Caller holds `admin`.
    fn create(&self, id: &str) -> Result<(), SigvaultError> {
        let dek = DataEncryptionKey::generate(id)?;
        self.store.save(keys::wrap_dek(&self.wrapping, &dek)?)?;
        self.cache.insert(id.to_string(), Arc::new(dek));
        Ok(())
    }

    fn key(&self, id: &str) -> Result<Arc<DataEncryptionKey>, SigvaultError> {
        if let Some(dek) = self.cache.get(id) {
            return Ok(Arc::clone(dek.value()));
        }
        let entry = self.cache.entry(id.to_string()).or_try_insert_with(|| {
            let stored = self
                .store
                .load(id)?
                .ok_or_else(|| SigvaultError::DataKeyNotFound(id.to_string()))?;
            debug!(dek_id = id, "data encryption key unwrapped");
            keys::unwrap_dek(&self.wrapping, &stored).map(Arc::new)
        })?;
        Ok(Arc::clone(entry.value()))
    }
}

impl fmt::Debug for FieldEncryptionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldEncryptionService")
            .field("default_name", &self.default_name)
            .field("enabled", &self.enabled)
            .field("cached_keys", &self.cache.len())
            .finish_non_exhaustive()
    }
}
