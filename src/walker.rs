//! Sensitive field protection for payloads.
//!
//! Two ways in:
//!
//! - [`SensitiveFieldWalker::encrypt_fields`] / [`decrypt_fields`] walk a
//!   `serde_json::Value` and act on string values stored under a fixed set
//!   of field names. Classification is by name only: a value under an
//!   unlisted name is left in the clear. A value that parses as a blob is
//!   skipped only if it names a DEK this service holds, so a plaintext that
//!   happens to look like `default.v1:<base64>` is still left in the clear.
//! - [`SensitiveFields`] lets a typed record declare its sensitive fields
//!   itself, so nothing depends on naming conventions.
//!
//! [`decrypt_fields`]: SensitiveFieldWalker::decrypt_fields

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::SigvaultError;
use crate::field::FieldEncryptionService;

/// Field names treated as sensitive by default. Matched exactly.
pub const SENSITIVE_FIELDS: [&str; 14] = [
    "password",
    "email",
    "phone",
    "phoneNumber",
    "ssn",
    "socialSecurityNumber",
    "creditCard",
    "bankAccount",
    "apiKey",
    "secretKey",
    "token",
    "personalData",
    "sensitiveData",
    "privateKey",
];

/// A record that knows which of its fields hold sensitive strings.
pub trait SensitiveFields {
    fn sensitive_fields_mut(&mut self) -> Vec<&mut String>;
}

pub struct SensitiveFieldWalker {
    service: Arc<FieldEncryptionService>,
    names: HashSet<String>,
}

impl SensitiveFieldWalker {
    /// Walker over the default [`SENSITIVE_FIELDS`].
    pub fn new(service: Arc<FieldEncryptionService>) -> Self {
        Self::with_fields(service, SENSITIVE_FIELDS)
    }

    pub fn with_fields<I, S>(service: Arc<FieldEncryptionService>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            service,
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_sensitive(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Encrypt every non-empty string under a sensitive name, in place.
    /// Blobs sealed under one of this service's DEKs are left alone, so
    /// walking twice does not double-encrypt. Returns the number of values
    /// encrypted.
    ///
    /// Does nothing when encryption is disabled.
    pub fn encrypt_fields(&self, value: &mut Value) -> Result<usize, SigvaultError> {
        if !self.service.is_enabled() {
            return Ok(0);
        }
        let mut count = 0;
        self.encrypt_value(value, &mut count)?;
        Ok(count)
    }

    /// Decrypt every encrypted-looking string under a sensitive name, in
    /// place. Never fails: a value that does not look encrypted, or fails to
    /// decrypt, is left untouched. Returns the number of values decrypted.
    pub fn decrypt_fields(&self, value: &mut Value) -> usize {
        if !self.service.is_enabled() {
            return 0;
        }
        let mut count = 0;
        self.decrypt_value(value, &mut count);
        count
    }

    /// Encrypt the fields a typed record declares sensitive.
    pub fn protect<T: SensitiveFields + ?Sized>(&self, record: &mut T) -> Result<usize, SigvaultError> {
        if !self.service.is_enabled() {
            return Ok(0);
        }
        let mut count = 0;
        for field in record.sensitive_fields_mut() {
            if self.encrypt_string(field)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Decrypt the fields a typed record declares sensitive. Tolerant in
    /// the same way as [`decrypt_fields`](Self::decrypt_fields).
    pub fn reveal<T: SensitiveFields + ?Sized>(&self, record: &mut T) -> usize {
        if !self.service.is_enabled() {
            return 0;
        }
        let mut count = 0;
        for field in record.sensitive_fields_mut() {
            if self.decrypt_string(field) {
                count += 1;
            }
        }
        count
    }

    fn encrypt_value(&self, value: &mut Value, count: &mut usize) -> Result<(), SigvaultError> {
        match value {
            Value::Object(map) => {
                for (name, child) in map.iter_mut() {
                    if let (true, Value::String(s)) = (self.is_sensitive(name), &mut *child) {
                        if self.encrypt_string(s)? {
                            *count += 1;
                        }
                        continue;
                    }
                    self.encrypt_value(child, count)?;
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.encrypt_value(item, count)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn decrypt_value(&self, value: &mut Value, count: &mut usize) {
        match value {
            Value::Object(map) => {
                for (name, child) in map.iter_mut() {
                    if let (true, Value::String(s)) = (self.is_sensitive(name), &mut *child) {
                        if self.decrypt_string(s) {
                            *count += 1;
                        }
                        continue;
                    }
                    self.decrypt_value(child, count);
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.decrypt_value(item, count);
                }
            }
            _ => {}
        }
    }

    fn encrypt_string(&self, s: &mut String) -> Result<bool, SigvaultError> {
        if s.is_empty() || self.service.is_own_blob(s)? {
            return Ok(false);
        }
        *s = self.service.encrypt(s)?.to_string();
        Ok(true)
    }

    fn decrypt_string(&self, s: &mut String) -> bool {
        if !FieldEncryptionService::looks_encrypted(s) {
            return false;
        }
        match self.service.decrypt_str(s) {
            Ok(plain) => {
                *s = plain;
                true
            }
            Err(err) => {
                debug!(reason = err.reason_code(), "field left encrypted");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::InMemoryDekStore;
    use crate::keys::MasterKey;
    use serde_json::json;

    fn walker() -> SensitiveFieldWalker {
        let service = FieldEncryptionService::new(
            MasterKey::from_bytes([5u8; 32]),
            Arc::new(InMemoryDekStore::new()),
            "default",
        )
        .unwrap();
        SensitiveFieldWalker::new(Arc::new(service))
    }

    #[test]
    fn test_nested_objects_and_arrays() {
        let w = walker();
        let mut doc = json!({
            "name": "alice",
            "email": "alice@example.com",
            "profile": { "phone": "555-0100", "city": "Oslo" },
            "accounts": [ { "bankAccount": "NO93 8601 1117 947" }, { "bankAccount": "" } ],
            "password": 42
        });
        let original = doc.clone();

        assert_eq!(w.encrypt_fields(&mut doc).unwrap(), 3);
        assert_eq!(doc["name"], "alice");
        assert_eq!(doc["profile"]["city"], "Oslo");
        assert_eq!(doc["accounts"][1]["bankAccount"], "");
        assert_eq!(doc["password"], 42);
        assert_ne!(doc["email"], original["email"]);

        assert_eq!(w.decrypt_fields(&mut doc), 3);
        assert_eq!(doc, original);
    }

    #[test]
    fn test_encrypt_twice_is_stable() {
        let w = walker();
        let mut doc = json!({ "token": "abc" });
        w.encrypt_fields(&mut doc).unwrap();
        let once = doc.clone();
        assert_eq!(w.encrypt_fields(&mut doc).unwrap(), 0);
        assert_eq!(doc, once);
    }

    #[test]
    fn test_blob_shaped_plaintext_still_encrypted() {
        let w = walker();
        let lookalike = format!("x.v1:{}", "A".repeat(40));
        let mut doc = json!({ "token": lookalike });
        assert_eq!(w.encrypt_fields(&mut doc).unwrap(), 1);
        assert_ne!(doc["token"], lookalike.as_str());
        assert_eq!(w.decrypt_fields(&mut doc), 1);
        assert_eq!(doc["token"], lookalike.as_str());
    }

    #[test]
    fn test_decrypt_tolerates_plain_values() {
        let w = walker();
        let mut doc = json!({ "email": "bob@example.com", "token": "default.v9:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA" });
        assert_eq!(w.decrypt_fields(&mut doc), 0);
        assert_eq!(doc["email"], "bob@example.com");
    }

    struct Credential {
        username: String,
        secret: String,
    }

    impl SensitiveFields for Credential {
        fn sensitive_fields_mut(&mut self) -> Vec<&mut String> {
            vec![&mut self.secret]
        }
    }

    #[test]
    fn test_typed_record_protect_reveal() {
        let w = walker();
        let mut cred = Credential {
            username: "svc".into(),
            secret: "hunter2".into(),
        };
        assert_eq!(w.protect(&mut cred).unwrap(), 1);
        assert_eq!(cred.username, "svc");
        assert!(FieldEncryptionService::looks_encrypted(&cred.secret));
        assert_eq!(w.reveal(&mut cred), 1);
        assert_eq!(cred.secret, "hunter2");
    }
}
