use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sigvault::{
    EncryptionConfig, FieldEncryptionService, InMemoryDekStore, SensitiveFieldWalker,
    SensitiveFields, SENSITIVE_FIELDS,
};

fn walker_with(config: EncryptionConfig) -> SensitiveFieldWalker {
    let service =
        FieldEncryptionService::from_config(&config, Arc::new(InMemoryDekStore::new())).unwrap();
    SensitiveFieldWalker::new(Arc::new(service))
}

fn walker() -> SensitiveFieldWalker {
    walker_with(EncryptionConfig::default())
}

#[test]
fn test_every_listed_name_is_encrypted() {
    let w = walker();
    let mut doc = serde_json::Value::Object(
        SENSITIVE_FIELDS
            .iter()
            .map(|name| (name.to_string(), json!(format!("value-of-{name}"))))
            .collect(),
    );
    assert_eq!(w.encrypt_fields(&mut doc).unwrap(), SENSITIVE_FIELDS.len());
    for name in SENSITIVE_FIELDS {
        let value = doc[name].as_str().unwrap();
        assert!(!value.contains("value-of-"), "{name} left in clear");
        assert!(FieldEncryptionService::looks_encrypted(value));
    }
    assert_eq!(w.decrypt_fields(&mut doc), SENSITIVE_FIELDS.len());
    assert_eq!(doc["apiKey"], "value-of-apiKey");
}

#[test]
fn test_name_match_is_exact() {
    let w = walker();
    let mut doc = json!({
        "Password": "kept",
        "user_email": "kept@example.com",
        "emailVerified": true,
        "notes": "mentions my password is hunter2"
    });
    let before = doc.clone();
    assert_eq!(w.encrypt_fields(&mut doc).unwrap(), 0);
    assert_eq!(doc, before);
}

#[test]
fn test_deeply_nested_payload() {
    let w = walker();
    let mut doc = json!({
        "user": {
            "profile": {
                "contact": { "email": "deep@example.com", "phone": "555-0199" }
            },
            "devices": [
                { "token": "push-1", "platform": "ios" },
                { "token": "push-2", "platform": "android" },
                "loose string",
                [ { "privateKey": "-----BEGIN KEY-----" } ]
            ]
        }
    });
    let before = doc.clone();
    assert_eq!(w.encrypt_fields(&mut doc).unwrap(), 5);
    assert_eq!(doc["user"]["devices"][0]["platform"], "ios");
    assert_eq!(doc["user"]["devices"][2], "loose string");
    assert_eq!(w.decrypt_fields(&mut doc), 5);
    assert_eq!(doc, before);
}

#[test]
fn test_sensitive_name_holding_object_is_walked() {
    let w = walker();
    let mut doc = json!({
        "personalData": { "email": "x@example.com", "age": 40 }
    });
    assert_eq!(w.encrypt_fields(&mut doc).unwrap(), 1);
    assert_eq!(doc["personalData"]["age"], 40);
}

#[test]
fn test_disabled_encryption_is_noop() {
    let w = walker_with(EncryptionConfig {
        enabled: false,
        ..EncryptionConfig::default()
    });
    let mut doc = json!({ "password": "hunter2" });
    assert_eq!(w.encrypt_fields(&mut doc).unwrap(), 0);
    assert_eq!(doc["password"], "hunter2");
}

#[test]
fn test_decrypt_leaves_foreign_or_plain_values() {
    let encrypting = walker();
    let other = walker();

    let mut doc = json!({ "token": "abc" });
    encrypting.encrypt_fields(&mut doc).unwrap();
    let sealed = doc.clone();

    // A service with different keys cannot read it and must not fail.
    assert_eq!(other.decrypt_fields(&mut doc), 0);
    assert_eq!(doc, sealed);

    let mut plain = json!({ "token": "not-encrypted", "email": "" });
    assert_eq!(other.decrypt_fields(&mut plain), 0);
    assert_eq!(plain, json!({ "token": "not-encrypted", "email": "" }));
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MusicCredential {
    provider: String,
    access_token: String,
    refresh_token: String,
    scopes: Vec<String>,
}

impl SensitiveFields for MusicCredential {
    fn sensitive_fields_mut(&mut self) -> Vec<&mut String> {
        vec![&mut self.access_token, &mut self.refresh_token]
    }
}

#[test]
fn test_typed_record_fields_are_declared_not_guessed() {
    let w = walker();
    let original = MusicCredential {
        provider: "spotify".into(),
        access_token: "BQD...access".into(),
        refresh_token: "AQC...refresh".into(),
        scopes: vec!["playlist-read-private".into()],
    };

    let mut record = original.clone();
    assert_eq!(w.protect(&mut record).unwrap(), 2);
    assert_eq!(record.provider, "spotify");
    assert_ne!(record.access_token, original.access_token);

    // The name-based walker would have missed these fields.
    let mut as_json = serde_json::to_value(&original).unwrap();
    assert_eq!(w.encrypt_fields(&mut as_json).unwrap(), 0);

    let stored = serde_json::to_string(&record).unwrap();
    let mut loaded: MusicCredential = serde_json::from_str(&stored).unwrap();
    assert_eq!(w.reveal(&mut loaded), 2);
    assert_eq!(loaded, original);
}
