//! Configuration with validation.
//!
//! Every field has a default except the missing-header policy, which has
//! materially different security postures in its two settings and must be
//! chosen explicitly.

use serde::{Deserialize, Serialize};

use crate::canonical::Canonicalizer;
use crate::error::SigvaultError;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigvaultConfig {
    pub signature: SignatureConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
}

impl SigvaultConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, SigvaultError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SigvaultError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SigvaultError> {
        self.signature.validate()?;
        self.encryption.validate()
    }
}

/// What the interceptor does with a request that lacks any of the four
/// protocol headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingHeaderPolicy {
    /// Forward the request unauthenticated (no `SignatureVerified` marker).
    /// Keeps unsigned legacy callers working.
    PassThrough,
    /// Answer 401.
    Reject,
}

/// Request signing and verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureConfig {
    /// When false the interceptor forwards everything untouched.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub headers: HeaderNames,
    /// Maximum |now - timestamp| in seconds.
    #[serde(default = "default_validity_window")]
    pub validity_window_secs: u64,
    /// Headers whose lower-cased name starts with this are signed.
    #[serde(default = "default_signed_header_prefix")]
    pub signed_header_prefix: String,
    pub missing_headers: MissingHeaderPolicy,
    #[serde(default)]
    pub bypass: BypassConfig,
    /// Largest body the interceptor will buffer.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub replay: ReplayConfig,
}

impl SignatureConfig {
    /// Defaults for everything but the missing-header policy.
    pub fn new(missing_headers: MissingHeaderPolicy) -> Self {
        Self {
            enabled: true,
            headers: HeaderNames::default(),
            validity_window_secs: default_validity_window(),
            signed_header_prefix: default_signed_header_prefix(),
            missing_headers,
            bypass: BypassConfig::default(),
            max_body_bytes: default_max_body_bytes(),
            replay: ReplayConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), SigvaultError> {
        if self.validity_window_secs == 0 {
            return Err(SigvaultError::InvalidConfig(
                "validity_window_secs cannot be 0".into(),
            ));
        }
        if self.validity_window_secs > i64::MAX as u64 / 2 {
            return Err(SigvaultError::InvalidConfig(
                "validity_window_secs too large".into(),
            ));
        }
        if self.signed_header_prefix.is_empty() {
            return Err(SigvaultError::InvalidConfig(
                "signed_header_prefix cannot be empty".into(),
            ));
        }
        if self.max_body_bytes == 0 {
            return Err(SigvaultError::InvalidConfig(
                "max_body_bytes cannot be 0".into(),
            ));
        }
        self.headers.validate()?;
        self.bypass.validate()?;
        self.replay.validate()
    }

    /// The canonicalizer matching this configuration. Protocol headers are
    /// never part of the signed header set.
    pub fn canonicalizer(&self) -> Canonicalizer {
        Canonicalizer::new(&self.signed_header_prefix, self.headers.all())
    }
}

/// Names of the four protocol headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderNames {
    pub key_id: String,
    pub signature: String,
    pub timestamp: String,
    pub nonce: String,
}

impl Default for HeaderNames {
    fn default() -> Self {
        Self {
            key_id: "X-API-Key".into(),
            signature: "X-API-Signature".into(),
            timestamp: "X-API-Timestamp".into(),
            nonce: "X-API-Nonce".into(),
        }
    }
}

impl HeaderNames {
    pub fn all(&self) -> [&str; 4] {
        [
            self.key_id.as_str(),
            self.signature.as_str(),
            self.timestamp.as_str(),
            self.nonce.as_str(),
        ]
    }

    fn validate(&self) -> Result<(), SigvaultError> {
        let mut lowered: Vec<String> = self.all().iter().map(|n| n.to_ascii_lowercase()).collect();
        for name in &lowered {
            let valid = !name.is_empty()
                && name
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
            if !valid {
                return Err(SigvaultError::InvalidConfig(format!(
                    "invalid header name: {name}"
                )));
            }
        }
        lowered.sort();
        lowered.dedup();
        if lowered.len() != 4 {
            return Err(SigvaultError::InvalidConfig(
                "protocol header names must be distinct".into(),
            ));
        }
        Ok(())
    }
}

/// Paths that skip verification entirely.
///
/// `exact` entries match by full equality. `prefixes` match the prefix
/// itself or anything below it on a `/` boundary, so `/api/auth/public`
/// covers `/api/auth/public/login` but not `/api/auth/publicity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BypassConfig {
    pub exact: Vec<String>,
    pub prefixes: Vec<String>,
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            exact: vec!["/health".into(), "/actuator/health".into()],
            prefixes: vec!["/api/auth/public".into()],
        }
    }
}

impl BypassConfig {
    /// No bypass at all.
    pub fn none() -> Self {
        Self {
            exact: Vec::new(),
            prefixes: Vec::new(),
        }
    }

    fn validate(&self) -> Result<(), SigvaultError> {
        for p in self.exact.iter().chain(&self.prefixes) {
            if !p.starts_with('/') {
                return Err(SigvaultError::InvalidConfig(format!(
                    "bypass path must start with '/': {p}"
                )));
            }
        }
        if self.prefixes.iter().any(|p| p.trim_end_matches('/').is_empty()) {
            return Err(SigvaultError::InvalidConfig(
                "bypass prefix '/' would disable verification".into(),
            ));
        }
        Ok(())
    }

    /// Whether `path` (no query string) skips verification.
    ///
    /// Paths carrying dot segments, empty segments or percent-encoding
    /// never match, so `/health/../api/x` cannot ride on `/health`.
    pub fn matches(&self, path: &str) -> bool {
        if path.contains('%')
            || path.contains("//")
            || path.split('/').any(|seg| seg == "." || seg == "..")
        {
            return false;
        }
        if self.exact.iter().any(|e| e == path) {
            return true;
        }
        self.prefixes.iter().any(|prefix| {
            let prefix = prefix.trim_end_matches('/');
            match path.strip_prefix(prefix) {
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            }
        })
    }
}

/// Replay store sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Width of one expiry bucket in seconds.
    pub bucket_width_secs: u64,
    /// Upper bound on unexpired nonces held at once.
    pub max_tracked_nonces: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            bucket_width_secs: 30,
            max_tracked_nonces: 100_000,
        }
    }
}

impl ReplayConfig {
    fn validate(&self) -> Result<(), SigvaultError> {
        if self.bucket_width_secs == 0 {
            return Err(SigvaultError::InvalidConfig(
                "bucket_width_secs cannot be 0".into(),
            ));
        }
        if self.max_tracked_nonces == 0 {
            return Err(SigvaultError::InvalidConfig(
                "max_tracked_nonces cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

/// Field-level encryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// When false the sensitive field walker leaves payloads untouched.
    pub enabled: bool,
    /// base64 of 32 bytes. When absent an ephemeral key is generated and
    /// anything encrypted is lost on restart.
    pub master_key: Option<String>,
    /// Logical DEK name used when the caller does not pick one.
    pub default_key_id: String,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            master_key: None,
            default_key_id: "default".into(),
        }
    }
}

impl EncryptionConfig {
    fn validate(&self) -> Result<(), SigvaultError> {
        let name = &self.default_key_id;
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SigvaultError::InvalidConfig(format!(
                "invalid default_key_id: {name}"
            )));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_validity_window() -> u64 {
    300
}

fn default_signed_header_prefix() -> String {
    "x-api-".into()
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}
