//! Canonical string construction.
//!
//! Signer and verifier must feed HMAC byte-identical input. The canonical
//! string is newline-joined, in this order:
//!
//! ```text
//! METHOD            (upper-cased)
//! /path             (query string removed)
//! 1700000000        (unix seconds)
//! nonce
//! key-id
//! x-api-a:value     (zero or more, lower-cased name, sorted, value trimmed)
//! base64(sha256(body))   (only when the body is non-empty)
//! ```
//!
//! Every line terminator is a `\n`. Input containing a line break anywhere
//! would let two different requests share a canonical string, so it is
//! rejected instead of passed through.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::crypto;
use crate::error::SigvaultError;

/// The signable parts of one request.
#[derive(Debug, Clone, Copy)]
pub struct RequestParts<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub timestamp: i64,
    pub nonce: &'a str,
    pub key_id: &'a str,
    pub headers: &'a [(&'a str, &'a str)],
    pub body: &'a [u8],
}

/// Builds canonical strings for a fixed header prefix.
#[derive(Debug, Clone)]
pub struct Canonicalizer {
    prefix: String,
    excluded: Vec<String>,
}

impl Canonicalizer {
    /// `prefix` selects the signed headers (case-insensitive). Header names
    /// in `excluded` are never signed even when they match the prefix; the
    /// protocol headers go here.
    pub fn new<I, S>(prefix: &str, excluded: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            prefix: prefix.to_ascii_lowercase(),
            excluded: excluded
                .into_iter()
                .map(|s| s.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    fn is_signed_header(&self, lower_name: &str) -> bool {
        lower_name.starts_with(&self.prefix) && !self.excluded.iter().any(|e| e == lower_name)
    }

    /// Build the canonical string for `parts`.
    pub fn canonical_string(&self, parts: &RequestParts<'_>) -> Result<String, SigvaultError> {
        reject_line_breaks(parts.method, "method")?;
        reject_line_breaks(parts.path, "path")?;
        reject_line_breaks(parts.nonce, "nonce")?;
        reject_line_breaks(parts.key_id, "key id")?;
        if parts.method.is_empty() {
            return Err(SigvaultError::InvalidCanonicalInput("method"));
        }
        if parts.nonce.is_empty() {
            return Err(SigvaultError::InvalidCanonicalInput("nonce"));
        }
        if parts.key_id.is_empty() {
            return Err(SigvaultError::InvalidCanonicalInput("key id"));
        }

        let path = parts.path.split('?').next().unwrap_or_default();

        let mut out = String::with_capacity(128);
        out.push_str(&parts.method.to_ascii_uppercase());
        out.push('\n');
        out.push_str(path);
        out.push('\n');
        out.push_str(&parts.timestamp.to_string());
        out.push('\n');
        out.push_str(parts.nonce);
        out.push('\n');
        out.push_str(parts.key_id);
        out.push('\n');

        let mut signed: Vec<(String, &str)> = Vec::new();
        for (name, value) in parts.headers {
            let lower = name.to_ascii_lowercase();
            if !self.is_signed_header(&lower) {
                continue;
            }
            reject_line_breaks(&lower, "header name")?;
            if lower.contains(':') {
                return Err(SigvaultError::InvalidCanonicalInput("header name"));
            }
            let value = value.trim();
            reject_line_breaks(value, "header value")?;
            signed.push((lower, value));
        }
        // Ties on name are broken by value so repeated headers are
        // order-independent too.
        signed.sort_unstable();
        for (name, value) in &signed {
            out.push_str(name);
            out.push(':');
            out.push_str(value);
            out.push('\n');
        }

        if !parts.body.is_empty() {
            out.push_str(&body_hash(parts.body));
        }

        Ok(out)
    }
}

/// base64(SHA-256(body)).
pub fn body_hash(body: &[u8]) -> String {
    STANDARD.encode(crypto::sha256(body))
}

fn reject_line_breaks(value: &str, what: &'static str) -> Result<(), SigvaultError> {
    if value.contains(|c: char| c == '\n' || c == '\r') {
        return Err(SigvaultError::InvalidCanonicalInput(what));
    }
    Ok(())
}
