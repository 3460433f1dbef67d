//! Text normalization and hashing.
//!
//! Exact matching and cache lookups both key on a normalized form of the
//! text: lowercase, with punctuation and whitespace stripped, keeping only
//! letters and digits (any script). Two statements that differ only in
//! spacing or punctuation therefore hash identically.

use sha2::{Digest, Sha256};

use crate::models::Scope;

/// Reduce text to its comparable core: lowercase alphanumerics only.
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// SHA-256 hex digest of the raw text.
pub fn content_hash(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

/// SHA-256 hex digest of the normalized text; backs the exact-match index.
pub fn normalized_hash(text: &str) -> String {
    sha256_hex(normalize(text).as_bytes())
}

/// Cache key for a query within an optional scope. The scope's canonical
/// form is folded into the hash so the same question against different
/// document sets caches independently.
pub fn query_hash(query_text: &str, scope: Option<&Scope>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(query_text).as_bytes());
    hasher.update(b"\n");
    if let Some(scope) = scope {
        hasher.update(scope.key().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
