//! Content hashing helpers for pipeline signatures and run identities.

use crate::error::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hex-encoded sha256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Canonical JSON: object keys sorted, no insignificant whitespace.
///
/// Round-tripping through `serde_json::Value` sorts every map (the default
/// map representation is ordered), so the same logical document always
/// hashes identically regardless of struct field order.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// Pretty canonical JSON for artifacts meant to be read by humans; keys are
/// sorted exactly like [`canonical_json`].
pub fn canonical_json_pretty<T: Serialize>(value: &T) -> Result<String> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string_pretty(&v)?)
}

/// Hex-encoded sha256 of a value's canonical JSON.
pub fn hash_canonical<T: Serialize>(value: &T) -> Result<String> {
    Ok(sha256_hex(canonical_json(value)?.as_bytes()))
}
