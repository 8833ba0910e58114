//! SHA-256 checksums over chunk payloads and whole files.
//!
//! Checksums travel as lowercase hex strings so they can be compared and
//! logged without decoding.

use sha2::{Digest, Sha256};

/// Computes the lowercase hex SHA-256 digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Returns true when `data` hashes to `expected` (case-insensitive hex).
pub fn verify_sha256(data: &[u8], expected: &str) -> bool {
    let computed = sha256_hex(data);
    let ok = computed.eq_ignore_ascii_case(expected);
    if !ok {
        tracing::debug!(expected, computed = %computed, "sha256 mismatch");
    }
    ok
}
