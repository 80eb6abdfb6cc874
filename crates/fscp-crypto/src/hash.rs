//! SHA-256 hashing helpers.

use sha2::{Digest, Sha256};

/// SHA-256 over an arbitrary byte slice
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}
