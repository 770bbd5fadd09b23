//! Content-addressable hashing for plugin artifacts (§4.3).

use sha2::{Digest, Sha256};

const SEP: u8 = 0x1f;

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// `source_hash = H(source_bytes)` (§4.3).
pub fn source_hash(source_bytes: &[u8]) -> String {
    sha256_hex(source_bytes)
}

/// `env_hash = H(lockfile_bytes)` (§4.3).
pub fn env_hash(lockfile_bytes: &[u8]) -> String {
    sha256_hex(lockfile_bytes)
}

/// The artifact identity `H(source_bytes ∥ lockfile_bytes)` (§4.3), keying
/// env reuse and cache invalidation. Parts are unit-separator delimited to
/// avoid ambiguity at concatenation boundaries.
pub fn compute_artifact_hash(source_bytes: &[u8], lockfile_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_bytes);
    hasher.update([SEP]);
    hasher.update(lockfile_bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_is_64_chars() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn artifact_hash_is_deterministic_and_order_sensitive() {
        let h1 = compute_artifact_hash(b"source", b"lockfile");
        let h2 = compute_artifact_hash(b"source", b"lockfile");
        assert_eq!(h1, h2);

        let h3 = compute_artifact_hash(b"lockfile", b"source");
        assert_ne!(h1, h3);
    }

    #[test]
    fn artifact_hash_changes_with_either_component() {
        let base = compute_artifact_hash(b"source", b"lockfile-a");
        let different_lockfile = compute_artifact_hash(b"source", b"lockfile-b");
        let different_source = compute_artifact_hash(b"source-2", b"lockfile-a");
        assert_ne!(base, different_lockfile);
        assert_ne!(base, different_source);
    }
}
