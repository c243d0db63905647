//! Content hashing
//!
//! SHA-256 helpers for chunk integrity checks and the incremental digest
//! computed while a file is reassembled.

use sha2::{Digest, Sha256};

/// Incremental SHA-256 over bytes fed strictly in order
#[derive(Clone, Default)]
pub struct ContentHasher {
    hasher: Sha256,
    bytes: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next slice of the byte stream
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes hashed so far
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Consume the hasher and return the hex digest
    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Compute SHA-256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Verify hash matches data (case-insensitive hex)
pub fn verify_hash(data: &[u8], expected_hash: &str) -> bool {
    compute_hash(data).eq_ignore_ascii_case(expected_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_hash() {
        let hash = compute_hash(b"Hello, World!");
        assert_eq!(hash.len(), 64); // SHA-256 = 32 bytes = 64 hex chars
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(
            compute_hash(b"ABCDEF"),
            "e9c0f8b575cbfcb42ab3b78ecc87efa3b011d9a5d10b09fa4e96f240bf6a82f5"
        );
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut hasher = ContentHasher::new();
        for part in [b"AB".as_slice(), b"CD", b"EF"] {
            hasher.update(part);
        }
        assert_eq!(hasher.bytes_hashed(), 6);
        assert_eq!(hasher.finalize(), compute_hash(b"ABCDEF"));
    }

    #[test]
    fn test_verify_hash_ignores_case() {
        let hash = compute_hash(b"chunk").to_uppercase();
        assert!(verify_hash(b"chunk", &hash));
        assert!(!verify_hash(b"other", &hash));
    }
}
