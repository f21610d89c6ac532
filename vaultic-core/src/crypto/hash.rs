//! Salted SHA-2 hashing and constant-time comparison.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

/// Hash `salt || value` and return lowercase hex.
pub fn hash(algorithm: HashAlgorithm, value: &[u8], salt: &[u8]) -> String {
    match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(salt);
            hasher.update(value);
            hex::encode(hasher.finalize())
        }
        HashAlgorithm::Sha512 => {
            let mut hasher = Sha512::new();
            hasher.update(salt);
            hasher.update(value);
            hex::encode(hasher.finalize())
        }
    }
}

/// Compare two byte strings without leaking the position of the first difference.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            hash(HashAlgorithm::Sha256, b"abc", b""),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn salt_changes_digest() {
        let plain = hash(HashAlgorithm::Sha512, b"value", b"");
        let salted = hash(HashAlgorithm::Sha512, b"value", b"pepper");
        assert_eq!(plain.len(), 128);
        assert_ne!(plain, salted);
    }

    #[test]
    fn constant_time_compare() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"diff"));
        assert!(!constant_time_eq(b"short", b"longer"));
    }
}
