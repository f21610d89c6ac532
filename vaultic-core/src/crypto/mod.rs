//! Cryptographic primitives for the vault core.
//!
//! This module provides:
//! - AES-256-GCM symmetric encryption (field values, wrapped keys)
//! - X25519 sealed boxes for sharing vault keys with other users
//! - HMAC-SHA256 signing of entity makeups
//! - SHA-2 hashing with optional salt
//! - Argon2id master key derivation
//! - The in-memory session key cache

pub mod asymmetric;
pub mod cipher;
pub mod hash;
pub mod kdf;
pub mod keyring;
pub mod mac;

pub use asymmetric::{asymmetric_decrypt, asymmetric_encrypt, KeyPair};
pub use cipher::{symmetric_decrypt, symmetric_encrypt, SymmetricKey};
pub use hash::{constant_time_eq, hash, HashAlgorithm};
pub use kdf::{derive_master_key, KdfParams};
pub use keyring::{
    decode_key, encode_key, seal_key_for, unseal_key, unwrap_key, wrap_key, KeyCache, KeyScope,
};
pub use mac::{sign, verify};

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Authentication failed - data may have been tampered with")]
    AuthenticationFailed,

    #[error("Signature does not match")]
    InvalidSignature,

    #[error("Unsupported signature scheme: {0}")]
    UnsupportedScheme(String),
}

impl CryptoError {
    /// Stable error code surfaced to callers that only need the failure class.
    pub fn code(&self) -> &'static str {
        match self {
            Self::KdfFailed(_) => "kdf_failed",
            Self::EncryptionFailed(_) => "encryption_failed",
            Self::DecryptionFailed(_) => "decryption_failed",
            Self::InvalidKeyLength { .. } => "invalid_key_length",
            Self::InvalidKey(_) => "invalid_key",
            Self::InvalidEncoding(_) => "invalid_encoding",
            Self::AuthenticationFailed => "authentication_failed",
            Self::InvalidSignature => "invalid_signature",
            Self::UnsupportedScheme(_) => "unsupported_scheme",
        }
    }

    /// Whether the failure came from opening data with the wrong key or
    /// from tampered ciphertext, as opposed to malformed input.
    pub fn is_wrong_key(&self) -> bool {
        matches!(self, Self::AuthenticationFailed | Self::InvalidSignature)
    }
}

/// Result type for crypto operations
pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_distinct() {
        let errors = [
            CryptoError::KdfFailed(String::new()),
            CryptoError::EncryptionFailed(String::new()),
            CryptoError::DecryptionFailed(String::new()),
            CryptoError::InvalidKeyLength { expected: 32, got: 1 },
            CryptoError::InvalidKey(String::new()),
            CryptoError::InvalidEncoding(String::new()),
            CryptoError::AuthenticationFailed,
            CryptoError::InvalidSignature,
            CryptoError::UnsupportedScheme(String::new()),
        ];
        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
