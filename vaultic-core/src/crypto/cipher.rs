//! AES-256-GCM encryption and decryption for entity fields and wrapped keys.
//!
//! Uses AES-256-GCM with:
//! - 256-bit key
//! - 96-bit (12 byte) random nonce per encryption
//! - 128-bit authentication tag
//!
//! The binary wire format is `nonce(12) || ciphertext || auth_tag(16)`. String
//! values travel as standard base64 of that layout.

use crate::crypto::{CryptoError, CryptoResult};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// A 256-bit symmetric key (master key or vault key).
///
/// Only ever held in memory; the key cache drops (and zeroizes) it on lock.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    key: [u8; 32],
}

impl SymmetricKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Self { key: key.into() }
    }

    /// Create a key from raw bytes (use with caution)
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Create a key from a slice, checking its length
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let key: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            got: bytes.len(),
        })?;
        Ok(Self { key })
    }

    /// Get the raw key bytes (use sparingly)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        self.key[..].ct_eq(&other.key[..]).into()
    }
}

impl Eq for SymmetricKey {}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Encrypt raw bytes.
///
/// Returns `nonce(12) || ciphertext || auth_tag(16)`.
pub fn seal_bytes(key: &SymmetricKey, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    if plaintext.is_empty() {
        return Err(CryptoError::EncryptionFailed(
            "Cannot encrypt empty data".to_string(),
        ));
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    // aes-gcm appends the tag, so this is ciphertext || tag
    let ciphertext_with_tag = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext_with_tag.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext_with_tag);
    Ok(sealed)
}

/// Decrypt bytes produced by [`seal_bytes`].
///
/// A wrong key and tampered data both surface as
/// [`CryptoError::AuthenticationFailed`].
pub fn open_bytes(key: &SymmetricKey, sealed: &[u8]) -> CryptoResult<Vec<u8>> {
    // Minimum: 12 (nonce) + 1 (ciphertext) + 16 (tag)
    if sealed.len() < NONCE_LEN + 1 + TAG_LEN {
        return Err(CryptoError::DecryptionFailed(
            "Ciphertext too short".to_string(),
        ));
    }

    let (nonce_bytes, ciphertext_with_tag) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext_with_tag)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Encrypt a string value, returning the base64 wire form.
pub fn symmetric_encrypt(key: &SymmetricKey, value: &str) -> CryptoResult<String> {
    let sealed = seal_bytes(key, value.as_bytes())?;
    Ok(STANDARD.encode(sealed))
}

/// Decrypt a base64 wire-form value back to a string.
pub fn symmetric_decrypt(key: &SymmetricKey, value: &str) -> CryptoResult<String> {
    let sealed = STANDARD
        .decode(value)
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    let bytes = open_bytes(key, &sealed)?;
    String::from_utf8(bytes).map_err(|_| CryptoError::DecryptionFailed("Invalid UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let a = SymmetricKey::generate();
        let b = SymmetricKey::generate();
        assert_eq!(a.as_bytes().len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_from_slice_checks_length() {
        assert!(SymmetricKey::from_slice(&[7u8; 32]).is_ok());
        assert_eq!(
            SymmetricKey::from_slice(&[7u8; 16]).unwrap_err(),
            CryptoError::InvalidKeyLength { expected: 32, got: 16 }
        );
    }

    #[test]
    fn test_encrypt_string_roundtrip() {
        let key = SymmetricKey::generate();
        let encrypted = symmetric_encrypt(&key, "My secret password!").unwrap();
        assert_ne!(encrypted, "My secret password!");
        assert_eq!(symmetric_decrypt(&key, &encrypted).unwrap(), "My secret password!");
    }

    #[test]
    fn test_different_nonces() {
        let key = SymmetricKey::generate();
        let one = seal_bytes(&key, b"Same data").unwrap();
        let two = seal_bytes(&key, b"Same data").unwrap();

        assert_ne!(&one[..NONCE_LEN], &two[..NONCE_LEN]);
        assert_ne!(one, two);
        assert_eq!(open_bytes(&key, &one).unwrap(), open_bytes(&key, &two).unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = SymmetricKey::generate();
        let other = SymmetricKey::generate();
        let encrypted = symmetric_encrypt(&key, "Secret data").unwrap();

        let err = symmetric_decrypt(&other, &encrypted).unwrap_err();
        assert!(err.is_wrong_key());
    }

    #[test]
    fn test_tampering_detected() {
        let key = SymmetricKey::generate();
        let mut sealed = seal_bytes(&key, b"Original data").unwrap();
        sealed[NONCE_LEN + 1] ^= 0xFF;
        assert_eq!(
            open_bytes(&key, &sealed).unwrap_err(),
            CryptoError::AuthenticationFailed
        );
    }

    #[test]
    fn test_truncated_and_garbage_input() {
        let key = SymmetricKey::generate();
        assert!(open_bytes(&key, &[0u8; 28]).is_err());
        assert!(matches!(
            symmetric_decrypt(&key, "not base64!!"),
            Err(CryptoError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_empty_data_fails() {
        let key = SymmetricKey::generate();
        assert!(seal_bytes(&key, b"").is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = SymmetricKey::from_bytes([0xAB; 32]);
        assert_eq!(format!("{:?}", key), "SymmetricKey(..)");
    }
}
