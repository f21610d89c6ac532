//! X25519 sealed boxes for sharing vault keys.
//!
//! A sealed value is `ephemeral_public(32) || nonce(12) || ciphertext || tag(16)`,
//! base64-encoded. The AES-256-GCM key is
//! `HKDF-SHA256(salt = ephemeral_public || recipient_public, ikm = DH, info = "vaultic-seal-v1")`.

use crate::crypto::cipher::{open_bytes, seal_bytes, SymmetricKey};
use crate::crypto::{CryptoError, CryptoResult};
use base64::{engine::general_purpose::STANDARD, Engine};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

const SEAL_INFO: &[u8] = b"vaultic-seal-v1";

/// A user's long-term X25519 key pair.
///
/// The public half is published to the server; the secret half is only ever
/// persisted encrypted with the master key (`User::private_key`).
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a key pair from its base64 secret
    pub fn from_secret_b64(secret: &str) -> CryptoResult<Self> {
        let bytes = decode_32(secret)?;
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// Base64 of the public key
    pub fn public_key_b64(&self) -> String {
        STANDARD.encode(self.public.as_bytes())
    }

    /// Base64 of the secret key (encrypt before storing!)
    pub fn secret_key_b64(&self) -> String {
        STANDARD.encode(self.secret.to_bytes())
    }
}

fn decode_32(value: &str) -> CryptoResult<[u8; 32]> {
    let bytes = STANDARD
        .decode(value)
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength { expected: 32, got: len })
}

fn derive_box_key(
    shared: &x25519_dalek::SharedSecret,
    ephemeral_public: &PublicKey,
    recipient_public: &PublicKey,
) -> CryptoResult<SymmetricKey> {
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey(
            "Low-order public key rejected".to_string(),
        ));
    }

    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral_public.as_bytes());
    salt[32..].copy_from_slice(recipient_public.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
    let mut key = [0u8; 32];
    hkdf.expand(SEAL_INFO, &mut key)
        .map_err(|e| CryptoError::KdfFailed(format!("HKDF expand failed: {}", e)))?;
    Ok(SymmetricKey::from_bytes(key))
}

/// Seal `value` to the holder of `recipient_public` (base64 X25519 key).
pub fn asymmetric_encrypt(recipient_public: &str, value: &str) -> CryptoResult<String> {
    let recipient = PublicKey::from(decode_32(recipient_public)?);
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(&recipient);
    let key = derive_box_key(&shared, &ephemeral_public, &recipient)?;
    let sealed = seal_bytes(&key, value.as_bytes())?;

    let mut out = Vec::with_capacity(32 + sealed.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&sealed);
    Ok(STANDARD.encode(out))
}

/// Open a value sealed with [`asymmetric_encrypt`].
pub fn asymmetric_decrypt(key_pair: &KeyPair, value: &str) -> CryptoResult<String> {
    let bytes = STANDARD
        .decode(value)
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    if bytes.len() < 32 {
        return Err(CryptoError::DecryptionFailed(
            "Sealed box too short".to_string(),
        ));
    }

    let (ephemeral_bytes, sealed) = bytes.split_at(32);
    let mut ephemeral = [0u8; 32];
    ephemeral.copy_from_slice(ephemeral_bytes);
    let ephemeral_public = PublicKey::from(ephemeral);

    let shared = key_pair.secret.diffie_hellman(&ephemeral_public);
    let key = derive_box_key(&shared, &ephemeral_public, &key_pair.public)?;
    let plaintext = open_bytes(&key, sealed)?;
    String::from_utf8(plaintext)
        .map_err(|_| CryptoError::DecryptionFailed("Invalid UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let recipient = KeyPair::generate();
        let sealed = asymmetric_encrypt(&recipient.public_key_b64(), "vault key material").unwrap();
        assert_eq!(
            asymmetric_decrypt(&recipient, &sealed).unwrap(),
            "vault key material"
        );
    }

    #[test]
    fn wrong_recipient_fails() {
        let recipient = KeyPair::generate();
        let intruder = KeyPair::generate();
        let sealed = asymmetric_encrypt(&recipient.public_key_b64(), "secret").unwrap();

        let err = asymmetric_decrypt(&intruder, &sealed).unwrap_err();
        assert_eq!(err, CryptoError::AuthenticationFailed);
    }

    #[test]
    fn key_pair_restores_from_secret() {
        let original = KeyPair::generate();
        let restored = KeyPair::from_secret_b64(&original.secret_key_b64()).unwrap();
        assert_eq!(original.public_key_b64(), restored.public_key_b64());

        let sealed = asymmetric_encrypt(&original.public_key_b64(), "hello").unwrap();
        assert_eq!(asymmetric_decrypt(&restored, &sealed).unwrap(), "hello");
    }

    #[test]
    fn low_order_public_key_rejected() {
        let zero_key = STANDARD.encode([0u8; 32]);
        assert!(matches!(
            asymmetric_encrypt(&zero_key, "secret"),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn malformed_inputs_are_errors() {
        let recipient = KeyPair::generate();
        assert!(asymmetric_encrypt("short", "x").is_err());
        assert!(asymmetric_decrypt(&recipient, &STANDARD.encode([1u8; 10])).is_err());
    }
}
