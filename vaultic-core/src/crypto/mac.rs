//! HMAC-SHA256 signing used for entity integrity tokens.

use crate::crypto::{CryptoError, CryptoResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute an HMAC-SHA256 tag over `message`.
pub fn sign(key: &[u8], message: &[u8]) -> CryptoResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Verify an HMAC-SHA256 tag in constant time.
pub fn verify(key: &[u8], message: &[u8], tag: &[u8]) -> CryptoResult<()> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    mac.update(message);
    mac.verify_slice(tag).map_err(|_| CryptoError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let tag = sign(b"secret", b"message").unwrap();
        assert_eq!(tag.len(), 32);
        assert!(verify(b"secret", b"message", &tag).is_ok());
    }

    #[test]
    fn wrong_key_or_message_fails() {
        let tag = sign(b"secret", b"message").unwrap();
        assert_eq!(
            verify(b"other", b"message", &tag).unwrap_err(),
            CryptoError::InvalidSignature
        );
        assert!(verify(b"secret", b"messagf", &tag).is_err());
        assert!(verify(b"secret", b"message", &tag[..16]).is_err());
    }

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2
        let tag = sign(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(tag),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }
}
