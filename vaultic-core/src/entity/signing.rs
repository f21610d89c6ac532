//! Entity integrity signatures.
//!
//! The signature makeup is `{"id", "kind", "properties": {name: value}}`
//! over the signable properties as stored (after field encryption). It is
//! serialized with sorted keys and MACed with HMAC-SHA256 under the
//! entity's own random secret. The token stored in `currentSignature` is
//! `v1.<base64url(mac)>`.

use crate::crypto::{self, symmetric_decrypt, symmetric_encrypt, CryptoError, CryptoResult, SymmetricKey};
use crate::entity::Entity;
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use serde_json::{Map, Value};
use zeroize::{Zeroize, Zeroizing};

/// Current signature scheme.
pub const SIGNATURE_SCHEME: &str = "v1";

const SECRET_LEN: usize = 32;

/// Canonical bytes covered by the signature.
pub fn signature_makeup<E: Entity>(entity: &E) -> CryptoResult<Vec<u8>> {
    let mut properties = Map::new();
    for name in E::SIGNABLE {
        properties.insert(
            name.to_string(),
            entity.property(name).unwrap_or(Value::Null),
        );
    }

    // serde_json's Map is ordered by key, which makes this canonical
    let mut makeup = Map::new();
    makeup.insert("id".to_string(), Value::from(entity.id()));
    makeup.insert("kind".to_string(), Value::String(E::KIND.to_string()));
    makeup.insert("properties".to_string(), Value::Object(properties));

    serde_json::to_vec(&Value::Object(makeup))
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))
}

fn decrypt_secret(key: &SymmetricKey, encrypted: &str) -> CryptoResult<Zeroizing<Vec<u8>>> {
    let encoded = Zeroizing::new(symmetric_decrypt(key, encrypted)?);
    let secret = STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    if secret.len() != SECRET_LEN {
        return Err(CryptoError::InvalidKeyLength {
            expected: SECRET_LEN,
            got: secret.len(),
        });
    }
    Ok(Zeroizing::new(secret))
}

fn new_secret(key: &SymmetricKey) -> CryptoResult<(Zeroizing<Vec<u8>>, String)> {
    let secret: [u8; SECRET_LEN] = rand::random();
    let mut encoded = STANDARD.encode(secret);
    let encrypted = symmetric_encrypt(key, &encoded);
    encoded.zeroize();
    Ok((Zeroizing::new(secret.to_vec()), encrypted?))
}

/// Sign `entity` with its owning `key`.
///
/// Generates and stores an encrypted secret on first use. Fields must
/// already be encrypted so the signature covers what is stored.
pub fn sign_entity<E: Entity>(entity: &mut E, key: &SymmetricKey) -> CryptoResult<()> {
    let secret = if entity.base().signature_secret.is_empty() {
        let (secret, encrypted) = new_secret(key)?;
        entity.base_mut().signature_secret = encrypted;
        secret
    } else {
        decrypt_secret(key, &entity.base().signature_secret)?
    };

    let makeup = signature_makeup(entity)?;
    let mac = crypto::sign(&secret, &makeup)?;
    entity.base_mut().current_signature =
        format!("{}.{}", SIGNATURE_SCHEME, URL_SAFE_NO_PAD.encode(mac));
    Ok(())
}

/// Verify `entity` against its owning `key`.
///
/// Fails on a wrong key, a missing, malformed or forged token, an unknown
/// scheme, or any signable property changed since signing.
pub fn verify_entity<E: Entity>(entity: &E, key: &SymmetricKey) -> CryptoResult<()> {
    let base = entity.base();
    if base.signature_secret.is_empty() || base.current_signature.is_empty() {
        return Err(CryptoError::InvalidSignature);
    }

    let (scheme, encoded_mac) = base
        .current_signature
        .split_once('.')
        .ok_or(CryptoError::InvalidSignature)?;
    if scheme != SIGNATURE_SCHEME {
        return Err(CryptoError::UnsupportedScheme(scheme.to_string()));
    }
    let mac = URL_SAFE_NO_PAD
        .decode(encoded_mac)
        .map_err(|_| CryptoError::InvalidSignature)?;

    let secret = decrypt_secret(key, &base.signature_secret)?;
    let makeup = signature_makeup(entity)?;
    crypto::verify(&secret, &makeup, &mac)
}
