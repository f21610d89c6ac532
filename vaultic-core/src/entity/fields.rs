//! Selective field encryption.
//!
//! Only the properties a type declares as encryptable are ever encrypted,
//! and only when they were set in the current session. Ciphertext that was
//! not touched is never rewritten. Decryption is always explicit and by name.

use crate::crypto::{symmetric_decrypt, symmetric_encrypt, SymmetricKey};
use crate::entity::Entity;
use crate::FieldError;
use serde_json::Value;

fn encrypt_one<E: Entity>(entity: &mut E, key: &SymmetricKey, name: &str) -> Result<bool, FieldError> {
    let plaintext = match entity.property(name) {
        Some(Value::String(s)) if !s.is_empty() => s,
        _ => return Ok(false),
    };
    let ciphertext = symmetric_encrypt(key, &plaintext).map_err(|source| FieldError::Encryption {
        name: name.to_string(),
        source,
    })?;
    entity.write_property(name, Value::String(ciphertext))?;
    Ok(true)
}

/// Encrypt `updatedProperties ∩ encryptable`. Returns the names encrypted.
pub fn encrypt_updated<E: Entity>(
    entity: &mut E,
    key: &SymmetricKey,
) -> Result<Vec<&'static str>, FieldError> {
    let mut encrypted = Vec::new();
    for name in E::ENCRYPTABLE {
        let dirty = entity
            .base()
            .updated_properties
            .iter()
            .any(|p| p == name);
        if dirty && encrypt_one(entity, key, name)? {
            encrypted.push(*name);
        }
    }
    Ok(encrypted)
}

/// Encrypt every populated encryptable field of a new entity.
pub fn encrypt_populated<E: Entity>(
    entity: &mut E,
    key: &SymmetricKey,
) -> Result<Vec<&'static str>, FieldError> {
    let mut encrypted = Vec::new();
    for name in E::ENCRYPTABLE {
        if encrypt_one(entity, key, name)? {
            encrypted.push(*name);
        }
    }
    Ok(encrypted)
}

/// Decrypt a single encryptable field.
///
/// Returns `Ok(None)` when the field is empty, and
/// [`FieldError::Decryption`] when the key is wrong or the ciphertext is
/// corrupt, so absence and failure stay distinguishable.
pub fn decrypt_field<E: Entity>(
    entity: &E,
    key: &SymmetricKey,
    name: &str,
) -> Result<Option<String>, FieldError> {
    if !E::ENCRYPTABLE.contains(&name) {
        return Err(FieldError::NotEncryptable(name.to_string()));
    }
    let ciphertext = match entity.property(name) {
        Some(Value::String(s)) if !s.is_empty() => s,
        _ => return Ok(None),
    };
    symmetric_decrypt(key, &ciphertext)
        .map(Some)
        .map_err(|source| FieldError::Decryption {
            name: name.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityState, User};

    fn user() -> User {
        User::new("me@example.com", "PUBLIC", "PRIVATE")
    }

    #[test]
    fn populated_fields_are_encrypted_on_insert() {
        let key = SymmetricKey::generate();
        let mut user = user();

        let encrypted = encrypt_populated(&mut user, &key).unwrap();
        assert_eq!(encrypted, vec!["privateKey"]);
        assert_ne!(user.private_key, "PRIVATE");
        assert_eq!(user.email, "me@example.com");
        assert_eq!(
            decrypt_field(&user, &key, "privateKey").unwrap().as_deref(),
            Some("PRIVATE")
        );
    }

    #[test]
    fn untouched_ciphertext_is_byte_identical() {
        let key = SymmetricKey::generate();
        let mut user = user();
        encrypt_populated(&mut user, &key).unwrap();
        user.base.entity_state = EntityState::Unchanged;
        let before = user.private_key.clone();

        user.set("email", "new@example.com").unwrap();
        assert!(encrypt_updated(&mut user, &key).unwrap().is_empty());
        assert_eq!(user.private_key, before);

        user.set("privateKey", "ROTATED").unwrap();
        assert_eq!(encrypt_updated(&mut user, &key).unwrap(), vec!["privateKey"]);
        assert_ne!(user.private_key, before);
    }

    #[test]
    fn absence_differs_from_failure() {
        let key = SymmetricKey::generate();
        let mut user = User::new("me@example.com", "PUBLIC", "");
        encrypt_populated(&mut user, &key).unwrap();
        assert_eq!(decrypt_field(&user, &key, "privateKey").unwrap(), None);

        user.private_key = "PRIVATE".to_string();
        encrypt_populated(&mut user, &key).unwrap();
        let wrong = SymmetricKey::generate();
        match decrypt_field(&user, &wrong, "privateKey") {
            Err(FieldError::Decryption { name, source }) => {
                assert_eq!(name, "privateKey");
                assert!(source.is_wrong_key());
            }
            other => panic!("expected decryption error, got {:?}", other),
        }

        assert!(matches!(
            decrypt_field(&user, &key, "email"),
            Err(FieldError::NotEncryptable(_))
        ));
    }
}
