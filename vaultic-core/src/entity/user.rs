//! The account owner.

use crate::crypto::KeyScope;
use crate::entity::{string_value, AnyEntity, Entity, EntityBase, EntityKind};
use crate::FieldError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A user and their X25519 key pair.
///
/// `private_key` holds the base64 secret until the first write, after which
/// it is ciphertext under the master key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct User {
    #[serde(flatten)]
    pub base: EntityBase,
    pub email: String,
    pub public_key: String,
    pub private_key: String,
}

impl User {
    pub fn new(email: &str, public_key: &str, private_key: &str) -> Self {
        Self {
            base: EntityBase::new(),
            email: email.to_string(),
            public_key: public_key.to_string(),
            private_key: private_key.to_string(),
        }
    }
}

impl Entity for User {
    const KIND: EntityKind = EntityKind::User;
    const SIGNABLE: &'static [&'static str] = &["email", "publicKey", "privateKey"];
    const ENCRYPTABLE: &'static [&'static str] = &["privateKey"];
    const BACKUPABLE: &'static [&'static str] = &["email", "publicKey", "privateKey"];
    const OVERRIDABLE: &'static [&'static str] = &["email", "publicKey", "privateKey"];

    fn base(&self) -> &EntityBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut EntityBase {
        &mut self.base
    }

    fn key_scope(&self) -> KeyScope {
        KeyScope::Master
    }

    fn own_property(&self, name: &str) -> Option<Value> {
        match name {
            "email" => Some(Value::String(self.email.clone())),
            "publicKey" => Some(Value::String(self.public_key.clone())),
            "privateKey" => Some(Value::String(self.private_key.clone())),
            _ => None,
        }
    }

    fn write_own_property(&mut self, name: &str, value: Value) -> Result<(), FieldError> {
        match name {
            "email" => self.email = string_value(name, value)?,
            "publicKey" => self.public_key = string_value(name, value)?,
            "privateKey" => self.private_key = string_value(name, value)?,
            _ => return Err(FieldError::UnknownProperty(name.to_string())),
        }
        Ok(())
    }

    fn into_any(self) -> AnyEntity {
        AnyEntity::User(self)
    }

    fn from_any(any: AnyEntity) -> Option<Self> {
        match any {
            AnyEntity::User(user) => Some(user),
            _ => None,
        }
    }
}
