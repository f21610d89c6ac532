//! A vault: the unit of sharing, with its own symmetric key.

use crate::crypto::KeyScope;
use crate::entity::{string_value, AnyEntity, Entity, EntityBase, EntityKind};
use crate::FieldError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Vault {
    #[serde(flatten)]
    pub base: EntityBase,
    pub name: String,
}

impl Vault {
    pub fn new(name: &str) -> Self {
        Self {
            base: EntityBase::new(),
            name: name.to_string(),
        }
    }
}

impl Entity for Vault {
    const KIND: EntityKind = EntityKind::Vault;
    const SIGNABLE: &'static [&'static str] = &["name"];
    const ENCRYPTABLE: &'static [&'static str] = &["name"];
    const BACKUPABLE: &'static [&'static str] = &["name"];
    const OVERRIDABLE: &'static [&'static str] = &["name"];

    fn base(&self) -> &EntityBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut EntityBase {
        &mut self.base
    }

    fn key_scope(&self) -> KeyScope {
        KeyScope::Vault(self.base.id)
    }

    fn own_property(&self, name: &str) -> Option<Value> {
        match name {
            "name" => Some(Value::String(self.name.clone())),
            _ => None,
        }
    }

    fn write_own_property(&mut self, name: &str, value: Value) -> Result<(), FieldError> {
        match name {
            "name" => self.name = string_value(name, value)?,
            _ => return Err(FieldError::UnknownProperty(name.to_string())),
        }
        Ok(())
    }

    fn into_any(self) -> AnyEntity {
        AnyEntity::Vault(self)
    }

    fn from_any(any: AnyEntity) -> Option<Self> {
        match any {
            AnyEntity::Vault(vault) => Some(vault),
            _ => None,
        }
    }
}
