//! Membership of a user in a vault, carrying that user's copy of the vault key.

use crate::crypto::KeyScope;
use crate::entity::{
    bool_value, i64_value, string_value, AnyEntity, Entity, EntityBase, EntityKind,
};
use crate::FieldError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Access flags a vault owner grants to a member.
pub mod permissions {
    pub const VIEW: i64 = 0;
    pub const EDIT: i64 = 1;
    pub const ADMIN: i64 = 2;
}

/// A user's link to a vault.
///
/// Once set up, `vault_key` is the vault key wrapped with the user's master
/// key. A freshly shared link (`is_setup == false`) instead holds the key
/// sealed to the recipient's public key and carries no usable signature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserVault {
    #[serde(flatten)]
    pub base: EntityBase,
    #[serde(rename = "userID")]
    pub user_id: i64,
    #[serde(rename = "vaultID")]
    pub vault_id: i64,
    pub vault_key: String,
    pub is_owner: bool,
    pub permissions: i64,
    pub is_setup: bool,
}

impl UserVault {
    /// A set-up membership; `vault_key` is filled in via `set` before insert.
    pub fn new(user_id: i64, vault_id: i64, is_owner: bool) -> Self {
        Self {
            base: EntityBase::new(),
            user_id,
            vault_id,
            vault_key: String::new(),
            is_owner,
            permissions: if is_owner {
                permissions::ADMIN
            } else {
                permissions::VIEW
            },
            is_setup: true,
        }
    }
}

impl Entity for UserVault {
    const KIND: EntityKind = EntityKind::UserVault;
    const SIGNABLE: &'static [&'static str] = &["userID", "vaultID", "vaultKey", "isOwner"];
    const ENCRYPTABLE: &'static [&'static str] = &["vaultKey"];
    const BACKUPABLE: &'static [&'static str] = &["vaultKey", "isOwner", "permissions", "isSetup"];
    const OVERRIDABLE: &'static [&'static str] = &["vaultKey", "isOwner", "permissions", "isSetup"];
    const BACKUP_ALWAYS: &'static [&'static str] = &["userID", "vaultID"];

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
            "userID" => Some(Value::from(self.user_id)),
            "vaultID" => Some(Value::from(self.vault_id)),
            "vaultKey" => Some(Value::String(self.vault_key.clone())),
            "isOwner" => Some(Value::Bool(self.is_owner)),
            "permissions" => Some(Value::from(self.permissions)),
            "isSetup" => Some(Value::Bool(self.is_setup)),
            _ => None,
        }
    }

    fn write_own_property(&mut self, name: &str, value: Value) -> Result<(), FieldError> {
        match name {
            "userID" => self.user_id = i64_value(name, value)?,
            "vaultID" => self.vault_id = i64_value(name, value)?,
            "vaultKey" => self.vault_key = string_value(name, value)?,
            "isOwner" => self.is_owner = bool_value(name, value)?,
            "permissions" => self.permissions = i64_value(name, value)?,
            "isSetup" => self.is_setup = bool_value(name, value)?,
            _ => return Err(FieldError::UnknownProperty(name.to_string())),
        }
        Ok(())
    }

    fn into_any(self) -> AnyEntity {
        AnyEntity::UserVault(self)
    }

    fn from_any(any: AnyEntity) -> Option<Self> {
        match any {
            AnyEntity::UserVault(user_vault) => Some(user_vault),
            _ => None,
        }
    }
}
