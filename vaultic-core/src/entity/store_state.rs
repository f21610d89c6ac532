//! Store states: encrypted JSON documents holding the actual vault contents.

use crate::crypto::KeyScope;
use crate::entity::{i64_value, invalid, string_value, AnyEntity, Entity, EntityBase, EntityKind};
use crate::FieldError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which document a store state holds, and therefore who owns it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum StoreStateKind {
    #[default]
    App,
    UserPreferences,
    Vault,
    Password,
    Value,
    Filter,
    Group,
    VaultPreferences,
}

/// Who owns a store state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOwner {
    User,
    Vault,
    UserVault,
}

impl StoreStateKind {
    pub const USER_KINDS: [StoreStateKind; 2] = [Self::App, Self::UserPreferences];
    pub const VAULT_KINDS: [StoreStateKind; 5] =
        [Self::Vault, Self::Password, Self::Value, Self::Filter, Self::Group];
    pub const USER_VAULT_KINDS: [StoreStateKind; 1] = [Self::VaultPreferences];

    pub fn owner(&self) -> StoreOwner {
        match self {
            Self::App | Self::UserPreferences => StoreOwner::User,
            Self::VaultPreferences => StoreOwner::UserVault,
            _ => StoreOwner::Vault,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::App => "App",
            Self::UserPreferences => "UserPreferences",
            Self::Vault => "Vault",
            Self::Password => "Password",
            Self::Value => "Value",
            Self::Filter => "Filter",
            Self::Group => "Group",
            Self::VaultPreferences => "VaultPreferences",
        }
    }

    /// Key of this store state inside its owner's backup payload.
    pub fn payload_field(&self) -> &'static str {
        match self {
            Self::App => "appStoreState",
            Self::UserPreferences => "userPreferencesStoreState",
            Self::Vault => "vaultStoreState",
            Self::Password => "passwordStoreState",
            Self::Value => "valueStoreState",
            Self::Filter => "filterStoreState",
            Self::Group => "groupStoreState",
            Self::VaultPreferences => "vaultPreferencesStoreState",
        }
    }
}

/// One encrypted JSON document, owned by a user, vault or user vault.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreState {
    #[serde(flatten)]
    pub base: EntityBase,
    pub kind: StoreStateKind,
    #[serde(rename = "ownerID")]
    pub owner_id: i64,
    /// JSON document; ciphertext once written
    pub state: String,
    /// Last signature the server acknowledged
    pub previous_signature: String,
}

impl StoreState {
    pub fn new(kind: StoreStateKind, owner_id: i64, state: &str) -> Self {
        Self {
            base: EntityBase::new(),
            kind,
            owner_id,
            state: state.to_string(),
            previous_signature: String::new(),
        }
    }

    /// An empty document of the given kind.
    pub fn empty(kind: StoreStateKind, owner_id: i64) -> Self {
        Self::new(kind, owner_id, "{}")
    }
}

impl Entity for StoreState {
    const KIND: EntityKind = EntityKind::StoreState;
    const SIGNABLE: &'static [&'static str] = &["kind", "ownerID", "state"];
    const ENCRYPTABLE: &'static [&'static str] = &["state"];
    const BACKUPABLE: &'static [&'static str] = &["state"];
    const OVERRIDABLE: &'static [&'static str] = &["state", "previousSignature"];
    const BACKUP_ALWAYS: &'static [&'static str] = &["kind", "ownerID", "previousSignature"];

    fn base(&self) -> &EntityBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut EntityBase {
        &mut self.base
    }

    fn key_scope(&self) -> KeyScope {
        match self.kind.owner() {
            StoreOwner::Vault => KeyScope::Vault(self.owner_id),
            StoreOwner::User | StoreOwner::UserVault => KeyScope::Master,
        }
    }

    fn own_property(&self, name: &str) -> Option<Value> {
        match name {
            "kind" => Some(Value::String(self.kind.as_str().to_string())),
            "ownerID" => Some(Value::from(self.owner_id)),
            "state" => Some(Value::String(self.state.clone())),
            "previousSignature" => Some(Value::String(self.previous_signature.clone())),
            _ => None,
        }
    }

    fn write_own_property(&mut self, name: &str, value: Value) -> Result<(), FieldError> {
        match name {
            "kind" => {
                self.kind = serde_json::from_value(value)
                    .map_err(|e| invalid(name, e.to_string()))?
            }
            "ownerID" => self.owner_id = i64_value(name, value)?,
            "state" => self.state = string_value(name, value)?,
            "previousSignature" => self.previous_signature = string_value(name, value)?,
            _ => return Err(FieldError::UnknownProperty(name.to_string())),
        }
        Ok(())
    }

    fn previous_signature(&self) -> Option<&str> {
        Some(&self.previous_signature)
    }

    fn set_previous_signature(&mut self, signature: String) {
        self.previous_signature = signature;
    }

    fn into_any(self) -> AnyEntity {
        AnyEntity::StoreState(self)
    }

    fn from_any(any: AnyEntity) -> Option<Self> {
        match any {
            AnyEntity::StoreState(state) => Some(state),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_scope_follows_owner() {
        assert_eq!(
            StoreState::empty(StoreStateKind::Password, 4).key_scope(),
            KeyScope::Vault(4)
        );
        assert_eq!(
            StoreState::empty(StoreStateKind::App, 4).key_scope(),
            KeyScope::Master
        );
        assert_eq!(
            StoreState::empty(StoreStateKind::VaultPreferences, 4).key_scope(),
            KeyScope::Master
        );
    }

    #[test]
    fn kind_property_matches_serde() {
        let state = StoreState::empty(StoreStateKind::Filter, 1);
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(Some(value["kind"].clone()), state.property("kind"));
    }

    #[test]
    fn kind_lists_cover_every_kind() {
        let all: Vec<_> = StoreStateKind::USER_KINDS
            .iter()
            .chain(StoreStateKind::VAULT_KINDS.iter())
            .chain(StoreStateKind::USER_VAULT_KINDS.iter())
            .collect();
        assert_eq!(all.len(), 8);
    }
}
