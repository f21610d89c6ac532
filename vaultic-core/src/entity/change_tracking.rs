//! Append-only log of JSON edits made to store-state documents.

use crate::crypto::KeyScope;
use crate::entity::{
    i64_value, invalid, string_value, AnyEntity, Entity, EntityBase, EntityKind, StoreState,
    StoreStateKind,
};
use crate::FieldError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Owner type of the logged store state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeScope {
    #[default]
    User,
    UserVault,
    Vault,
}

impl ChangeScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "User",
            Self::UserVault => "UserVault",
            Self::Vault => "Vault",
        }
    }

    pub fn for_store_state(kind: StoreStateKind) -> Self {
        match kind.owner() {
            crate::entity::store_state::StoreOwner::User => Self::User,
            crate::entity::store_state::StoreOwner::UserVault => Self::UserVault,
            crate::entity::store_state::StoreOwner::Vault => Self::Vault,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeOpKind {
    Add,
    Update,
    Delete,
}

/// One edit to a store-state document at a dotted `path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeOp {
    pub op: ChangeOpKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl ChangeOp {
    pub fn add(path: &str, value: Value) -> Self {
        Self {
            op: ChangeOpKind::Add,
            path: path.to_string(),
            value: Some(value),
        }
    }

    pub fn update(path: &str, value: Value) -> Self {
        Self {
            op: ChangeOpKind::Update,
            path: path.to_string(),
            value: Some(value),
        }
    }

    pub fn delete(path: &str) -> Self {
        Self {
            op: ChangeOpKind::Delete,
            path: path.to_string(),
            value: None,
        }
    }
}

/// A batch of edits to one store state.
///
/// `changes` holds the JSON list of [`ChangeOp`]s and is encrypted with the
/// store state's key. `version` is assigned by the server once the entry
/// has been backed up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChangeTracking {
    #[serde(flatten)]
    pub base: EntityBase,
    pub scope: ChangeScope,
    #[serde(rename = "ownerID")]
    pub owner_id: i64,
    #[serde(rename = "objectID")]
    pub object_id: i64,
    pub object_state: StoreStateKind,
    /// Milliseconds since the Unix epoch
    pub change_time: i64,
    pub changes: String,
    pub version: Option<i64>,
}

impl ChangeTracking {
    /// Log `ops` against `store_state`, timestamped now.
    pub fn for_store_state(store_state: &StoreState, ops: &[ChangeOp]) -> Result<Self, FieldError> {
        let changes =
            serde_json::to_string(ops).map_err(|e| invalid("changes", e.to_string()))?;
        Ok(Self {
            base: EntityBase::new(),
            scope: ChangeScope::for_store_state(store_state.kind),
            owner_id: store_state.owner_id,
            object_id: store_state.base.id,
            object_state: store_state.kind,
            change_time: chrono::Utc::now().timestamp_millis(),
            changes,
            version: None,
        })
    }

    pub fn is_acknowledged(&self) -> bool {
        self.version.is_some()
    }
}

impl Entity for ChangeTracking {
    const KIND: EntityKind = EntityKind::ChangeTracking;
    const SIGNABLE: &'static [&'static str] = &[
        "scope",
        "ownerID",
        "objectID",
        "objectState",
        "changeTime",
        "changes",
    ];
    const ENCRYPTABLE: &'static [&'static str] = &["changes"];
    const BACKUPABLE: &'static [&'static str] = &["objectID", "objectState", "changeTime", "changes"];
    const OVERRIDABLE: &'static [&'static str] = &["version"];

    fn base(&self) -> &EntityBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut EntityBase {
        &mut self.base
    }

    fn key_scope(&self) -> KeyScope {
        match self.scope {
            ChangeScope::Vault => KeyScope::Vault(self.owner_id),
            ChangeScope::User | ChangeScope::UserVault => KeyScope::Master,
        }
    }

    fn own_property(&self, name: &str) -> Option<Value> {
        match name {
            "scope" => Some(Value::String(self.scope.as_str().to_string())),
            "ownerID" => Some(Value::from(self.owner_id)),
            "objectID" => Some(Value::from(self.object_id)),
            "objectState" => Some(Value::String(self.object_state.as_str().to_string())),
            "changeTime" => Some(Value::from(self.change_time)),
            "changes" => Some(Value::String(self.changes.clone())),
            "version" => Some(self.version.map(Value::from).unwrap_or(Value::Null)),
            _ => None,
        }
    }

    fn write_own_property(&mut self, name: &str, value: Value) -> Result<(), FieldError> {
        match name {
            "scope" => {
                self.scope = serde_json::from_value(value)
                    .map_err(|e| invalid(name, e.to_string()))?
            }
            "ownerID" => self.owner_id = i64_value(name, value)?,
            "objectID" => self.object_id = i64_value(name, value)?,
            "objectState" => {
                self.object_state = serde_json::from_value(value)
                    .map_err(|e| invalid(name, e.to_string()))?
            }
            "changeTime" => self.change_time = i64_value(name, value)?,
            "changes" => self.changes = string_value(name, value)?,
            "version" => {
                self.version = match value {
                    Value::Null => None,
                    other => Some(i64_value(name, other)?),
                }
            }
            _ => return Err(FieldError::UnknownProperty(name.to_string())),
        }
        Ok(())
    }

    fn into_any(self) -> AnyEntity {
        AnyEntity::ChangeTracking(self)
    }

    fn from_any(any: AnyEntity) -> Option<Self> {
        match any {
            AnyEntity::ChangeTracking(entry) => Some(entry),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_points_at_store_state() {
        let state = StoreState::empty(StoreStateKind::Password, 42);
        let ops = vec![ChangeOp::add("passwords.1", serde_json::json!({"login": "me"}))];
        let entry = ChangeTracking::for_store_state(&state, &ops).unwrap();

        assert_eq!(entry.scope, ChangeScope::Vault);
        assert_eq!(entry.owner_id, 42);
        assert_eq!(entry.object_id, state.base.id);
        assert_eq!(entry.key_scope(), KeyScope::Vault(42));
        assert!(!entry.is_acknowledged());

        let parsed: Vec<ChangeOp> = serde_json::from_str(&entry.changes).unwrap();
        assert_eq!(parsed, ops);
    }

    #[test]
    fn change_op_wire_shape() {
        let json = serde_json::to_value(ChangeOp::delete("groups.7")).unwrap();
        assert_eq!(json, serde_json::json!({"op": "delete", "path": "groups.7"}));
    }

    #[test]
    fn version_is_nullable() {
        let mut entry = ChangeTracking::default();
        entry.write_property("version", Value::from(3)).unwrap();
        assert_eq!(entry.version, Some(3));
        entry.write_property("version", Value::Null).unwrap();
        assert_eq!(entry.version, None);
    }
}
