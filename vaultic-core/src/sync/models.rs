//! Sync data models: the backup payload and the messages exchanged with the backup server.

use crate::entity::{ChangeScope, Entity, StoreStateKind};
use crate::{DatabaseError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One entity as it travels to or from the server.
///
/// Holds the entity's backup fields (`id`, signature metadata and
/// backupable properties, all as stored, so ciphertext stays ciphertext).
/// Owned store states nest under their payload key, e.g. `passwordStoreState`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityPayload {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EntityPayload {
    /// Full or partial backup of `entity`.
    pub fn from_entity<E: Entity>(entity: &E, full: bool) -> Self {
        Self {
            fields: entity.backup_fields(full),
        }
    }

    pub fn id(&self) -> Option<i64> {
        self.fields.get("id").and_then(Value::as_i64)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn store_state(&self, kind: StoreStateKind) -> Option<EntityPayload> {
        match self.fields.get(kind.payload_field()) {
            Some(Value::Object(fields)) => Some(EntityPayload {
                fields: fields.clone(),
            }),
            _ => None,
        }
    }

    pub fn set_store_state(&mut self, kind: StoreStateKind, state: EntityPayload) {
        self.fields
            .insert(kind.payload_field().to_string(), Value::Object(state.fields));
    }

    /// The payload's own fields, without nested store states.
    pub fn own_fields(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .filter(|(name, _)| !is_store_state_field(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Rebuild the entity. Tracking fields take their defaults.
    pub fn to_entity<E: Entity>(&self) -> Result<E> {
        serde_json::from_value(Value::Object(self.own_fields())).map_err(|e| {
            DatabaseError::Serialization(format!("{} payload: {}", E::KIND, e)).into()
        })
    }
}

fn is_store_state_field(name: &str) -> bool {
    name.ends_with("StoreState")
}

/// Change-log entries for one owner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesPayload {
    pub scope: ChangeScope,
    #[serde(rename = "ownerID")]
    pub owner_id: i64,
    pub last_loaded_change_version: i64,
    /// Backup fields of each entry, plus `version` once the server assigned one
    pub all_changes: Vec<EntityPayload>,
}

/// Everything one backup or sync carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDataPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<EntityPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_vaults: Option<Vec<EntityPayload>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vaults: Option<Vec<EntityPayload>>,
    /// Memberships that still hold a key sealed to the recipient
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_user_vaults: Option<Vec<EntityPayload>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_user_vaults: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_vaults: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_changes: Option<ChangesPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_vault_changes: Option<Vec<ChangesPayload>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_changes: Option<Vec<ChangesPayload>>,
}

impl UserDataPayload {
    /// Every change payload, whatever its scope.
    pub fn all_changes(&self) -> impl Iterator<Item = &ChangesPayload> {
        self.user_changes
            .iter()
            .chain(self.user_vault_changes.iter().flatten())
            .chain(self.vault_changes.iter().flatten())
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Request body for a backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRequest {
    #[serde(rename = "userID")]
    pub user_id: i64,
    pub user_data_payload: UserDataPayload,
}

/// Last change version this device loaded for one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerVersion {
    pub scope: ChangeScope,
    #[serde(rename = "ownerID")]
    pub owner_id: i64,
    pub last_loaded_change_version: i64,
}

/// Request body for pulling the server's copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    #[serde(rename = "userID")]
    pub user_id: i64,
    pub change_versions: Vec<OwnerVersion>,
    pub limit: Option<u32>,
}

/// Version the server assigned to an uploaded change entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeVersion {
    pub id: i64,
    pub scope: ChangeScope,
    #[serde(rename = "ownerID")]
    pub owner_id: i64,
    pub version: i64,
}

/// Server response to a backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum BackupResponse {
    #[serde(rename_all = "camelCase")]
    Accepted { change_versions: Vec<ChangeVersion> },
    /// The server holds newer data; its current copy is attached
    Conflict { server: UserDataPayload },
}

/// Outcome of one sync call, for callers and logs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Entities and change entries acknowledged by the server
    pub acknowledged: usize,
    /// Backups re-sent because reconciliation changed local data
    pub repush_rounds: u32,
    /// Local operations applied while reconciling
    pub reconciled: usize,
    /// Server entities skipped because they did not verify
    pub needs_refetch: usize,
}
