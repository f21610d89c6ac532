//! In-process backup server for tests and offline development.
//!
//! Stores payload fields as opaque JSON, the way a real server only ever
//! sees ciphertext and signatures. A backup conflicts when a store state's
//! `previousSignature` no longer matches what the server holds.

use crate::entity::{ChangeScope, StoreStateKind};
use crate::sync::models::{
    BackupRequest, BackupResponse, ChangeVersion, ChangesPayload, EntityPayload, OwnerVersion,
    PullRequest, UserDataPayload,
};
use crate::sync::server::BackupServer;
use crate::{Result, VaulticError};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

type Record = Map<String, Value>;

#[derive(Debug, Clone)]
struct StoredChange {
    scope: ChangeScope,
    owner_id: i64,
    version: i64,
    fields: Record,
}

#[derive(Debug, Default)]
struct Removals {
    vaults: Vec<i64>,
    user_vaults: Vec<i64>,
}

#[derive(Debug, Default)]
struct ServerState {
    users: HashMap<i64, Record>,
    vaults: HashMap<i64, Record>,
    user_vaults: HashMap<i64, Record>,
    store_states: HashMap<i64, Record>,
    changes: Vec<StoredChange>,
    next_versions: HashMap<(ChangeScope, i64), i64>,
    removals: HashMap<i64, Removals>,
    fail_next: u32,
    conflict_next: u32,
    accepted: u32,
}

/// Loopback [`BackupServer`].
#[derive(Debug, Default)]
pub struct MemoryServer {
    state: Mutex<ServerState>,
    delay: Option<Duration>,
}

fn int_field(record: &Record, name: &str) -> Option<i64> {
    record.get(name).and_then(Value::as_i64)
}

fn str_field<'a>(record: &'a Record, name: &str) -> &'a str {
    record.get(name).and_then(Value::as_str).unwrap_or_default()
}

fn stored_kind(record: &Record) -> Option<StoreStateKind> {
    record
        .get("kind")
        .and_then(|kind| serde_json::from_value(kind.clone()).ok())
}

fn merge_into(target: &mut HashMap<i64, Record>, payload: &EntityPayload) -> Option<i64> {
    let id = payload.id()?;
    let record = target.entry(id).or_default();
    for (name, value) in payload.own_fields() {
        record.insert(name, value);
    }
    Some(id)
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `delay` first.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ServerState>> {
        self.state
            .lock()
            .map_err(|_| VaulticError::Server("memory server lock poisoned".to_string()))
    }

    /// Fail the next `n` backups with a server error.
    pub fn fail_next(&self, n: u32) -> Result<()> {
        self.lock()?.fail_next = n;
        Ok(())
    }

    /// Answer the next `n` backups with a conflict.
    pub fn conflict_next(&self, n: u32) -> Result<()> {
        self.lock()?.conflict_next = n;
        Ok(())
    }

    /// Number of backups accepted so far.
    pub fn accepted_backups(&self) -> Result<u32> {
        Ok(self.lock()?.accepted)
    }

    /// The server's full copy for `user_id`.
    pub fn snapshot(&self, user_id: i64) -> Result<UserDataPayload> {
        Ok(self.lock()?.snapshot(user_id, &[], None))
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl ServerState {
    fn store_states_in<'a>(payload: &'a EntityPayload) -> impl Iterator<Item = EntityPayload> + 'a {
        StoreStateKind::USER_KINDS
            .iter()
            .chain(StoreStateKind::VAULT_KINDS.iter())
            .chain(StoreStateKind::USER_VAULT_KINDS.iter())
            .filter_map(move |kind| payload.store_state(*kind))
    }

    fn parents(payload: &UserDataPayload) -> Vec<&EntityPayload> {
        payload
            .user
            .iter()
            .chain(payload.vaults.iter().flatten())
            .chain(payload.user_vaults.iter().flatten())
            .collect()
    }

    fn has_conflict(&self, payload: &UserDataPayload) -> bool {
        Self::parents(payload)
            .into_iter()
            .flat_map(Self::store_states_in)
            .any(|state| {
                let Some(stored) = state.id().and_then(|id| self.store_states.get(&id)) else {
                    return false;
                };
                let previous = state
                    .get("previousSignature")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                str_field(stored, "currentSignature") != previous
            })
    }

    fn apply(&mut self, payload: UserDataPayload) -> Vec<ChangeVersion> {
        if let Some(user) = &payload.user {
            merge_into(&mut self.users, user);
        }
        for vault in payload.vaults.iter().flatten() {
            merge_into(&mut self.vaults, vault);
        }
        for link in payload
            .user_vaults
            .iter()
            .flatten()
            .chain(payload.shared_user_vaults.iter().flatten())
        {
            merge_into(&mut self.user_vaults, link);
        }
        for parent in Self::parents(&payload) {
            for state in Self::store_states_in(parent) {
                merge_into(&mut self.store_states, &state);
            }
        }

        for vault_id in payload.removed_vaults.iter().flatten() {
            self.remove_vault(*vault_id);
        }
        for link_id in payload.removed_user_vaults.iter().flatten() {
            self.remove_user_vault(*link_id);
        }

        let mut versions = Vec::new();
        for group in payload.all_changes() {
            for entry in &group.all_changes {
                let Some(id) = entry.id() else { continue };
                let next = self
                    .next_versions
                    .entry((group.scope, group.owner_id))
                    .or_insert(0);
                *next += 1;
                let mut fields = entry.own_fields();
                fields.insert("version".to_string(), Value::from(*next));
                versions.push(ChangeVersion {
                    id,
                    scope: group.scope,
                    owner_id: group.owner_id,
                    version: *next,
                });
                self.changes.push(StoredChange {
                    scope: group.scope,
                    owner_id: group.owner_id,
                    version: *next,
                    fields,
                });
            }
        }
        versions
    }

    fn remove_vault(&mut self, vault_id: i64) {
        self.vaults.remove(&vault_id);
        self.store_states
            .retain(|_, s| int_field(s, "ownerID") != Some(vault_id));
        self.changes.retain(|c| c.owner_id != vault_id);
        let links: Vec<(i64, i64)> = self
            .user_vaults
            .iter()
            .filter(|(_, l)| int_field(l, "vaultID") == Some(vault_id))
            .filter_map(|(id, l)| Some((*id, int_field(l, "userID")?)))
            .collect();
        for (link_id, user_id) in links {
            self.remove_user_vault(link_id);
            let removals = self.removals.entry(user_id).or_default();
            removals.vaults.push(vault_id);
            removals.user_vaults.push(link_id);
        }
    }

    fn remove_user_vault(&mut self, link_id: i64) {
        self.user_vaults.remove(&link_id);
        self.store_states
            .retain(|_, s| int_field(s, "ownerID") != Some(link_id));
        self.changes.retain(|c| c.owner_id != link_id);
    }

    fn with_states(&self, record: &Record, owner_id: i64, kinds: &[StoreStateKind]) -> EntityPayload {
        let mut payload = EntityPayload {
            fields: record.clone(),
        };
        for state in self.store_states.values() {
            if int_field(state, "ownerID") != Some(owner_id) {
                continue;
            }
            if let Some(kind) = stored_kind(state).filter(|k| kinds.contains(k)) {
                payload.set_store_state(
                    kind,
                    EntityPayload {
                        fields: state.clone(),
                    },
                );
            }
        }
        payload
    }

    fn changes_for(
        &self,
        scope: ChangeScope,
        owner_id: i64,
        versions: &[OwnerVersion],
        limit: Option<u32>,
    ) -> Option<ChangesPayload> {
        let loaded = versions
            .iter()
            .find(|v| v.scope == scope && v.owner_id == owner_id)
            .map_or(0, |v| v.last_loaded_change_version);
        let mut entries: Vec<&StoredChange> = self
            .changes
            .iter()
            .filter(|c| c.scope == scope && c.owner_id == owner_id && c.version > loaded)
            .collect();
        entries.sort_by_key(|c| c.version);
        if let Some(limit) = limit {
            entries.truncate(limit as usize);
        }
        let last = entries.last()?.version;
        Some(ChangesPayload {
            scope,
            owner_id,
            last_loaded_change_version: last,
            all_changes: entries
                .into_iter()
                .map(|c| EntityPayload {
                    fields: c.fields.clone(),
                })
                .collect(),
        })
    }

    fn snapshot(&self, user_id: i64, versions: &[OwnerVersion], limit: Option<u32>) -> UserDataPayload {
        let mut payload = UserDataPayload {
            user: self
                .users
                .get(&user_id)
                .map(|u| self.with_states(u, user_id, &StoreStateKind::USER_KINDS)),
            user_changes: self.changes_for(ChangeScope::User, user_id, versions, limit),
            ..Default::default()
        };

        let mut links: Vec<(&i64, &Record)> = self
            .user_vaults
            .iter()
            .filter(|(_, l)| int_field(l, "userID") == Some(user_id))
            .collect();
        links.sort_by_key(|(id, _)| **id);

        for (link_id, link) in links {
            let is_setup = link.get("isSetup").and_then(Value::as_bool).unwrap_or(true);
            if is_setup {
                payload
                    .user_vaults
                    .get_or_insert_with(Vec::new)
                    .push(self.with_states(link, *link_id, &StoreStateKind::USER_VAULT_KINDS));
                if let Some(changes) = self.changes_for(ChangeScope::UserVault, *link_id, versions, limit) {
                    payload
                        .user_vault_changes
                        .get_or_insert_with(Vec::new)
                        .push(changes);
                }
            } else {
                payload
                    .shared_user_vaults
                    .get_or_insert_with(Vec::new)
                    .push(EntityPayload {
                        fields: link.clone(),
                    });
            }

            let Some(vault_id) = int_field(link, "vaultID") else { continue };
            if let Some(vault) = self.vaults.get(&vault_id) {
                payload
                    .vaults
                    .get_or_insert_with(Vec::new)
                    .push(self.with_states(vault, vault_id, &StoreStateKind::VAULT_KINDS));
                if let Some(changes) = self.changes_for(ChangeScope::Vault, vault_id, versions, limit) {
                    payload
                        .vault_changes
                        .get_or_insert_with(Vec::new)
                        .push(changes);
                }
            }
        }

        if let Some(removals) = self.removals.get(&user_id) {
            if !removals.vaults.is_empty() {
                payload.removed_vaults = Some(removals.vaults.clone());
            }
            if !removals.user_vaults.is_empty() {
                payload.removed_user_vaults = Some(removals.user_vaults.clone());
            }
        }
        payload
    }
}

#[async_trait::async_trait]
impl BackupServer for MemoryServer {
    async fn backup(&self, request: BackupRequest) -> Result<BackupResponse> {
        self.pause().await;
        let mut state = self.lock()?;

        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(VaulticError::Server("injected backup failure".to_string()));
        }

        let payload = request.user_data_payload;
        if state.conflict_next > 0 || state.has_conflict(&payload) {
            state.conflict_next = state.conflict_next.saturating_sub(1);
            debug!(user_id = request.user_id, "backup conflicts with server copy");
            return Ok(BackupResponse::Conflict {
                server: state.snapshot(request.user_id, &[], None),
            });
        }

        let change_versions = state.apply(payload);
        state.accepted += 1;
        Ok(BackupResponse::Accepted { change_versions })
    }

    async fn pull(&self, request: PullRequest) -> Result<UserDataPayload> {
        self.pause().await;
        let state = self.lock()?;
        Ok(state.snapshot(request.user_id, &request.change_versions, request.limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> EntityPayload {
        serde_json::from_value(value).unwrap()
    }

    fn request(body: UserDataPayload) -> BackupRequest {
        BackupRequest {
            user_id: 1,
            user_data_payload: body,
        }
    }

    #[tokio::test]
    async fn stale_previous_signature_conflicts() {
        let server = MemoryServer::new();
        let vault = payload(json!({
            "id": 10, "currentSignature": "v1.vault", "name": "enc",
            "passwordStoreState": {"id": 20, "kind": "Password", "ownerID": 10,
                                   "currentSignature": "v1.a", "previousSignature": "", "state": "enc"}
        }));
        let link = payload(json!({"id": 30, "userID": 1, "vaultID": 10, "isSetup": true}));
        let first = UserDataPayload {
            vaults: Some(vec![vault]),
            user_vaults: Some(vec![link]),
            ..Default::default()
        };
        assert!(matches!(
            server.backup(request(first)).await.unwrap(),
            BackupResponse::Accepted { .. }
        ));

        let stale = payload(json!({
            "id": 10,
            "passwordStoreState": {"id": 20, "currentSignature": "v1.b", "previousSignature": "v1.old"}
        }));
        let response = server
            .backup(request(UserDataPayload {
                vaults: Some(vec![stale]),
                ..Default::default()
            }))
            .await
            .unwrap();
        match response {
            BackupResponse::Conflict { server } => {
                let vaults = server.vaults.unwrap();
                let state = vaults[0].store_state(StoreStateKind::Password).unwrap();
                assert_eq!(state.get("currentSignature"), Some(&json!("v1.a")));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn change_versions_are_per_owner() {
        let server = MemoryServer::new();
        let entry = |id: i64| payload(json!({"id": id, "changeTime": id, "changes": "enc"}));
        let body = UserDataPayload {
            vault_changes: Some(vec![
                ChangesPayload {
                    scope: ChangeScope::Vault,
                    owner_id: 10,
                    last_loaded_change_version: 0,
                    all_changes: vec![entry(1), entry(2)],
                },
                ChangesPayload {
                    scope: ChangeScope::Vault,
                    owner_id: 11,
                    last_loaded_change_version: 0,
                    all_changes: vec![entry(3)],
                },
            ]),
            ..Default::default()
        };
        let BackupResponse::Accepted { change_versions } = server.backup(request(body)).await.unwrap()
        else {
            panic!("expected accepted");
        };
        let versions: Vec<(i64, i64)> = change_versions.iter().map(|v| (v.id, v.version)).collect();
        assert_eq!(versions, vec![(1, 1), (2, 2), (3, 1)]);
    }

    #[tokio::test]
    async fn injected_failures_and_conflicts() {
        let server = MemoryServer::new();
        server.fail_next(1).unwrap();
        server.conflict_next(1).unwrap();

        assert!(server.backup(request(UserDataPayload::default())).await.is_err());
        assert!(matches!(
            server.backup(request(UserDataPayload::default())).await.unwrap(),
            BackupResponse::Conflict { .. }
        ));
        assert!(matches!(
            server.backup(request(UserDataPayload::default())).await.unwrap(),
            BackupResponse::Accepted { .. }
        ));
        assert_eq!(server.accepted_backups().unwrap(), 1);
    }

    #[tokio::test]
    async fn shared_links_and_removals_reach_the_recipient() {
        let server = MemoryServer::new();
        let owner_setup = UserDataPayload {
            vaults: Some(vec![payload(json!({"id": 10, "name": "enc"}))]),
            user_vaults: Some(vec![payload(json!({"id": 30, "userID": 1, "vaultID": 10, "isSetup": true}))]),
            shared_user_vaults: Some(vec![payload(
                json!({"id": 31, "userID": 2, "vaultID": 10, "isSetup": false, "vaultKey": "sealed"}),
            )]),
            ..Default::default()
        };
        server.backup(request(owner_setup)).await.unwrap();

        let recipient = server.snapshot(2).unwrap();
        assert_eq!(recipient.shared_user_vaults.as_ref().map(Vec::len), Some(1));
        assert!(recipient.user_vaults.is_none());
        assert_eq!(recipient.vaults.as_ref().map(Vec::len), Some(1));

        server
            .backup(request(UserDataPayload {
                removed_vaults: Some(vec![10]),
                ..Default::default()
            }))
            .await
            .unwrap();
        let recipient = server.snapshot(2).unwrap();
        assert_eq!(recipient.removed_vaults, Some(vec![10]));
        assert_eq!(recipient.removed_user_vaults, Some(vec![31]));
        assert!(recipient.vaults.is_none());
    }
}
