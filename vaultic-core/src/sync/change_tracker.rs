//! Change tracking: collect pending entities into a backup payload, and
//! reset their tracking once the server acknowledges it.

use crate::context::VaulticContext;
use crate::database::rows;
use crate::entity::{
    tracking::has_pending_sync, ChangeScope, Entity, EntityKind, EntityState, StoreState,
    StoreStateKind, User, UserVault, Vault,
};
use crate::sync::config::{last_loaded_change_version, SyncMetadata};
use crate::sync::models::{ChangeVersion, ChangesPayload, EntityPayload, UserDataPayload};
use crate::transaction::{DeleteFilter, Transaction};
use crate::Result;
use rusqlite::Connection;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{debug, warn};

/// One entity as it was when the backup was built.
#[derive(Debug, Clone, PartialEq)]
struct SentEntity {
    kind: EntityKind,
    id: i64,
    signature: String,
    properties: Vec<String>,
}

/// What a backup carried, so acknowledgement resets exactly that.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackupManifest {
    sent: Vec<SentEntity>,
    removed: Vec<(EntityKind, i64)>,
}

impl BackupManifest {
    fn record<E: Entity>(&mut self, entity: &E) {
        self.sent.push(SentEntity {
            kind: E::KIND,
            id: entity.id(),
            signature: entity.base().current_signature.clone(),
            properties: entity.base().properties_to_sync.clone(),
        });
    }

    pub fn len(&self) -> usize {
        self.sent.len() + self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A payload ready to send, and what it covers.
#[derive(Debug, Clone, Default)]
pub struct PendingBackup {
    pub payload: UserDataPayload,
    pub manifest: BackupManifest,
}

impl PendingBackup {
    pub fn is_empty(&self) -> bool {
        self.manifest.is_empty()
    }
}

/// Payload of a pending entity: everything on first backup, dirty fields after.
fn pending_payload<E: Entity>(entity: &E, manifest: &mut BackupManifest) -> Option<EntityPayload> {
    if !has_pending_sync(entity.base()) {
        return None;
    }
    manifest.record(entity);
    let full = entity.base().entity_state == EntityState::Inserted;
    Some(EntityPayload::from_entity(entity, full))
}

/// Payload of `entity` plus its pending store states, or `None` if nothing is pending.
fn with_store_states<E: Entity>(
    conn: &Connection,
    entity: &E,
    kinds: &[StoreStateKind],
    manifest: &mut BackupManifest,
) -> Result<Option<EntityPayload>> {
    let own = pending_payload(entity, manifest);
    let mut pending = own.is_some();
    let mut payload = own.unwrap_or_else(|| EntityPayload::from_entity(entity, false));

    let states: Vec<StoreState> = rows::load_owned(conn, entity.id())?;
    for state in states.iter().filter(|s| kinds.contains(&s.kind)) {
        if let Some(state_payload) = pending_payload(state, manifest) {
            payload.set_store_state(state.kind, state_payload);
            pending = true;
        }
    }
    Ok(pending.then_some(payload))
}

/// Collect everything `user_id` has not had acknowledged yet.
pub fn build_backup(conn: &Connection, user_id: i64) -> Result<PendingBackup> {
    let mut backup = PendingBackup::default();
    let Some(user) = rows::load::<User>(conn, user_id)? else {
        return Ok(backup);
    };
    let payload = &mut backup.payload;
    let manifest = &mut backup.manifest;

    payload.user = with_store_states(conn, &user, &StoreStateKind::USER_KINDS, manifest)?;

    let mut removed_owners = HashSet::new();
    let links: Vec<UserVault> = rows::load_owned(conn, user_id)?;
    for link in links.iter().filter(|l| l.user_id == user_id) {
        if link.base.entity_state == EntityState::Deleted {
            payload
                .removed_user_vaults
                .get_or_insert_with(Vec::new)
                .push(link.id());
            manifest.removed.push((EntityKind::UserVault, link.id()));
            removed_owners.insert(link.id());
        } else if let Some(link_payload) = with_store_states(
            conn,
            link,
            &StoreStateKind::USER_VAULT_KINDS,
            manifest,
        )? {
            payload
                .user_vaults
                .get_or_insert_with(Vec::new)
                .push(link_payload);
        }

        let Some(vault) = rows::load::<Vault>(conn, link.vault_id)? else {
            continue;
        };
        if vault.base.entity_state == EntityState::Deleted {
            payload
                .removed_vaults
                .get_or_insert_with(Vec::new)
                .push(vault.id());
            manifest.removed.push((EntityKind::Vault, vault.id()));
            removed_owners.insert(vault.id());
        } else if let Some(vault_payload) =
            with_store_states(conn, &vault, &StoreStateKind::VAULT_KINDS, manifest)?
        {
            payload
                .vaults
                .get_or_insert_with(Vec::new)
                .push(vault_payload);
        }
    }

    // change entries, grouped per owner in log order
    let mut groups: Vec<ChangesPayload> = Vec::new();
    for entry in rows::load_unacknowledged_changes(conn, None)? {
        if removed_owners.contains(&entry.owner_id) {
            continue;
        }
        manifest.record(&entry);
        let entry_payload = EntityPayload::from_entity(&entry, true);
        match groups
            .iter_mut()
            .find(|g| g.scope == entry.scope && g.owner_id == entry.owner_id)
        {
            Some(group) => group.all_changes.push(entry_payload),
            None => groups.push(ChangesPayload {
                scope: entry.scope,
                owner_id: entry.owner_id,
                last_loaded_change_version: last_loaded_change_version(
                    conn,
                    entry.scope,
                    entry.owner_id,
                )?,
                all_changes: vec![entry_payload],
            }),
        }
    }
    for group in groups {
        match group.scope {
            ChangeScope::User => payload.user_changes = Some(group),
            ChangeScope::UserVault => payload
                .user_vault_changes
                .get_or_insert_with(Vec::new)
                .push(group),
            ChangeScope::Vault => payload
                .vault_changes
                .get_or_insert_with(Vec::new)
                .push(group),
        }
    }

    debug!(entities = backup.manifest.len(), "backup payload built");
    Ok(backup)
}

/// Reset tracking for what the server accepted.
///
/// Entities changed locally while the backup was in flight keep their
/// tracking and go out with the next backup. Returns the number of entities
/// acknowledged.
pub fn acknowledge(
    ctx: &VaulticContext,
    manifest: &BackupManifest,
    change_versions: &[ChangeVersion],
) -> Result<usize> {
    // a row rewritten between this read and the commit is read again
    let acknowledged = ctx.retry_stale(|| {
        let mut tx = Transaction::new();
        let mut acknowledged = 0;

        ctx.with_db(|db| {
            let conn = db.conn();
            for sent in &manifest.sent {
                let Some(current) = rows::load_any(conn, sent.kind, sent.id)? else {
                    continue;
                };
                let base = current.base();
                if base.current_signature != sent.signature
                    || base.properties_to_sync != sent.properties
                    || base.entity_state == EntityState::Deleted
                {
                    debug!(kind = %sent.kind, id = sent.id, "changed during backup; still pending");
                    continue;
                }
                let Some(key) = ctx.keys().key_for(current.key_scope()) else {
                    warn!(kind = %sent.kind, id = sent.id, "no key to acknowledge entity");
                    continue;
                };
                tx.reset_tracking(current, &key);
                acknowledged += 1;
            }

            for (kind, id) in &manifest.removed {
                if rows::exists(conn, *kind, *id)? {
                    tx.delete(*kind, DeleteFilter::Id(*id));
                    acknowledged += 1;
                }
            }

            // after the resets, which rewrite whole records
            for assigned in change_versions {
                if rows::exists(conn, EntityKind::ChangeTracking, assigned.id)? {
                    let mut patch = Map::new();
                    patch.insert("version".to_string(), Value::from(assigned.version));
                    tx.override_fields(EntityKind::ChangeTracking, assigned.id, patch);
                }
            }
            Ok(())
        })?;

        ctx.commit(tx)?;
        Ok(acknowledged)
    })?;

    for (kind, id) in &manifest.removed {
        if *kind == EntityKind::Vault {
            ctx.keys().remove_vault_key(*id);
        }
    }
    ctx.with_db(|db| SyncMetadata::touch(db.conn()))?;
    Ok(acknowledged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Session;
    use crate::entity::{ChangeOp, ChangeTracking};
    use crate::settings::VaulticSettings;
    use crate::test_support::{init_tracing, key};
    use serde_json::json;
    use std::sync::Arc;

    async fn session() -> Session {
        init_tracing();
        let ctx = Arc::new(VaulticContext::in_memory(VaulticSettings::default()).unwrap());
        Session::create_account_with_key(ctx, "me@example.com", key(1))
            .await
            .unwrap()
    }

    fn build(session: &Session) -> PendingBackup {
        session
            .context()
            .with_db(|db| build_backup(db.conn(), session.user_id()))
            .unwrap()
    }

    fn versions_for(backup: &PendingBackup) -> Vec<ChangeVersion> {
        backup
            .payload
            .all_changes()
            .flat_map(|group| {
                group.all_changes.iter().enumerate().map(move |(i, entry)| ChangeVersion {
                    id: entry.id().unwrap(),
                    scope: group.scope,
                    owner_id: group.owner_id,
                    version: i as i64 + 1,
                })
            })
            .collect()
    }

    #[tokio::test]
    async fn first_backup_is_full_then_nothing_pending() {
        let session = session().await;
        let vault = session.create_vault("Personal").unwrap();

        let backup = build(&session);
        let payload = &backup.payload;
        let user = payload.user.as_ref().unwrap();
        assert!(user.get("publicKey").is_some());
        assert!(user.store_state(StoreStateKind::App).is_some());
        let vaults = payload.vaults.as_ref().unwrap();
        assert_eq!(vaults[0].id(), Some(vault.id()));
        assert!(vaults[0].store_state(StoreStateKind::Password).is_some());
        let links = payload.user_vaults.as_ref().unwrap();
        assert!(links[0].store_state(StoreStateKind::VaultPreferences).is_some());
        // user, 2 user states, vault, 5 vault states, link, 1 link state
        assert_eq!(backup.manifest.len(), 11);

        let acked = acknowledge(session.context(), &backup.manifest, &[]).unwrap();
        assert_eq!(acked, 11);
        assert!(build(&session).is_empty());
    }

    #[tokio::test]
    async fn partial_backup_after_edit() {
        let session = session().await;
        let vault = session.create_vault("Personal").unwrap();
        let first = build(&session);
        acknowledge(session.context(), &first.manifest, &[]).unwrap();

        session
            .edit_store_state(
                StoreStateKind::Password,
                Some(vault.id()),
                &[ChangeOp::add("p1", json!({"login": "me"}))],
            )
            .unwrap();

        let backup = build(&session);
        assert!(backup.payload.user.is_none());
        assert!(backup.payload.user_vaults.is_none());
        let vault_payload = &backup.payload.vaults.as_ref().unwrap()[0];
        assert!(vault_payload.get("name").is_none());
        let state = vault_payload.store_state(StoreStateKind::Password).unwrap();
        assert!(state.get("state").is_some());
        assert!(state.get("previousSignature").is_some());
        let changes = backup.payload.vault_changes.as_ref().unwrap();
        assert_eq!(changes[0].owner_id, vault.id());
        assert_eq!(changes[0].all_changes.len(), 1);

        let versions = versions_for(&backup);
        acknowledge(session.context(), &backup.manifest, &versions).unwrap();
        assert!(build(&session).is_empty());

        let entries = session
            .context()
            .repository::<ChangeTracking>()
            .retrieve_owned(vault.id())
            .unwrap();
        assert_eq!(entries[0].version, Some(1));
    }

    #[tokio::test]
    async fn edits_during_backup_stay_pending() {
        let session = session().await;
        let vault = session.create_vault("Personal").unwrap();
        let backup = build(&session);

        session.rename_vault(vault.id(), "Renamed mid-flight").unwrap();
        acknowledge(session.context(), &backup.manifest, &[]).unwrap();

        let next = build(&session);
        assert_eq!(next.manifest.len(), 1);
        assert_eq!(next.payload.vaults.as_ref().unwrap()[0].id(), Some(vault.id()));
    }

    #[tokio::test]
    async fn tombstones_are_removed_on_ack() {
        let session = session().await;
        let vault = session.create_vault("Personal").unwrap();
        let first = build(&session);
        acknowledge(session.context(), &first.manifest, &[]).unwrap();

        session.delete_vault(vault.id()).unwrap();
        let backup = build(&session);
        assert_eq!(backup.payload.removed_vaults, Some(vec![vault.id()]));
        assert_eq!(backup.payload.removed_user_vaults.as_ref().map(Vec::len), Some(1));
        assert!(backup.payload.vaults.is_none());

        acknowledge(session.context(), &backup.manifest, &[]).unwrap();
        let ctx = session.context();
        assert!(ctx.repository::<Vault>().retrieve(vault.id()).unwrap().is_none());
        assert!(ctx.keys().key_for(crate::KeyScope::Vault(vault.id())).is_none());
        assert!(build(&session).is_empty());
    }
}
