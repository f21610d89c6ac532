//! Reconciliation: fold the server's copy of a user's data into the local store.
//!
//! Each server entity is compared with its local row. New entities are
//! adopted as trusted, entities that changed only on the server are patched
//! through an override, and entities changed on both sides are merged. The
//! server copy is always verified before it is used; one that does not verify
//! is treated as absent and counted for a later refetch.
//!
//! A pass builds a single [`Transaction`], so either the whole server copy
//! lands or none of it does.

use crate::context::{decrypt_document, VaulticContext};
use crate::crypto::{encode_key, unseal_key, unwrap_key, KeyCache, KeyPair, KeyScope, SymmetricKey};
use crate::database::rows;
use crate::entity::{
    decrypt_field, tracking::has_pending_sync, verify_entity, AnyEntity, ChangeOp, ChangeScope,
    ChangeTracking, Entity, EntityBase, EntityKind, EntityState, StoreState, StoreStateKind, User,
    UserVault, Vault, SIGNATURE_METADATA,
};
use crate::sync::config::{advance_change_version, last_loaded_change_version};
use crate::sync::merge::{three_way_merge, TimedOps};
use crate::sync::models::{ChangesPayload, EntityPayload, UserDataPayload};
use crate::transaction::{DeleteFilter, Transaction};
use crate::{with_entity, Result, VaulticError};
use rusqlite::Connection;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Operations committed
    pub applied: usize,
    /// Local data changed in a way the server has not seen yet
    pub needs_repush: bool,
    /// Server entities skipped because they could not be trusted
    pub needs_refetch: usize,
}

struct Reconciler<'a> {
    conn: &'a Connection,
    cache: &'a KeyCache,
    server: &'a UserDataPayload,
    user_id: i64,
    master: SymmetricKey,
    vault_keys: HashMap<i64, SymmetricKey>,
    removed: HashSet<i64>,
    present_vaults: HashSet<i64>,
    tx: Transaction,
    outcome: ReconcileOutcome,
}

fn decrypt_ops(entry: &ChangeTracking, key: &SymmetricKey) -> Result<Vec<ChangeOp>> {
    let json = decrypt_field(entry, key, "changes")?.unwrap_or_else(|| "[]".to_string());
    serde_json::from_str(&json)
        .map_err(|e| VaulticError::InvalidInput(format!("change entry {}: {}", entry.id(), e)))
}

/// Change entries travel without the scope and owner their group carries.
fn change_entry(group: &ChangesPayload, payload: &EntityPayload) -> Option<ChangeTracking> {
    let mut entry = payload.clone();
    entry.fields.insert(
        "scope".to_string(),
        Value::String(group.scope.as_str().to_string()),
    );
    entry
        .fields
        .insert("ownerID".to_string(), Value::from(group.owner_id));
    entry.to_entity().ok()
}

/// Signature metadata and server-trusted fields of `server`, as an override patch.
fn override_patch<E: Entity>(server: &E) -> Map<String, Value> {
    let mut patch = Map::new();
    for name in SIGNATURE_METADATA.iter().chain(E::OVERRIDABLE) {
        if let Some(value) = server.property(name) {
            patch.insert(name.to_string(), value);
        }
    }
    if server.previous_signature().is_some() {
        patch.insert(
            "previousSignature".to_string(),
            Value::String(server.base().current_signature.clone()),
        );
    }
    patch
}

impl<'a> Reconciler<'a> {
    fn new(
        conn: &'a Connection,
        cache: &'a KeyCache,
        server: &'a UserDataPayload,
        user_id: i64,
        master: SymmetricKey,
    ) -> Self {
        let removed = server
            .removed_vaults
            .iter()
            .flatten()
            .chain(server.removed_user_vaults.iter().flatten())
            .copied()
            .collect();
        Self {
            conn,
            cache,
            server,
            user_id,
            master,
            vault_keys: HashMap::new(),
            removed,
            present_vaults: HashSet::new(),
            tx: Transaction::new(),
            outcome: ReconcileOutcome::default(),
        }
    }

    fn key_for(&self, scope: KeyScope) -> Option<SymmetricKey> {
        match scope {
            KeyScope::Master => Some(self.master.clone()),
            KeyScope::Vault(id) => self
                .vault_keys
                .get(&id)
                .cloned()
                .or_else(|| self.cache.key_for(scope)),
        }
    }

    fn refetch(&mut self, kind: EntityKind, id: Option<i64>, reason: &str) {
        warn!(%kind, ?id, reason, "skipping server entity");
        self.outcome.needs_refetch += 1;
    }

    fn verified<E: Entity>(&mut self, entity: &E, key: &SymmetricKey) -> bool {
        match verify_entity(entity, key) {
            Ok(()) => true,
            Err(e) => {
                warn!(kind = %E::KIND, id = entity.id(), error = %e, "server copy failed verification");
                self.outcome.needs_refetch += 1;
                false
            }
        }
    }

    fn run(&mut self) -> Result<()> {
        let server = self.server;
        let shared = self.collect_vault_keys()?;

        let user_present = match server.user.as_ref() {
            Some(user) if user.id() == Some(self.user_id) => {
                let present = self.entity::<User>(user)?;
                if present {
                    self.store_states(user, &StoreStateKind::USER_KINDS)?;
                }
                present
            }
            _ => rows::exists(self.conn, EntityKind::User, self.user_id)?,
        };
        if !user_present {
            warn!(user_id = self.user_id, "no trusted user record; nothing else can be applied");
            return Ok(());
        }

        for vault in server.vaults.iter().flatten() {
            let Some(vault_id) = vault.id() else { continue };
            if self.removed.contains(&vault_id) {
                continue;
            }
            if self.entity::<Vault>(vault)? {
                self.present_vaults.insert(vault_id);
                self.store_states(vault, &StoreStateKind::VAULT_KINDS)?;
            }
        }

        for link in server.user_vaults.iter().flatten() {
            let owned = link.get("userID").and_then(Value::as_i64) == Some(self.user_id);
            let Some(link_id) = link.id() else { continue };
            if !owned || self.removed.contains(&link_id) {
                continue;
            }
            let vault_id = link.get("vaultID").and_then(Value::as_i64).unwrap_or_default();
            if !self.vault_present(vault_id)? {
                self.refetch(EntityKind::UserVault, Some(link_id), "vault not available");
                continue;
            }
            if self.entity::<UserVault>(link)? {
                self.store_states(link, &StoreStateKind::USER_VAULT_KINDS)?;
            }
        }

        for (link, vault_key) in shared {
            self.set_up_shared(link, &vault_key)?;
        }

        self.change_entries()?;
        self.removals()?;
        Ok(())
    }

    /// Whether the vault exists locally or is about to.
    fn vault_present(&self, vault_id: i64) -> Result<bool> {
        Ok(self.present_vaults.contains(&vault_id)
            || rows::exists(self.conn, EntityKind::Vault, vault_id)?)
    }

    /// Unwrap the keys of set-up memberships and unseal freshly shared ones.
    fn collect_vault_keys(&mut self) -> Result<Vec<(UserVault, SymmetricKey)>> {
        let server = self.server;
        for payload in server.user_vaults.iter().flatten() {
            let Ok(link) = payload.to_entity::<UserVault>() else { continue };
            if link.user_id != self.user_id || !link.is_setup {
                continue;
            }
            if verify_entity(&link, &self.master).is_err() {
                continue;
            }
            match unwrap_key(&self.master, &link.vault_key) {
                Ok(key) => {
                    self.vault_keys.insert(link.vault_id, key);
                }
                Err(e) => warn!(vault_id = link.vault_id, error = %e, "cannot unwrap vault key"),
            }
        }

        let mut pending = Vec::new();
        for payload in server.shared_user_vaults.iter().flatten() {
            match payload.to_entity::<UserVault>() {
                Ok(link) if link.user_id == self.user_id && !link.is_setup => pending.push(link),
                Ok(_) => {}
                Err(_) => self.refetch(EntityKind::UserVault, payload.id(), "unreadable shared link"),
            }
        }
        pending.retain(|link| !self.removed.contains(&link.id()));
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let Some(key_pair) = self.key_pair()? else {
            for link in &pending {
                self.refetch(EntityKind::UserVault, Some(link.id()), "no key pair to open shared key");
            }
            return Ok(Vec::new());
        };

        let mut shared = Vec::new();
        for link in pending {
            if rows::exists(self.conn, EntityKind::UserVault, link.id())? {
                continue;
            }
            match unseal_key(&key_pair, &link.vault_key) {
                Ok(key) => {
                    self.vault_keys.insert(link.vault_id, key.clone());
                    shared.push((link, key));
                }
                Err(e) => {
                    warn!(vault_id = link.vault_id, error = %e, "cannot unseal shared vault key");
                    self.outcome.needs_refetch += 1;
                }
            }
        }
        Ok(shared)
    }

    /// The user's key pair, from the local record or the verified server copy.
    fn key_pair(&mut self) -> Result<Option<KeyPair>> {
        let user = match rows::load::<User>(self.conn, self.user_id)? {
            Some(user) => user,
            None => match self.server.user.as_ref().map(EntityPayload::to_entity::<User>) {
                Some(Ok(user)) => user,
                _ => return Ok(None),
            },
        };
        if verify_entity(&user, &self.master).is_err() {
            return Ok(None);
        }
        let Some(secret) = decrypt_field(&user, &self.master, "privateKey")? else {
            return Ok(None);
        };
        Ok(Some(KeyPair::from_secret_b64(&secret)?))
    }

    fn store_states(&mut self, parent: &EntityPayload, kinds: &[StoreStateKind]) -> Result<()> {
        for kind in kinds {
            if let Some(state) = parent.store_state(*kind) {
                self.entity::<StoreState>(&state)?;
            }
        }
        Ok(())
    }

    /// Reconcile one server entity. Returns whether the entity exists
    /// locally once the pass commits, so children know they can follow.
    fn entity<E: Entity>(&mut self, payload: &EntityPayload) -> Result<bool> {
        let server: E = match payload.to_entity() {
            Ok(entity) => entity,
            Err(e) => {
                warn!(kind = %E::KIND, error = %e, "unreadable server entity");
                self.outcome.needs_refetch += 1;
                return Ok(false);
            }
        };
        let id = server.id();
        let local: Option<E> = rows::load(self.conn, id)?;

        let Some(key) = self.key_for(server.key_scope()) else {
            self.refetch(E::KIND, Some(id), "no key for server copy");
            return Ok(local.is_some());
        };

        let Some(local) = local else {
            if !self.verified(&server, &key) {
                return Ok(false);
            }
            debug!(kind = %E::KIND, id, "adopting new server entity");
            self.tx.insert_existing(server.into_any());
            return Ok(true);
        };

        let server_signature = server.base().current_signature.clone();
        if server_signature == local.base().current_signature {
            return Ok(true);
        }
        if local.base().entity_state == EntityState::Deleted {
            debug!(kind = %E::KIND, id, "local tombstone wins until the server confirms");
            return Ok(true);
        }
        if !self.verified(&server, &key) {
            return Ok(true);
        }

        if !has_pending_sync(local.base()) {
            let read = local.base().current_signature.as_str();
            self.tx
                .override_if_unchanged(E::KIND, id, read, override_patch(&server));
        } else if local.previous_signature() != Some(server_signature.as_str()) {
            self.merge(local, server, &key)?;
        }
        Ok(true)
    }

    fn merge<E: Entity>(&mut self, local: E, server: E, key: &SymmetricKey) -> Result<()> {
        match (local.into_any(), server.into_any()) {
            (AnyEntity::StoreState(local), AnyEntity::StoreState(server)) => {
                self.merge_store_state(local, server, key)
            }
            (local, server) => with_entity!(local, local => {
                let server = server.into_entity().ok_or_else(|| {
                    VaulticError::InvariantViolation("server entity changed kind".to_string())
                })?;
                self.merge_properties(local, server, key)
            }),
        }
    }

    /// Local dirty properties win; everything else comes from the server.
    fn merge_properties<E: Entity>(&mut self, local: E, server: E, key: &SymmetricKey) -> Result<()> {
        let read = local.base().current_signature.clone();
        let mut merged = server.clone();
        let base = merged.base_mut();
        base.entity_state = EntityState::Unchanged;
        base.properties_to_sync.clear();

        for name in &local.base().properties_to_sync {
            let name = name.as_str();
            if !E::BACKUPABLE.contains(&name) {
                continue;
            }
            let value = if E::ENCRYPTABLE.contains(&name) {
                Value::String(decrypt_field(&local, key, name)?.unwrap_or_default())
            } else {
                local.property(name).unwrap_or(Value::Null)
            };
            merged.set(name, value)?;
        }

        self.tx
            .override_if_unchanged(E::KIND, server.id(), &read, override_patch(&server));
        if merged.is_dirty() {
            debug!(kind = %E::KIND, id = server.id(), "merged local properties over server copy");
            self.tx.update(merged.into_any(), key);
            self.outcome.needs_repush = true;
        }
        Ok(())
    }

    /// Replay local unacknowledged edits on top of the server's document.
    fn merge_store_state(
        &mut self,
        local: StoreState,
        server: StoreState,
        key: &SymmetricKey,
    ) -> Result<()> {
        let server_doc = decrypt_document(&server, key)?;
        let server_changes = self.server_changes(&server, key)?;

        let mut local_changes = Vec::new();
        for entry in rows::load_unacknowledged_changes(self.conn, Some(local.id()))? {
            local_changes.push(TimedOps {
                change_time: entry.change_time,
                ops: decrypt_ops(&entry, key)?,
            });
        }

        let outcome = three_way_merge(server_doc, &server_changes, &local_changes)?;
        debug!(
            id = server.id(),
            kind = server.kind.as_str(),
            applied = outcome.applied,
            skipped = outcome.skipped,
            "store state merged"
        );

        let signature = server.base.current_signature.clone();
        self.tx.override_if_unchanged(
            EntityKind::StoreState,
            server.id(),
            &local.base.current_signature,
            override_patch(&server),
        );

        let mut merged = server;
        merged.previous_signature = signature;
        merged.base.entity_state = EntityState::Unchanged;
        merged.base.properties_to_sync.clear();
        merged.set("state", outcome.state.to_string())?;
        self.tx.update(merged, key);
        self.outcome.needs_repush = true;
        Ok(())
    }

    /// Server edits to `state` newer than the last version this device loaded.
    fn server_changes(&self, state: &StoreState, key: &SymmetricKey) -> Result<Vec<TimedOps>> {
        let scope = ChangeScope::for_store_state(state.kind);
        let loaded = last_loaded_change_version(self.conn, scope, state.owner_id)?;
        let server = self.server;

        let mut changes = Vec::new();
        for group in server
            .all_changes()
            .filter(|g| g.scope == scope && g.owner_id == state.owner_id)
        {
            for payload in &group.all_changes {
                let Some(entry) = change_entry(group, payload) else { continue };
                if entry.object_id != state.id() || entry.version.unwrap_or(0) <= loaded {
                    continue;
                }
                // our own edits are already in the document
                if rows::exists(self.conn, EntityKind::ChangeTracking, entry.id())? {
                    continue;
                }
                if verify_entity(&entry, key).is_err() {
                    continue;
                }
                changes.push(TimedOps {
                    change_time: entry.change_time,
                    ops: decrypt_ops(&entry, key)?,
                });
            }
        }
        Ok(changes)
    }

    /// Re-wrap a shared vault key with the master key and take the membership over.
    fn set_up_shared(&mut self, shared: UserVault, vault_key: &SymmetricKey) -> Result<()> {
        if !self.vault_present(shared.vault_id)? {
            self.refetch(EntityKind::UserVault, Some(shared.id()), "shared vault not available");
            return Ok(());
        }

        let mut link = UserVault {
            base: EntityBase::with_id(shared.id()),
            user_id: shared.user_id,
            vault_id: shared.vault_id,
            vault_key: String::new(),
            is_owner: shared.is_owner,
            permissions: shared.permissions,
            is_setup: true,
        };
        link.set("vaultKey", encode_key(vault_key))?;
        let link_id = link.id();

        self.tx.insert(link, &self.master).insert(
            StoreState::empty(StoreStateKind::VaultPreferences, link_id),
            &self.master,
        );
        self.outcome.needs_repush = true;
        info!(vault_id = shared.vault_id, "shared vault set up");
        Ok(())
    }

    fn change_entries(&mut self) -> Result<()> {
        let server = self.server;
        for group in server.all_changes() {
            if self.removed.contains(&group.owner_id) {
                continue;
            }
            let scope = match group.scope {
                ChangeScope::Vault => KeyScope::Vault(group.owner_id),
                ChangeScope::User | ChangeScope::UserVault => KeyScope::Master,
            };
            let Some(key) = self.key_for(scope) else {
                self.refetch(EntityKind::ChangeTracking, None, "no key for change log");
                continue;
            };

            for payload in &group.all_changes {
                let Some(entry) = change_entry(group, payload) else {
                    self.refetch(EntityKind::ChangeTracking, payload.id(), "unreadable change entry");
                    continue;
                };
                match rows::load::<ChangeTracking>(self.conn, entry.id())? {
                    Some(local) => {
                        if let (None, Some(version)) = (local.version, entry.version) {
                            let mut patch = Map::new();
                            patch.insert("version".to_string(), Value::from(version));
                            self.tx
                                .override_fields(EntityKind::ChangeTracking, entry.id(), patch);
                        }
                    }
                    None => {
                        if self.verified(&entry, &key) {
                            self.tx.insert_existing(entry);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn removals(&mut self) -> Result<()> {
        let server = self.server;
        for id in server.removed_user_vaults.iter().flatten() {
            if rows::exists(self.conn, EntityKind::UserVault, *id)? {
                self.tx.delete(EntityKind::UserVault, DeleteFilter::Id(*id));
            }
        }
        for id in server.removed_vaults.iter().flatten() {
            if rows::exists(self.conn, EntityKind::Vault, *id)? {
                self.tx.delete(EntityKind::Vault, DeleteFilter::Id(*id));
            }
        }
        Ok(())
    }
}

/// Apply the server's copy for `user_id` to the local store in one commit.
///
/// Vault keys learned on the way are cached once the commit succeeds, and
/// the loaded change versions advance unless something had to be skipped.
#[tracing::instrument(skip_all, fields(user_id = user_id))]
pub fn reconcile(
    ctx: &VaulticContext,
    user_id: i64,
    server: &UserDataPayload,
) -> Result<ReconcileOutcome> {
    let master = ctx.master_key()?;

    // local rows may change between the read and the commit; start over then
    let (outcome, vault_keys, removed) = ctx.retry_stale(|| {
        let (tx, outcome, vault_keys, removed) = ctx.with_db(|db| {
            let mut reconciler =
                Reconciler::new(db.conn(), ctx.keys(), server, user_id, master.clone());
            reconciler.run()?;
            Ok((
                reconciler.tx,
                reconciler.outcome,
                reconciler.vault_keys,
                reconciler.removed,
            ))
        })?;
        let applied = tx.len();
        if !tx.is_empty() {
            ctx.commit(tx)?;
        }
        Ok((ReconcileOutcome { applied, ..outcome }, vault_keys, removed))
    })?;

    for (vault_id, key) in vault_keys {
        ctx.keys().insert_vault_key(vault_id, key);
    }
    for vault_id in server.removed_vaults.iter().flatten() {
        ctx.keys().remove_vault_key(*vault_id);
    }

    if outcome.needs_refetch == 0 {
        ctx.with_db(|db| {
            for group in server.all_changes() {
                if !removed.contains(&group.owner_id) {
                    advance_change_version(
                        db.conn(),
                        group.scope,
                        group.owner_id,
                        group.last_loaded_change_version,
                    )?;
                }
            }
            Ok(())
        })?;
    }

    info!(
        applied = outcome.applied,
        needs_repush = outcome.needs_repush,
        needs_refetch = outcome.needs_refetch,
        "reconciled with server copy"
    );
    Ok(outcome)
}
