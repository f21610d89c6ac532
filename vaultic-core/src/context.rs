//! Explicit runtime context and the signed-in session built on it.

use crate::crypto::{
    decode_key, derive_master_key, encode_key, unwrap_key, KeyCache, KeyPair, KeyScope,
    SymmetricKey,
};
use crate::database::Database;
use crate::entity::{
    decrypt_field, store_state::StoreOwner, ChangeOp, ChangeTracking, Entity, StoreState,
    StoreStateKind, User, UserVault, Vault,
};
use crate::repository::Repository;
use crate::settings::VaulticSettings;
use crate::sync::merge;
use crate::transaction::Transaction;
use crate::{AnyEntity, DatabaseError, Result, VaulticError};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Re-reads allowed when another writer keeps rewriting the same row.
const STALE_RETRIES: u32 = 16;

/// Everything an operation needs: the store, the session key cache and settings.
pub struct VaulticContext {
    db: Arc<Mutex<Database>>,
    keys: Arc<KeyCache>,
    settings: VaulticSettings,
    sync_guard: Arc<tokio::sync::Mutex<()>>,
}

impl VaulticContext {
    pub fn new(db: Database, settings: VaulticSettings) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            keys: Arc::new(KeyCache::new()),
            settings,
            sync_guard: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Open (or create) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P, settings: VaulticSettings) -> Result<Self> {
        settings.validate()?;
        let db = Database::open(path)?;
        db.initialize_schema()?;
        db.validate_schema_version()?;
        Ok(Self::new(db, settings))
    }

    /// Context over a fresh in-memory database.
    pub fn in_memory(settings: VaulticSettings) -> Result<Self> {
        settings.validate()?;
        let db = Database::in_memory()?;
        db.initialize_schema()?;
        Ok(Self::new(db, settings))
    }

    pub fn db(&self) -> &Arc<Mutex<Database>> {
        &self.db
    }

    pub fn keys(&self) -> &KeyCache {
        &self.keys
    }

    pub fn settings(&self) -> &VaulticSettings {
        &self.settings
    }

    /// Held by a running sync; sign-in and sign-out wait on it.
    pub(crate) fn sync_guard(&self) -> &Arc<tokio::sync::Mutex<()>> {
        &self.sync_guard
    }

    pub fn repository<E: Entity>(&self) -> Repository<E> {
        Repository::new(Arc::clone(&self.db))
    }

    pub fn master_key(&self) -> Result<SymmetricKey> {
        self.keys.master_key().ok_or(VaulticError::VaultLocked)
    }

    pub fn key_for(&self, scope: KeyScope) -> Result<SymmetricKey> {
        self.keys.key_for(scope).ok_or(VaulticError::VaultLocked)
    }

    pub fn commit(&self, tx: Transaction) -> Result<Vec<AnyEntity>> {
        tx.commit(&self.db)
    }

    /// Run a read-modify-commit cycle, starting over from a fresh read
    /// whenever its commit finds the row rewritten by another writer.
    pub(crate) fn retry_stale<T>(&self, mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
        let mut retries = 0;
        loop {
            match attempt() {
                Err(e) if e.is_stale() && retries < STALE_RETRIES => {
                    retries += 1;
                    debug!(retries, error = %e, "lost a write race; reading again");
                }
                result => return result,
            }
        }
    }

    /// Run `f` against the locked database.
    pub(crate) fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let db = self
            .db
            .lock()
            .map_err(|_| DatabaseError::LockPoisoned("context".to_string()))?;
        f(&db)
    }
}

/// A signed-in user.
pub struct Session {
    ctx: Arc<VaulticContext>,
    user_id: i64,
}

impl Session {
    /// Create a new account, deriving the master key from `password`.
    pub async fn create_account(
        ctx: Arc<VaulticContext>,
        email: &str,
        password: &[u8],
    ) -> Result<Self> {
        let params = ctx.settings().kdf.clone();
        let master = derive_master_key(password, &params)?;
        ctx.with_db(|db| db.save_kdf_params(&params))?;
        Self::create_account_with_key(ctx, email, master).await
    }

    /// Create a new account under an already-derived master key.
    pub async fn create_account_with_key(
        ctx: Arc<VaulticContext>,
        email: &str,
        master: SymmetricKey,
    ) -> Result<Self> {
        let _guard = Arc::clone(ctx.sync_guard()).lock_owned().await;

        let key_pair = KeyPair::generate();
        let user = User::new(email, &key_pair.public_key_b64(), &key_pair.secret_key_b64());
        let user_id = user.id();

        let mut tx = Transaction::new();
        tx.insert(user, &master);
        for kind in StoreStateKind::USER_KINDS {
            tx.insert(StoreState::empty(kind, user_id), &master);
        }
        ctx.commit(tx)?;

        ctx.keys().set_master_key(master);
        info!(user_id, "account created");
        Ok(Self { ctx, user_id })
    }

    /// Sign in with the master password, using the stored KDF parameters.
    pub async fn sign_in(ctx: Arc<VaulticContext>, user_id: i64, password: &[u8]) -> Result<Self> {
        let params = ctx
            .with_db(|db| db.load_kdf_params())?
            .ok_or_else(|| VaulticError::InvalidInput("vault has no KDF parameters".to_string()))?;
        let master = derive_master_key(password, &params)?;
        Self::unlock(ctx, user_id, master).await
    }

    /// Sign in with an already-derived master key.
    ///
    /// Waits for a running sync to finish. When the user is stored locally
    /// the key must verify it; a fresh device has nothing to check yet.
    pub async fn unlock(ctx: Arc<VaulticContext>, user_id: i64, master: SymmetricKey) -> Result<Self> {
        let _guard = Arc::clone(ctx.sync_guard()).lock_owned().await;

        let users = ctx.repository::<User>();
        if users.retrieve(user_id)?.is_some() {
            users.retrieve_and_verify(&master, |u| u.id() == user_id)?;
        } else {
            info!(user_id, "no local user yet; unlocking for first pull");
        }

        ctx.keys().set_master_key(master);
        let session = Self { ctx, user_id };
        let loaded = session.load_vault_keys()?;
        info!(user_id, vault_keys = loaded, "signed in");
        Ok(session)
    }

    /// Clear every cached key. Waits for a running sync first.
    pub async fn sign_out(&self) {
        let _guard = self.ctx.sync_guard().lock().await;
        self.ctx.keys().clear();
        info!(user_id = self.user_id, "signed out");
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn context(&self) -> &Arc<VaulticContext> {
        &self.ctx
    }

    /// Unwrap the key of every verified, set-up membership into the cache.
    pub fn load_vault_keys(&self) -> Result<usize> {
        let master = self.ctx.master_key()?;
        let user_id = self.user_id;
        let links = self.ctx.repository::<UserVault>().retrieve_and_verify_all(
            |_| Some(master.clone()),
            |link| link.user_id == user_id && link.is_setup,
        )?;

        let mut loaded = 0;
        for link in links {
            match unwrap_key(&master, &link.vault_key) {
                Ok(key) => {
                    self.ctx.keys().insert_vault_key(link.vault_id, key);
                    loaded += 1;
                }
                Err(e) => warn!(vault_id = link.vault_id, error = %e, "cannot unwrap vault key"),
            }
        }
        Ok(loaded)
    }

    /// The signed-in user, verified.
    pub fn user(&self) -> Result<User> {
        let master = self.ctx.master_key()?;
        let user_id = self.user_id;
        self.ctx
            .repository::<User>()
            .retrieve_and_verify(&master, |u| u.id() == user_id)?
            .ok_or(VaulticError::EntityNotFound {
                kind: User::KIND,
                id: user_id,
            })
    }

    /// The user's X25519 key pair, from the decrypted private key.
    pub fn key_pair(&self) -> Result<KeyPair> {
        let master = self.ctx.master_key()?;
        let user = self.user()?;
        let secret = decrypt_field(&user, &master, "privateKey")?.ok_or_else(|| {
            VaulticError::InvariantViolation("user has no private key".to_string())
        })?;
        Ok(KeyPair::from_secret_b64(&secret)?)
    }

    /// Create a vault owned by this user, with its store states.
    pub fn create_vault(&self, name: &str) -> Result<Vault> {
        let master = self.ctx.master_key()?;
        let vault_key = SymmetricKey::generate();

        let vault = Vault::new(name);
        let vault_id = vault.id();
        let mut link = UserVault::new(self.user_id, vault_id, true);
        link.set("vaultKey", encode_key(&vault_key))?;
        let link_id = link.id();

        let mut tx = Transaction::new();
        tx.insert(vault, &vault_key).insert(link, &master);
        for kind in StoreStateKind::VAULT_KINDS {
            tx.insert(StoreState::empty(kind, vault_id), &vault_key);
        }
        tx.insert(
            StoreState::empty(StoreStateKind::VaultPreferences, link_id),
            &master,
        );
        let committed = self.ctx.commit(tx)?;

        self.ctx.keys().insert_vault_key(vault_id, vault_key);
        info!(vault_id, "vault created");
        committed
            .into_iter()
            .next()
            .and_then(AnyEntity::into_entity)
            .ok_or_else(|| VaulticError::InvariantViolation("vault missing from commit".to_string()))
    }

    /// Verified vault by id.
    pub fn vault(&self, vault_id: i64) -> Result<Vault> {
        let key = self.ctx.key_for(KeyScope::Vault(vault_id))?;
        self.ctx
            .repository::<Vault>()
            .retrieve_and_verify(&key, |v| v.id() == vault_id)?
            .ok_or(VaulticError::EntityNotFound {
                kind: Vault::KIND,
                id: vault_id,
            })
    }

    /// This user's membership in `vault_id`, verified.
    pub fn user_vault(&self, vault_id: i64) -> Result<UserVault> {
        let master = self.ctx.master_key()?;
        let user_id = self.user_id;
        self.ctx
            .repository::<UserVault>()
            .retrieve_and_verify(&master, |l| l.user_id == user_id && l.vault_id == vault_id)?
            .ok_or(VaulticError::EntityNotFound {
                kind: UserVault::KIND,
                id: vault_id,
            })
    }

    /// Decrypted vault name.
    pub fn vault_name(&self, vault_id: i64) -> Result<String> {
        let key = self.ctx.key_for(KeyScope::Vault(vault_id))?;
        let vault = self.vault(vault_id)?;
        Ok(decrypt_field(&vault, &key, "name")?.unwrap_or_default())
    }

    pub fn rename_vault(&self, vault_id: i64, name: &str) -> Result<Vault> {
        self.ctx.retry_stale(|| {
            let mut vault = self.vault(vault_id)?;
            vault.set("name", name)?;
            self.save(vault)
        })
    }

    /// Re-sign and persist a locally modified entity.
    ///
    /// Fails with [`VaulticError::Stale`] if the stored row changed since
    /// `entity` was read.
    pub fn save<E: Entity>(&self, entity: E) -> Result<E> {
        let key = self.ctx.key_for(entity.key_scope())?;
        let mut tx = Transaction::new();
        tx.update(entity.into_any(), &key);
        self.ctx
            .commit(tx)?
            .into_iter()
            .next()
            .and_then(AnyEntity::into_entity)
            .ok_or_else(|| VaulticError::InvariantViolation("entity missing from commit".to_string()))
    }

    /// Tombstone a vault and this user's membership until the server confirms.
    pub fn delete_vault(&self, vault_id: i64) -> Result<()> {
        let link = self.user_vault(vault_id)?;
        let mut tx = Transaction::new();
        self.ctx
            .repository::<UserVault>()
            .mark_deleted(&mut tx, link.id());
        self.ctx.repository::<Vault>().mark_deleted(&mut tx, vault_id);
        self.ctx.commit(tx)?;
        info!(vault_id, "vault marked deleted");
        Ok(())
    }

    /// Owner id for a store state of `kind`: the user, a vault or this user's membership.
    fn resolve_owner(&self, kind: StoreStateKind, vault_id: Option<i64>) -> Result<i64> {
        match (kind.owner(), vault_id) {
            (StoreOwner::User, _) => Ok(self.user_id),
            (StoreOwner::Vault, Some(vault_id)) => Ok(vault_id),
            (StoreOwner::UserVault, Some(vault_id)) => Ok(self.user_vault(vault_id)?.id()),
            (_, None) => Err(VaulticError::InvalidInput(format!(
                "{} store state needs a vault id",
                kind.as_str()
            ))),
        }
    }

    /// Verified store state of `kind`. Vault-owned and membership-owned
    /// kinds take the vault id; user-owned kinds ignore it.
    pub fn store_state(&self, kind: StoreStateKind, vault_id: Option<i64>) -> Result<StoreState> {
        let owner_id = self.resolve_owner(kind, vault_id)?;
        let candidates = self.ctx.repository::<StoreState>().retrieve_owned(owner_id)?;
        let state = candidates
            .into_iter()
            .find(|s| s.kind == kind)
            .ok_or(VaulticError::EntityNotFound {
                kind: StoreState::KIND,
                id: owner_id,
            })?;
        let key = self.ctx.key_for(state.key_scope())?;
        crate::entity::verify_entity(&state, &key).map_err(|_| VaulticError::Verification {
            kind: StoreState::KIND,
            id: state.id(),
        })?;
        Ok(state)
    }

    /// Decrypted JSON document of a store state.
    pub fn read_store_state(&self, kind: StoreStateKind, vault_id: Option<i64>) -> Result<Value> {
        let state = self.store_state(kind, vault_id)?;
        let key = self.ctx.key_for(state.key_scope())?;
        decrypt_document(&state, &key)
    }

    /// Apply `ops` to a store state and log them, in one commit.
    pub fn edit_store_state(
        &self,
        kind: StoreStateKind,
        vault_id: Option<i64>,
        ops: &[ChangeOp],
    ) -> Result<StoreState> {
        self.ctx.retry_stale(|| {
            let mut state = self.store_state(kind, vault_id)?;
            let key = self.ctx.key_for(state.key_scope())?;

            let mut document = decrypt_document(&state, &key)?;
            merge::apply_ops(&mut document, ops)?;
            let entry = ChangeTracking::for_store_state(&state, ops)?;
            state.set("state", document.to_string())?;

            let mut tx = Transaction::new();
            tx.update(state, &key).insert(entry, &key);
            self.ctx
                .commit(tx)?
                .into_iter()
                .next()
                .and_then(AnyEntity::into_entity)
                .ok_or_else(|| {
                    VaulticError::InvariantViolation("store state missing from commit".to_string())
                })
        })
    }

    /// The plaintext vault key, for sealing to another user.
    pub fn export_vault_key(&self, vault_id: i64) -> Result<SymmetricKey> {
        let link = self.user_vault(vault_id)?;
        let master = self.ctx.master_key()?;
        let encoded = decrypt_field(&link, &master, "vaultKey")?.ok_or_else(|| {
            VaulticError::InvariantViolation(format!("membership {} has no vault key", link.id()))
        })?;
        Ok(decode_key(&encoded)?)
    }
}

/// Parse the decrypted `state` document; an empty field reads as `{}`.
pub(crate) fn decrypt_document(state: &StoreState, key: &SymmetricKey) -> Result<Value> {
    match decrypt_field(state, key, "state")? {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| VaulticError::InvalidInput(format!("store state document: {}", e))),
        None => Ok(Value::Object(Default::default())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityState;
    use crate::test_support::{init_tracing, key};
    use serde_json::json;

    fn context() -> Arc<VaulticContext> {
        init_tracing();
        Arc::new(VaulticContext::in_memory(VaulticSettings::default()).unwrap())
    }

    #[tokio::test]
    async fn account_and_vault_lifecycle() {
        let ctx = context();
        let session = Session::create_account_with_key(ctx.clone(), "me@example.com", key(1))
            .await
            .unwrap();

        let vault = session.create_vault("Personal").unwrap();
        assert_eq!(session.vault_name(vault.id()).unwrap(), "Personal");
        let link = session.user_vault(vault.id()).unwrap();
        assert!(link.is_owner);
        assert_ne!(link.vault_key.len(), 0);

        session.rename_vault(vault.id(), "Work").unwrap();
        assert_eq!(session.vault_name(vault.id()).unwrap(), "Work");

        // sign out, then back in from the stored memberships
        session.sign_out().await;
        assert!(matches!(session.vault(vault.id()), Err(VaulticError::VaultLocked)));
        let session = Session::unlock(ctx.clone(), session.user_id(), key(1))
            .await
            .unwrap();
        assert_eq!(session.vault_name(vault.id()).unwrap(), "Work");
        assert_eq!(
            session.export_vault_key(vault.id()).unwrap(),
            ctx.keys().key_for(KeyScope::Vault(vault.id())).unwrap()
        );
    }

    #[tokio::test]
    async fn wrong_master_key_is_refused() {
        let ctx = context();
        let session = Session::create_account_with_key(ctx.clone(), "me@example.com", key(1))
            .await
            .unwrap();
        session.sign_out().await;

        let err = Session::unlock(ctx.clone(), session.user_id(), key(2))
            .await
            .err()
            .unwrap();
        assert!(err.is_verification());
        assert!(!ctx.keys().is_unlocked());
    }

    #[tokio::test]
    async fn store_state_edits_are_logged() {
        let ctx = context();
        let session = Session::create_account_with_key(ctx.clone(), "me@example.com", key(1))
            .await
            .unwrap();
        let vault = session.create_vault("Personal").unwrap();

        let state = session
            .edit_store_state(
                StoreStateKind::Password,
                Some(vault.id()),
                &[ChangeOp::add("p1", json!({"login": "me", "password": "hunter2"}))],
            )
            .unwrap();
        assert_eq!(state.base.properties_to_sync, vec!["state".to_string()]);
        assert_eq!(
            session
                .read_store_state(StoreStateKind::Password, Some(vault.id()))
                .unwrap(),
            json!({"p1": {"login": "me", "password": "hunter2"}})
        );

        let entries = ctx
            .repository::<ChangeTracking>()
            .retrieve_owned(vault.id())
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].object_id, state.id());
        assert!(!entries[0].changes.contains("hunter2"));

        // membership-owned preferences resolve through the user vault
        session
            .edit_store_state(
                StoreStateKind::VaultPreferences,
                Some(vault.id()),
                &[ChangeOp::add("color", json!("blue"))],
            )
            .unwrap();
        assert!(session
            .store_state(StoreStateKind::VaultPreferences, None)
            .is_err());
    }

    #[tokio::test]
    async fn concurrent_edits_all_land() {
        let ctx = context();
        let session = Session::create_account_with_key(ctx.clone(), "me@example.com", key(1))
            .await
            .unwrap();
        let vault = session.create_vault("Personal").unwrap();
        let vault_id = Some(vault.id());
        let rounds = 25;

        let barrier = std::sync::Barrier::new(2);
        std::thread::scope(|scope| {
            for who in ["a", "b"] {
                let session = &session;
                let barrier = &barrier;
                scope.spawn(move || {
                    for round in 0..rounds {
                        barrier.wait();
                        session
                            .edit_store_state(
                                StoreStateKind::Password,
                                vault_id,
                                &[ChangeOp::add(&format!("{}{}", who, round), json!(round))],
                            )
                            .unwrap();
                    }
                });
            }
        });

        let doc = session
            .read_store_state(StoreStateKind::Password, vault_id)
            .unwrap();
        assert_eq!(doc.as_object().map(|o| o.len()), Some(2 * rounds));
        let entries = ctx
            .repository::<ChangeTracking>()
            .retrieve_owned(vault.id())
            .unwrap();
        assert_eq!(entries.len(), 2 * rounds);
    }

    #[test]
    fn in_memory_context_validates_settings() {
        let mut settings = VaulticSettings::default();
        settings.sync.pull_page_limit = 0;
        assert!(matches!(
            VaulticContext::in_memory(settings),
            Err(VaulticError::Config(_))
        ));
    }

    #[tokio::test]
    async fn delete_vault_leaves_tombstones() {
        let ctx = context();
        let session = Session::create_account_with_key(ctx.clone(), "me@example.com", key(1))
            .await
            .unwrap();
        let vault = session.create_vault("Personal").unwrap();

        session.delete_vault(vault.id()).unwrap();
        let stored = ctx
            .repository::<Vault>()
            .retrieve(vault.id())
            .unwrap()
            .unwrap();
        assert_eq!(stored.base.entity_state, EntityState::Deleted);
    }

    #[tokio::test]
    async fn password_accounts_store_kdf_params() {
        let ctx = Arc::new(
            VaulticContext::in_memory(VaulticSettings {
                kdf: crate::crypto::KdfParams {
                    mem_cost: crate::crypto::kdf::MIN_MEM_COST,
                    time_cost: 1,
                    parallelism: 1,
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap(),
        );
        let session = Session::create_account(ctx.clone(), "me@example.com", b"correct horse")
            .await
            .unwrap();
        session.sign_out().await;

        assert!(Session::sign_in(ctx.clone(), session.user_id(), b"wrong")
            .await
            .is_err());
        Session::sign_in(ctx.clone(), session.user_id(), b"correct horse")
            .await
            .unwrap();
    }
}
