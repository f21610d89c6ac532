//! Typed access to one entity table.
//!
//! Reads go straight to the database and verify signatures before handing
//! entities out. Writes never touch the database directly: they queue an
//! [`Operation`] on a caller-owned [`Transaction`].

use crate::crypto::SymmetricKey;
use crate::database::{rows, Database};
use crate::entity::{signing, Entity};
use crate::transaction::{DeleteFilter, Transaction};
use crate::{DatabaseError, Result, VaulticError};
use serde_json::{Map, Value};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Repository for entities of type `E`.
pub struct Repository<E: Entity> {
    db: Arc<Mutex<Database>>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Clone for Repository<E> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.db))
    }
}

impl<E: Entity> Repository<E> {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self {
            db,
            _entity: PhantomData,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|_| DatabaseError::LockPoisoned(format!("{} repository", E::KIND)).into())
    }

    /// Load one entity without verifying it.
    pub fn retrieve(&self, id: i64) -> Result<Option<E>> {
        rows::load(self.lock()?.conn(), id)
    }

    /// Load every entity of this type without verifying them.
    pub fn retrieve_all(&self) -> Result<Vec<E>> {
        rows::load_all(self.lock()?.conn())
    }

    /// Entities owned by `owner_id` (store states, change entries, memberships).
    pub fn retrieve_owned(&self, owner_id: i64) -> Result<Vec<E>> {
        rows::load_owned(self.lock()?.conn(), owner_id)
    }

    /// Entities with unacknowledged local changes.
    pub fn retrieve_pending(&self) -> Result<Vec<E>> {
        rows::load_pending(self.lock()?.conn())
    }

    /// First entity matching `predicate`, verified with `key`.
    ///
    /// A matching entity that fails verification is an error, never a
    /// silent `None`.
    pub fn retrieve_and_verify<P>(&self, key: &SymmetricKey, predicate: P) -> Result<Option<E>>
    where
        P: Fn(&E) -> bool,
    {
        let Some(entity) = self.retrieve_all()?.into_iter().find(|e| predicate(e)) else {
            return Ok(None);
        };
        signing::verify_entity(&entity, key).map_err(|e| {
            warn!(kind = %E::KIND, id = entity.id(), error = %e, "entity failed verification");
            VaulticError::Verification {
                kind: E::KIND,
                id: entity.id(),
            }
        })?;
        Ok(Some(entity))
    }

    /// Every entity matching `predicate` that verifies with the key
    /// `key_for` returns. Entities that fail, or have no key, are skipped.
    pub fn retrieve_and_verify_all<K, P>(&self, key_for: K, predicate: P) -> Result<Vec<E>>
    where
        K: Fn(&E) -> Option<SymmetricKey>,
        P: Fn(&E) -> bool,
    {
        let verified = self
            .retrieve_all()?
            .into_iter()
            .filter(|e| predicate(e))
            .filter(|entity| match key_for(entity) {
                Some(key) => match signing::verify_entity(entity, &key) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(kind = %E::KIND, id = entity.id(), error = %e, "skipping unverifiable entity");
                        false
                    }
                },
                None => {
                    warn!(kind = %E::KIND, id = entity.id(), "skipping entity without a key");
                    false
                }
            })
            .collect();
        Ok(verified)
    }

    pub fn sign_and_insert(&self, tx: &mut Transaction, key: &SymmetricKey, entity: E) {
        tx.insert(entity.into_any(), key);
    }

    pub fn sign_and_update(&self, tx: &mut Transaction, key: &SymmetricKey, entity: E) {
        tx.update(entity.into_any(), key);
    }

    /// Persist a trusted, already-signed entity as acknowledged.
    pub fn insert_existing(&self, tx: &mut Transaction, entity: E) {
        tx.insert_existing(entity.into_any());
    }

    /// Patch server-trusted fields. Only the type's overridable properties
    /// and signature metadata are accepted; nothing is signed.
    pub fn override_fields(&self, tx: &mut Transaction, id: i64, patch: Map<String, Value>) {
        tx.override_fields(E::KIND, id, patch);
    }

    pub fn reset_tracking(&self, tx: &mut Transaction, key: &SymmetricKey, entity: E) {
        tx.reset_tracking(entity.into_any(), key);
    }

    /// Tombstone the entity until the server confirms its removal.
    pub fn mark_deleted(&self, tx: &mut Transaction, id: i64) {
        tx.mark_deleted(E::KIND, id);
    }

    pub fn delete(&self, tx: &mut Transaction, id: i64) {
        tx.delete(E::KIND, DeleteFilter::Id(id));
    }

    pub fn delete_owned(&self, tx: &mut Transaction, owner_id: i64) {
        tx.delete(E::KIND, DeleteFilter::Owner(owner_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{StoreState, StoreStateKind, Vault};
    use crate::test_support::{key, test_db};

    #[test]
    fn verified_reads() {
        let db = test_db();
        let vaults = Repository::<Vault>::new(db.clone());
        let (k1, k2) = (key(1), key(2));
        let personal = Vault::new("Personal");
        let work = Vault::new("Work");

        let mut tx = Transaction::new();
        vaults.sign_and_insert(&mut tx, &k1, personal.clone());
        vaults.sign_and_insert(&mut tx, &k2, work.clone());
        tx.commit(&db).unwrap();

        let found = vaults
            .retrieve_and_verify(&k1, |v| v.id() == personal.id())
            .unwrap()
            .unwrap();
        assert_eq!(found.id(), personal.id());
        assert!(vaults
            .retrieve_and_verify(&k1, |v| v.id() == -1)
            .unwrap()
            .is_none());

        let err = vaults
            .retrieve_and_verify(&k1, |v| v.id() == work.id())
            .unwrap_err();
        assert!(err.is_verification());

        // k1 only verifies one of the two
        let all = vaults
            .retrieve_and_verify_all(|_| Some(k1.clone()), |_| true)
            .unwrap();
        assert_eq!(all.len(), 1);
        let keyed = vaults
            .retrieve_and_verify_all(
                |v| Some(if v.id() == personal.id() { k1.clone() } else { k2.clone() }),
                |_| true,
            )
            .unwrap();
        assert_eq!(keyed.len(), 2);
        assert!(vaults
            .retrieve_and_verify_all(|_| None, |_| true)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn owned_and_pending() {
        let db = test_db();
        let k = key(3);
        let vault = Vault::new("Personal");
        let mut tx = Transaction::new();
        tx.insert(vault.clone(), &k);
        let states = Repository::<StoreState>::new(db.clone());
        for kind in StoreStateKind::VAULT_KINDS {
            states.sign_and_insert(&mut tx, &k, StoreState::empty(kind, vault.id()));
        }
        let committed = tx.commit(&db).unwrap();

        assert_eq!(states.retrieve_owned(vault.id()).unwrap().len(), 5);
        assert_eq!(states.retrieve_pending().unwrap().len(), 5);

        let mut reset = Transaction::new();
        for entity in committed.into_iter().skip(1) {
            reset.reset_tracking(entity, &k);
        }
        reset.commit(&db).unwrap();
        assert!(states.retrieve_pending().unwrap().is_empty());

        let mut tombstone = Transaction::new();
        Repository::<Vault>::new(db.clone()).mark_deleted(&mut tombstone, vault.id());
        tombstone.commit(&db).unwrap();
        let vaults = Repository::<Vault>::new(db.clone());
        assert_eq!(vaults.retrieve_pending().unwrap().len(), 1);

        let mut gone = Transaction::new();
        vaults.delete(&mut gone, vault.id());
        gone.commit(&db).unwrap();
        assert!(vaults.retrieve(vault.id()).unwrap().is_none());
        assert!(states.retrieve_owned(vault.id()).unwrap().is_empty());
    }
}
