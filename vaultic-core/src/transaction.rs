//! Unit of work: an ordered queue of entity operations committed atomically.
//!
//! Commit runs in two phases. First every operation's crypto work (field
//! encryption, signing, verification) runs in parallel; a single failure
//! aborts the batch before anything is written. Then all writes are applied
//! inside one SQLite transaction while holding the database lock, and any
//! error rolls the whole batch back.

use crate::crypto::SymmetricKey;
use crate::database::rows;
use crate::database::Database;
use crate::entity::{fields, signing, tracking, AnyEntity, Entity, EntityKind, EntityState};
use crate::{with_entity, DatabaseError, FieldError, Result, VaulticError};
use rayon::prelude::*;
use serde_json::{Map, Value};
use std::sync::Mutex;
use tracing::{debug, warn};

pub use crate::database::rows::DeleteFilter;

/// A single queued mutation.
#[derive(Debug)]
pub enum Operation {
    /// Encrypt, sign and persist a new entity.
    Insert { entity: AnyEntity, key: SymmetricKey },
    /// Persist an entity that is already signed and trusted, as `Unchanged`.
    InsertExisting { entity: AnyEntity },
    /// Encrypt and re-sign dirty fields, then rewrite the row.
    ///
    /// `expected_signature` is the signature the entity was read with; the
    /// row is only rewritten if it still carries it.
    Update {
        entity: AnyEntity,
        key: SymmetricKey,
        expected_signature: String,
    },
    /// Patch server-trusted fields without signing.
    Override {
        kind: EntityKind,
        id: i64,
        patch: Map<String, Value>,
        /// When set, the patch only applies over a row still signed with it
        expected_signature: Option<String>,
    },
    /// Verify, then mark the entity as acknowledged by the server.
    ResetTracking {
        entity: AnyEntity,
        key: SymmetricKey,
        expected_signature: String,
    },
    /// Keep the row as a `Deleted` tombstone until the server confirms removal.
    MarkDeleted { kind: EntityKind, id: i64 },
    /// Remove rows and their change entries.
    Delete { kind: EntityKind, filter: DeleteFilter },
}

impl Operation {
    fn name(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::InsertExisting { .. } => "insert_existing",
            Self::Update { .. } => "update",
            Self::Override { .. } => "override",
            Self::ResetTracking { .. } => "reset_tracking",
            Self::MarkDeleted { .. } => "mark_deleted",
            Self::Delete { .. } => "delete",
        }
    }

    /// Crypto phase. Touches only the operation's own entity.
    fn prepare(&mut self) -> Result<()> {
        match self {
            Self::Insert { entity, key } => with_entity!(entity, e => prepare_insert(e, key)),
            Self::InsertExisting { entity } => {
                with_entity!(entity, e => tracking::mark_synced(e));
                Ok(())
            }
            Self::Update { entity, key, .. } => with_entity!(entity, e => prepare_update(e, key)),
            Self::Override { kind, patch, .. } => {
                for name in patch.keys() {
                    if !kind.is_overridable(name) {
                        return Err(FieldError::NotOverridable(name.clone()).into());
                    }
                }
                Ok(())
            }
            Self::ResetTracking { entity, key, .. } => with_entity!(entity, e => prepare_reset(e, key)),
            Self::MarkDeleted { .. } | Self::Delete { .. } => Ok(()),
        }
    }

    /// Persistence phase, inside the SQLite transaction.
    fn apply(&self, conn: &rusqlite::Connection) -> Result<()> {
        match self {
            Self::Insert { entity, .. } => {
                if rows::exists(conn, entity.kind(), entity.id())? {
                    return Err(VaulticError::InvalidInput(format!(
                        "{} {} already exists",
                        entity.kind(),
                        entity.id()
                    )));
                }
                rows::insert(conn, entity)
            }
            Self::InsertExisting { entity } => {
                if rows::exists(conn, entity.kind(), entity.id())? {
                    rows::update(conn, entity)?;
                    Ok(())
                } else {
                    rows::insert(conn, entity)
                }
            }
            Self::Update {
                entity,
                expected_signature,
                ..
            }
            | Self::ResetTracking {
                entity,
                expected_signature,
                ..
            } => {
                let clean_update = matches!(self, Self::Update { .. })
                    && entity.base().updated_properties.is_empty();
                if clean_update && rows::exists(conn, entity.kind(), entity.id())? {
                    return Ok(());
                }
                ensure_unchanged(conn, entity.kind(), entity.id(), expected_signature)?;
                if rows::update(conn, entity)? {
                    Ok(())
                } else {
                    Err(VaulticError::EntityNotFound {
                        kind: entity.kind(),
                        id: entity.id(),
                    })
                }
            }
            Self::Override {
                kind,
                id,
                patch,
                expected_signature,
            } => {
                if let Some(expected) = expected_signature {
                    ensure_unchanged(conn, *kind, *id, expected)?;
                }
                if rows::patch(conn, *kind, *id, patch)? {
                    Ok(())
                } else {
                    Err(VaulticError::EntityNotFound { kind: *kind, id: *id })
                }
            }
            Self::MarkDeleted { kind, id } => {
                if rows::set_entity_state(conn, *kind, *id, EntityState::Deleted)? {
                    Ok(())
                } else {
                    Err(VaulticError::EntityNotFound { kind: *kind, id: *id })
                }
            }
            Self::Delete { kind, filter } => {
                let removed = rows::delete(conn, *kind, *filter)?;
                debug!(%kind, ?filter, removed, "deleted rows");
                Ok(())
            }
        }
    }

    fn into_entity(self) -> Option<AnyEntity> {
        match self {
            Self::Insert { entity, .. }
            | Self::InsertExisting { entity }
            | Self::Update { entity, .. }
            | Self::ResetTracking { entity, .. } => Some(entity),
            Self::Override { .. } | Self::MarkDeleted { .. } | Self::Delete { .. } => None,
        }
    }
}

/// Fail with `Stale` when the stored row is no longer the version that was read.
fn ensure_unchanged(
    conn: &rusqlite::Connection,
    kind: EntityKind,
    id: i64,
    expected_signature: &str,
) -> Result<()> {
    match rows::stored_signature(conn, kind, id)? {
        None => Err(VaulticError::EntityNotFound { kind, id }),
        Some(stored) if stored != expected_signature => {
            debug!(%kind, id, "row changed since it was read");
            Err(VaulticError::Stale { kind, id })
        }
        Some(_) => Ok(()),
    }
}

fn prepare_insert<E: Entity>(entity: &mut E, key: &SymmetricKey) -> Result<()> {
    if !entity.base().current_signature.is_empty() {
        return Err(VaulticError::InvalidInput(format!(
            "{} {} is already signed; insert expects a new entity",
            E::KIND,
            entity.id()
        )));
    }
    fields::encrypt_populated(entity, key)?;
    signing::sign_entity(entity, key)?;
    tracking::mark_inserted(entity);
    Ok(())
}

fn prepare_update<E: Entity>(entity: &mut E, key: &SymmetricKey) -> Result<()> {
    if !entity.is_dirty() {
        return Ok(());
    }
    fields::encrypt_updated(entity, key)?;
    if tracking::needs_resign(entity) {
        signing::sign_entity(entity, key)?;
    }
    Ok(())
}

fn prepare_reset<E: Entity>(entity: &mut E, key: &SymmetricKey) -> Result<()> {
    signing::verify_entity(entity, key).map_err(|e| {
        warn!(kind = %E::KIND, id = entity.id(), error = %e, "reset_tracking: verification failed");
        VaulticError::Verification {
            kind: E::KIND,
            id: entity.id(),
        }
    })?;
    tracking::mark_synced(entity);
    Ok(())
}

/// An ordered batch of operations.
#[derive(Debug, Default)]
pub struct Transaction {
    operations: Vec<Operation>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn push(&mut self, operation: Operation) -> &mut Self {
        self.operations.push(operation);
        self
    }

    pub fn insert(&mut self, entity: impl Into<AnyEntity>, key: &SymmetricKey) -> &mut Self {
        self.push(Operation::Insert {
            entity: entity.into(),
            key: key.clone(),
        })
    }

    pub fn insert_existing(&mut self, entity: impl Into<AnyEntity>) -> &mut Self {
        self.push(Operation::InsertExisting {
            entity: entity.into(),
        })
    }

    /// Queue an update of an entity read from the store. The commit fails
    /// with `Stale` if the row was rewritten in the meantime.
    pub fn update(&mut self, entity: impl Into<AnyEntity>, key: &SymmetricKey) -> &mut Self {
        let entity = entity.into();
        let expected_signature = entity.base().current_signature.clone();
        self.push(Operation::Update {
            entity,
            key: key.clone(),
            expected_signature,
        })
    }

    pub fn override_fields(
        &mut self,
        kind: EntityKind,
        id: i64,
        patch: Map<String, Value>,
    ) -> &mut Self {
        self.push(Operation::Override {
            kind,
            id,
            patch,
            expected_signature: None,
        })
    }

    /// Like [`Transaction::override_fields`], but only over the row version
    /// signed with `expected_signature`.
    pub fn override_if_unchanged(
        &mut self,
        kind: EntityKind,
        id: i64,
        expected_signature: &str,
        patch: Map<String, Value>,
    ) -> &mut Self {
        self.push(Operation::Override {
            kind,
            id,
            patch,
            expected_signature: Some(expected_signature.to_string()),
        })
    }

    pub fn reset_tracking(&mut self, entity: impl Into<AnyEntity>, key: &SymmetricKey) -> &mut Self {
        let entity = entity.into();
        let expected_signature = entity.base().current_signature.clone();
        self.push(Operation::ResetTracking {
            entity,
            key: key.clone(),
            expected_signature,
        })
    }

    pub fn mark_deleted(&mut self, kind: EntityKind, id: i64) -> &mut Self {
        self.push(Operation::MarkDeleted { kind, id })
    }

    pub fn delete(&mut self, kind: EntityKind, filter: DeleteFilter) -> &mut Self {
        self.push(Operation::Delete { kind, filter })
    }

    /// Apply every operation atomically.
    ///
    /// Returns the entities carried by the operations, as committed, with
    /// this session's dirtiness cleared. On error nothing was written and the
    /// error names the index of the failing operation.
    #[tracing::instrument(skip_all, fields(operations = self.operations.len()))]
    pub fn commit(mut self, db: &Mutex<Database>) -> Result<Vec<AnyEntity>> {
        // Phase 1: crypto, in parallel, before any write
        let failures: Vec<(usize, VaulticError)> = self
            .operations
            .par_iter_mut()
            .enumerate()
            .filter_map(|(index, op)| op.prepare().err().map(|e| (index, e)))
            .collect();
        if let Some((index, source)) = failures.into_iter().min_by_key(|(i, _)| *i) {
            warn!(index, error = %source, "commit aborted before writing");
            return Err(VaulticError::Transaction {
                index,
                source: Box::new(source),
            });
        }

        // Phase 2: one SQLite transaction under the single-writer lock
        {
            let db = db
                .lock()
                .map_err(|_| DatabaseError::LockPoisoned("Failed to lock database".to_string()))?;
            let tx = db
                .conn()
                .unchecked_transaction()
                .map_err(DatabaseError::Sqlite)?;

            for (index, op) in self.operations.iter().enumerate() {
                if let Err(source) = op.apply(&tx) {
                    warn!(index, op = op.name(), error = %source, "rolling back commit");
                    if let Err(e) = tx.rollback() {
                        warn!(error = %e, "rollback failed");
                    }
                    return Err(VaulticError::Transaction {
                        index,
                        source: Box::new(source),
                    });
                }
            }

            tx.commit().map_err(DatabaseError::Sqlite)?;
        }

        Ok(self
            .operations
            .into_iter()
            .filter_map(Operation::into_entity)
            .map(|mut entity| {
                tracking::clear_session(entity.base_mut());
                entity
            })
            .collect())
    }
}
