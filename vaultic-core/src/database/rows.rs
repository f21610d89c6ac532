//! Row-level reads and writes for entity tables.
//!
//! Each entity row stores the full JSON record plus the columns needed for
//! lookups and foreign keys. Functions take a `&Connection` so they run the
//! same inside or outside an SQLite transaction.

use crate::entity::store_state::StoreOwner;
use crate::entity::{
    AnyEntity, ChangeTracking, Entity, EntityKind, EntityState, StoreState, User, UserVault, Vault,
    CURRENT_SIGNATURE,
};
use crate::{DatabaseError, Result, VaulticError};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};

/// Which rows a delete removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteFilter {
    /// The row with this id
    Id(i64),
    /// Every row owned by this id (store states, change entries, memberships)
    Owner(i64),
}

fn parse_record<E: Entity>(record: &str) -> Result<E> {
    serde_json::from_str(record)
        .map_err(|e| DatabaseError::Serialization(format!("{} record: {}", E::KIND, e)).into())
}

fn serialize_record(entity: &AnyEntity) -> Result<String> {
    entity
        .to_record()
        .map_err(|e| DatabaseError::Serialization(e.to_string()).into())
}

/// Load one entity by id.
pub fn load<E: Entity>(conn: &Connection, id: i64) -> Result<Option<E>> {
    let sql = format!("SELECT record FROM {} WHERE id = ?1", E::KIND.table());
    let record: Option<String> = conn
        .query_row(&sql, [id], |row| row.get(0))
        .optional()
        .map_err(DatabaseError::Sqlite)?;
    record.map(|r| parse_record(&r)).transpose()
}

/// Load one entity of any kind by id.
pub fn load_any(conn: &Connection, kind: EntityKind, id: i64) -> Result<Option<AnyEntity>> {
    Ok(match kind {
        EntityKind::User => load::<User>(conn, id)?.map(AnyEntity::from),
        EntityKind::Vault => load::<Vault>(conn, id)?.map(AnyEntity::from),
        EntityKind::UserVault => load::<UserVault>(conn, id)?.map(AnyEntity::from),
        EntityKind::StoreState => load::<StoreState>(conn, id)?.map(AnyEntity::from),
        EntityKind::ChangeTracking => load::<ChangeTracking>(conn, id)?.map(AnyEntity::from),
    })
}

/// Load every entity of a type.
pub fn load_all<E: Entity>(conn: &Connection) -> Result<Vec<E>> {
    let sql = format!("SELECT record FROM {} ORDER BY rowid", E::KIND.table());
    load_with(conn, &sql, [])
}

/// Load entities owned by `owner_id`.
pub fn load_owned<E: Entity>(conn: &Connection, owner_id: i64) -> Result<Vec<E>> {
    let sql = match E::KIND {
        EntityKind::StoreState | EntityKind::ChangeTracking => format!(
            "SELECT record FROM {} WHERE owner_id = ?1 ORDER BY rowid",
            E::KIND.table()
        ),
        EntityKind::UserVault => {
            "SELECT record FROM user_vaults WHERE user_id = ?1 OR vault_id = ?1 ORDER BY rowid"
                .to_string()
        }
        EntityKind::User | EntityKind::Vault => {
            return Err(VaulticError::InvalidInput(format!(
                "{} rows have no owner",
                E::KIND
            )))
        }
    };
    load_with(conn, &sql, [owner_id])
}

/// Load entities whose `entity_state` is not `Unchanged`.
pub fn load_pending<E: Entity>(conn: &Connection) -> Result<Vec<E>> {
    let sql = format!(
        "SELECT record FROM {} WHERE entity_state != ?1 ORDER BY rowid",
        E::KIND.table()
    );
    load_with(conn, &sql, [EntityState::Unchanged.as_str()])
}

/// Change entries the server has not versioned yet.
pub fn load_unacknowledged_changes(
    conn: &Connection,
    object_id: Option<i64>,
) -> Result<Vec<ChangeTracking>> {
    match object_id {
        Some(id) => load_with(
            conn,
            "SELECT record FROM change_tracking WHERE version IS NULL AND object_id = ?1
             ORDER BY change_time, rowid",
            [id],
        ),
        None => load_with(
            conn,
            "SELECT record FROM change_tracking WHERE version IS NULL ORDER BY change_time, rowid",
            [],
        ),
    }
}

fn load_with<E: Entity, P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<E>> {
    let mut stmt = conn.prepare(sql).map_err(DatabaseError::Sqlite)?;
    let records = stmt
        .query_map(params, |row| row.get::<_, String>(0))
        .map_err(DatabaseError::Sqlite)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(DatabaseError::Sqlite)?;
    records.iter().map(|r| parse_record(r)).collect()
}

/// Check whether a row exists.
pub fn exists(conn: &Connection, kind: EntityKind, id: i64) -> Result<bool> {
    let sql = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1)", kind.table());
    let found: bool = conn
        .query_row(&sql, [id], |row| row.get(0))
        .map_err(DatabaseError::Sqlite)?;
    Ok(found)
}

/// Stored `currentSignature` of a row, or `None` when the row is missing.
pub fn stored_signature(conn: &Connection, kind: EntityKind, id: i64) -> Result<Option<String>> {
    let sql = format!("SELECT record FROM {} WHERE id = ?1", kind.table());
    let record: Option<String> = conn
        .query_row(&sql, [id], |row| row.get(0))
        .optional()
        .map_err(DatabaseError::Sqlite)?;
    let Some(record) = record else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(&record)
        .map_err(|e| DatabaseError::Serialization(format!("{} record: {}", kind, e)))?;
    Ok(Some(
        value
            .get(CURRENT_SIGNATURE)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    ))
}

/// Insert a new row. Fails if the id is taken or a parent is missing.
pub fn insert(conn: &Connection, entity: &AnyEntity) -> Result<()> {
    let record = serialize_record(entity)?;
    let state = entity.base().entity_state.as_str();

    match entity {
        AnyEntity::User(user) => conn.execute(
            "INSERT INTO users (id, entity_state, record) VALUES (?1, ?2, ?3)",
            params![user.base.id, state, record],
        ),
        AnyEntity::Vault(vault) => conn.execute(
            "INSERT INTO vaults (id, entity_state, record) VALUES (?1, ?2, ?3)",
            params![vault.base.id, state, record],
        ),
        AnyEntity::UserVault(user_vault) => conn.execute(
            "INSERT INTO user_vaults (id, user_id, vault_id, entity_state, record)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user_vault.base.id,
                user_vault.user_id,
                user_vault.vault_id,
                state,
                record
            ],
        ),
        AnyEntity::StoreState(store_state) => {
            let owner = store_state.owner_id;
            let (user_id, vault_id, user_vault_id) = match store_state.kind.owner() {
                StoreOwner::User => (Some(owner), None, None),
                StoreOwner::Vault => (None, Some(owner), None),
                StoreOwner::UserVault => (None, None, Some(owner)),
            };
            conn.execute(
                "INSERT INTO store_states
                    (id, kind, owner_id, user_id, vault_id, user_vault_id, entity_state, record)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    store_state.base.id,
                    store_state.kind.as_str(),
                    owner,
                    user_id,
                    vault_id,
                    user_vault_id,
                    state,
                    record
                ],
            )
        }
        AnyEntity::ChangeTracking(entry) => conn.execute(
            "INSERT INTO change_tracking
                (id, scope, owner_id, object_id, change_time, version, entity_state, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.base.id,
                entry.scope.as_str(),
                entry.owner_id,
                entry.object_id,
                entry.change_time,
                entry.version,
                state,
                record
            ],
        ),
    }
    .map_err(DatabaseError::Sqlite)?;
    Ok(())
}

/// Rewrite an existing row. Returns `false` when no row has this id.
pub fn update(conn: &Connection, entity: &AnyEntity) -> Result<bool> {
    let record = serialize_record(entity)?;
    let state = entity.base().entity_state.as_str();
    let version = match entity {
        AnyEntity::ChangeTracking(entry) => entry.version,
        _ => None,
    };
    let changed = if entity.kind() == EntityKind::ChangeTracking {
        conn.execute(
            "UPDATE change_tracking SET entity_state = ?2, record = ?3, version = ?4 WHERE id = ?1",
            params![entity.id(), state, record, version],
        )
    } else {
        let sql = format!(
            "UPDATE {} SET entity_state = ?2, record = ?3 WHERE id = ?1",
            entity.kind().table()
        );
        conn.execute(&sql, params![entity.id(), state, record])
    }
    .map_err(DatabaseError::Sqlite)?;
    Ok(changed > 0)
}

/// Patch fields of a stored record without going through the entity type.
///
/// Returns `false` when no row has this id.
pub fn patch(conn: &Connection, kind: EntityKind, id: i64, fields: &Map<String, Value>) -> Result<bool> {
    let sql = format!("SELECT record FROM {} WHERE id = ?1", kind.table());
    let record: Option<String> = conn
        .query_row(&sql, [id], |row| row.get(0))
        .optional()
        .map_err(DatabaseError::Sqlite)?;
    let Some(record) = record else {
        return Ok(false);
    };

    let mut value: Value = serde_json::from_str(&record)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let object = value.as_object_mut().ok_or_else(|| {
        DatabaseError::Serialization(format!("{} {} record is not an object", kind, id))
    })?;
    for (name, field) in fields {
        object.insert(name.clone(), field.clone());
    }
    let version = object.get("version").and_then(Value::as_i64);
    let patched =
        serde_json::to_string(&value).map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    if kind == EntityKind::ChangeTracking {
        conn.execute(
            "UPDATE change_tracking SET record = ?2, version = ?3 WHERE id = ?1",
            params![id, patched, version],
        )
    } else {
        let sql = format!("UPDATE {} SET record = ?2 WHERE id = ?1", kind.table());
        conn.execute(&sql, params![id, patched])
    }
    .map_err(DatabaseError::Sqlite)?;
    Ok(true)
}

/// Delete rows and the change entries that belong to them.
pub fn delete(conn: &Connection, kind: EntityKind, filter: DeleteFilter) -> Result<usize> {
    let deleted = match (kind, filter) {
        (_, DeleteFilter::Id(id)) => {
            let sql = format!("DELETE FROM {} WHERE id = ?1", kind.table());
            let n = conn.execute(&sql, [id]).map_err(DatabaseError::Sqlite)?;
            delete_change_entries(conn, id)?;
            n
        }
        (EntityKind::StoreState, DeleteFilter::Owner(owner)) => {
            let n = conn
                .execute("DELETE FROM store_states WHERE owner_id = ?1", [owner])
                .map_err(DatabaseError::Sqlite)?;
            delete_change_entries(conn, owner)?;
            n
        }
        (EntityKind::ChangeTracking, DeleteFilter::Owner(owner)) => conn
            .execute("DELETE FROM change_tracking WHERE owner_id = ?1", [owner])
            .map_err(DatabaseError::Sqlite)?,
        (EntityKind::UserVault, DeleteFilter::Owner(owner)) => {
            let ids: Vec<i64> = {
                let mut stmt = conn
                    .prepare("SELECT id FROM user_vaults WHERE user_id = ?1 OR vault_id = ?1")
                    .map_err(DatabaseError::Sqlite)?;
                let ids = stmt
                    .query_map([owner], |row| row.get(0))
                    .map_err(DatabaseError::Sqlite)?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(DatabaseError::Sqlite)?;
                ids
            };
            for id in &ids {
                conn.execute("DELETE FROM user_vaults WHERE id = ?1", [id])
                    .map_err(DatabaseError::Sqlite)?;
                delete_change_entries(conn, *id)?;
            }
            ids.len()
        }
        (EntityKind::User | EntityKind::Vault, DeleteFilter::Owner(_)) => {
            return Err(VaulticError::InvalidInput(format!(
                "{} rows have no owner",
                kind
            )))
        }
    };
    Ok(deleted)
}

fn delete_change_entries(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM change_tracking WHERE owner_id = ?1 OR object_id = ?1",
        [id],
    )
    .map_err(DatabaseError::Sqlite)?;
    Ok(())
}

/// Set only the lifecycle state of a stored entity.
pub fn set_entity_state(conn: &Connection, kind: EntityKind, id: i64, state: EntityState) -> Result<bool> {
    let mut patch_fields = Map::new();
    patch_fields.insert(
        "entityState".to_string(),
        Value::String(state.as_str().to_string()),
    );
    if !patch(conn, kind, id, &patch_fields)? {
        return Ok(false);
    }
    let sql = format!("UPDATE {} SET entity_state = ?2 WHERE id = ?1", kind.table());
    conn.execute(&sql, params![id, state.as_str()])
        .map_err(DatabaseError::Sqlite)?;
    Ok(true)
}

/// Ids of tombstoned rows awaiting server acknowledgement.
pub fn tombstones(conn: &Connection, kind: EntityKind) -> Result<Vec<i64>> {
    let sql = format!(
        "SELECT id FROM {} WHERE entity_state = ?1 ORDER BY rowid",
        kind.table()
    );
    let mut stmt = conn.prepare(&sql).map_err(DatabaseError::Sqlite)?;
    let ids = stmt
        .query_map([EntityState::Deleted.as_str()], |row| row.get(0))
        .map_err(DatabaseError::Sqlite)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(DatabaseError::Sqlite)?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::entity::{ChangeOp, StoreStateKind};

    fn db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();
        db
    }

    #[test]
    fn insert_load_update() {
        let db = db();
        let conn = db.conn();
        let mut vault = Vault::new("Personal");
        insert(conn, &vault.clone().into()).unwrap();

        let loaded: Vault = load(conn, vault.base.id).unwrap().unwrap();
        assert_eq!(loaded, vault);

        vault.name = "Work".to_string();
        assert!(update(conn, &vault.clone().into()).unwrap());
        assert_eq!(load::<Vault>(conn, vault.base.id).unwrap().unwrap().name, "Work");

        assert!(!update(conn, &Vault::new("ghost").into()).unwrap());
        assert!(load::<Vault>(conn, 12345).unwrap().is_none());
    }

    #[test]
    fn children_need_parents() {
        let db = db();
        let conn = db.conn();
        let user = User::new("a@example.com", "pub", "priv");
        let vault = Vault::new("Personal");
        let link = UserVault::new(user.base.id, vault.base.id, true);

        assert!(insert(conn, &link.clone().into()).is_err());
        insert(conn, &user.into()).unwrap();
        insert(conn, &vault.into()).unwrap();
        insert(conn, &link.into()).unwrap();
    }

    #[test]
    fn delete_removes_change_entries() {
        let db = db();
        let conn = db.conn();
        let vault = Vault::new("Personal");
        let state = StoreState::empty(StoreStateKind::Password, vault.base.id);
        let entry = ChangeTracking::for_store_state(&state, &[ChangeOp::delete("a")]).unwrap();

        insert(conn, &vault.clone().into()).unwrap();
        insert(conn, &state.clone().into()).unwrap();
        insert(conn, &entry.clone().into()).unwrap();
        assert_eq!(load_unacknowledged_changes(conn, Some(state.base.id)).unwrap().len(), 1);

        assert_eq!(delete(conn, EntityKind::Vault, DeleteFilter::Id(vault.base.id)).unwrap(), 1);
        assert!(!exists(conn, EntityKind::StoreState, state.base.id).unwrap());
        assert!(!exists(conn, EntityKind::ChangeTracking, entry.base.id).unwrap());
    }

    #[test]
    fn patch_and_tombstone() {
        let db = db();
        let conn = db.conn();
        let vault = Vault::new("Personal");
        insert(conn, &vault.clone().into()).unwrap();

        let mut fields = Map::new();
        fields.insert("currentSignature".to_string(), Value::from("v1.server"));
        assert!(patch(conn, EntityKind::Vault, vault.base.id, &fields).unwrap());
        assert!(!patch(conn, EntityKind::Vault, 999, &fields).unwrap());

        let loaded: Vault = load(conn, vault.base.id).unwrap().unwrap();
        assert_eq!(loaded.base.current_signature, "v1.server");
        assert_eq!(loaded.name, "Personal");

        set_entity_state(conn, EntityKind::Vault, vault.base.id, EntityState::Deleted).unwrap();
        assert_eq!(tombstones(conn, EntityKind::Vault).unwrap(), vec![vault.base.id]);
        assert!(load_pending::<Vault>(conn).unwrap().len() == 1);
    }

    #[test]
    fn owner_delete_rejected_for_roots() {
        let db = db();
        assert!(delete(db.conn(), EntityKind::User, DeleteFilter::Owner(1)).is_err());
    }
}
