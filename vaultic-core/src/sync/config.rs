//! Sync metadata stored in the local database.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::ChangeScope;
use crate::sync::models::OwnerVersion;
use crate::{DatabaseError, Result};

/// Per-device sync state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub device_id: Option<Uuid>,
    pub last_sync_at: Option<i64>,
}

impl SyncMetadata {
    /// Load sync metadata from the database. Returns default if no row exists.
    pub fn load(conn: &rusqlite::Connection) -> Result<Self> {
        let result = conn.query_row(
            "SELECT device_id, last_sync_at FROM sync_metadata WHERE id = 1",
            [],
            |row| {
                let device_id: Option<String> = row.get(0)?;
                let last_sync_at: Option<i64> = row.get(1)?;
                Ok(SyncMetadata {
                    device_id: device_id.and_then(|s| Uuid::parse_str(&s).ok()),
                    last_sync_at,
                })
            },
        );

        match result {
            Ok(metadata) => Ok(metadata),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(Self::default()),
            Err(e) => Err(DatabaseError::Sqlite(e).into()),
        }
    }

    /// Load, assigning and persisting a device id on first use.
    pub fn load_or_init(conn: &rusqlite::Connection) -> Result<Self> {
        let mut metadata = Self::load(conn)?;
        if metadata.device_id.is_none() {
            metadata.device_id = Some(Uuid::new_v4());
            metadata.save(conn)?;
        }
        Ok(metadata)
    }

    /// Save sync metadata to the database (upsert).
    pub fn save(&self, conn: &rusqlite::Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO sync_metadata (id, device_id, last_sync_at)
             VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
                device_id = excluded.device_id,
                last_sync_at = excluded.last_sync_at",
            rusqlite::params![self.device_id.map(|u| u.to_string()), self.last_sync_at],
        )
        .map_err(DatabaseError::Sqlite)?;

        Ok(())
    }

    /// Record a completed sync now.
    pub fn touch(conn: &rusqlite::Connection) -> Result<()> {
        let mut metadata = Self::load_or_init(conn)?;
        metadata.last_sync_at = Some(chrono::Utc::now().timestamp());
        metadata.save(conn)
    }
}

/// Highest change version loaded from the server for one owner (0 if none).
pub fn last_loaded_change_version(
    conn: &rusqlite::Connection,
    scope: ChangeScope,
    owner_id: i64,
) -> Result<i64> {
    let result = conn.query_row(
        "SELECT last_loaded_change_version FROM owner_change_versions
         WHERE scope = ?1 AND owner_id = ?2",
        rusqlite::params![scope.as_str(), owner_id],
        |row| row.get(0),
    );
    match result {
        Ok(version) => Ok(version),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
        Err(e) => Err(DatabaseError::Sqlite(e).into()),
    }
}

/// Advance the loaded version for an owner. Never moves backwards.
pub fn advance_change_version(
    conn: &rusqlite::Connection,
    scope: ChangeScope,
    owner_id: i64,
    version: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO owner_change_versions (scope, owner_id, last_loaded_change_version)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(scope, owner_id) DO UPDATE SET
            last_loaded_change_version =
                MAX(last_loaded_change_version, excluded.last_loaded_change_version)",
        rusqlite::params![scope.as_str(), owner_id, version],
    )
    .map_err(DatabaseError::Sqlite)?;
    Ok(())
}

/// Every owner's loaded version, for a pull request.
pub fn owner_versions(conn: &rusqlite::Connection) -> Result<Vec<OwnerVersion>> {
    let mut stmt = conn
        .prepare(
            "SELECT scope, owner_id, last_loaded_change_version
             FROM owner_change_versions ORDER BY scope, owner_id",
        )
        .map_err(DatabaseError::Sqlite)?;
    let rows = stmt
        .query_map([], |row| {
            let scope: String = row.get(0)?;
            Ok((scope, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })
        .map_err(DatabaseError::Sqlite)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(DatabaseError::Sqlite)?;

    Ok(rows
        .into_iter()
        .filter_map(|(scope, owner_id, version)| {
            let scope = match scope.as_str() {
                "User" => ChangeScope::User,
                "UserVault" => ChangeScope::UserVault,
                "Vault" => ChangeScope::Vault,
                _ => return None,
            };
            Some(OwnerVersion {
                scope,
                owner_id,
                last_loaded_change_version: version,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();
        db
    }

    #[test]
    fn default_metadata() {
        let metadata = SyncMetadata::default();
        assert!(metadata.device_id.is_none());
        assert!(metadata.last_sync_at.is_none());
    }

    #[test]
    fn device_id_is_stable() {
        let db = db();
        let first = SyncMetadata::load_or_init(db.conn()).unwrap();
        let second = SyncMetadata::load_or_init(db.conn()).unwrap();
        assert!(first.device_id.is_some());
        assert_eq!(first.device_id, second.device_id);

        SyncMetadata::touch(db.conn()).unwrap();
        let touched = SyncMetadata::load(db.conn()).unwrap();
        assert_eq!(touched.device_id, first.device_id);
        assert!(touched.last_sync_at.is_some());
    }

    #[test]
    fn change_versions_only_advance() {
        let db = db();
        let conn = db.conn();
        assert_eq!(last_loaded_change_version(conn, ChangeScope::Vault, 9).unwrap(), 0);

        advance_change_version(conn, ChangeScope::Vault, 9, 4).unwrap();
        advance_change_version(conn, ChangeScope::Vault, 9, 2).unwrap();
        advance_change_version(conn, ChangeScope::User, 1, 1).unwrap();
        assert_eq!(last_loaded_change_version(conn, ChangeScope::Vault, 9).unwrap(), 4);

        let all = owner_versions(conn).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains(&OwnerVersion {
            scope: ChangeScope::Vault,
            owner_id: 9,
            last_loaded_change_version: 4
        }));
    }
}
