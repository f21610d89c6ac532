//! Database schema and connection management.

use crate::crypto::KdfParams;
use crate::{DatabaseError, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

/// Current schema version. Incremented when the schema changes.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Main database connection and schema manager
///
/// Every entity row carries its JSON `record`; the other columns exist for
/// lookups and for the foreign keys that enforce parent-before-child order.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).map_err(DatabaseError::Sqlite)?;

        // Enable foreign key constraints
        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(DatabaseError::Sqlite)?;

        Ok(Self { conn })
    }

    /// Create a new in-memory database for testing
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(DatabaseError::Sqlite)?;

        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(DatabaseError::Sqlite)?;

        Ok(Self { conn })
    }

    /// Initialize the database schema
    pub fn initialize_schema(&self) -> Result<()> {
        self.create_db_metadata_table()?;
        self.create_entity_tables()?;
        self.create_sync_tables()?;
        self.create_indexes()?;
        self.create_triggers()?;
        Ok(())
    }

    fn create_db_metadata_table(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS db_metadata (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL,
                kdf_params TEXT,
                created_at INTEGER NOT NULL,
                last_modified INTEGER NOT NULL
            )",
                [],
            )
            .map_err(DatabaseError::Sqlite)?;

        let now = chrono::Utc::now().timestamp();
        self.conn
            .execute(
                "INSERT OR IGNORE INTO db_metadata (id, version, created_at, last_modified)
                 VALUES (1, ?1, ?2, ?2)",
                rusqlite::params![CURRENT_SCHEMA_VERSION, now],
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_entity_tables(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY,
                    entity_state TEXT NOT NULL,
                    record TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS vaults (
                    id INTEGER PRIMARY KEY,
                    entity_state TEXT NOT NULL,
                    record TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS user_vaults (
                    id INTEGER PRIMARY KEY,
                    user_id INTEGER NOT NULL,
                    vault_id INTEGER NOT NULL,
                    entity_state TEXT NOT NULL,
                    record TEXT NOT NULL,
                    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                    FOREIGN KEY (vault_id) REFERENCES vaults(id) ON DELETE CASCADE
                );

                CREATE TABLE IF NOT EXISTS store_states (
                    id INTEGER PRIMARY KEY,
                    kind TEXT NOT NULL,
                    owner_id INTEGER NOT NULL,
                    user_id INTEGER,
                    vault_id INTEGER,
                    user_vault_id INTEGER,
                    entity_state TEXT NOT NULL,
                    record TEXT NOT NULL,
                    UNIQUE (kind, owner_id),
                    CHECK ((user_id IS NOT NULL) + (vault_id IS NOT NULL) + (user_vault_id IS NOT NULL) = 1),
                    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                    FOREIGN KEY (vault_id) REFERENCES vaults(id) ON DELETE CASCADE,
                    FOREIGN KEY (user_vault_id) REFERENCES user_vaults(id) ON DELETE CASCADE
                );

                CREATE TABLE IF NOT EXISTS change_tracking (
                    id INTEGER PRIMARY KEY,
                    scope TEXT NOT NULL,
                    owner_id INTEGER NOT NULL,
                    object_id INTEGER NOT NULL,
                    change_time INTEGER NOT NULL,
                    version INTEGER,
                    entity_state TEXT NOT NULL,
                    record TEXT NOT NULL
                );",
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_sync_tables(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS sync_metadata (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    device_id TEXT,
                    last_sync_at INTEGER
                );

                CREATE TABLE IF NOT EXISTS owner_change_versions (
                    scope TEXT NOT NULL,
                    owner_id INTEGER NOT NULL,
                    last_loaded_change_version INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (scope, owner_id)
                );",
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_indexes(&self) -> Result<()> {
        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_user_vaults_user_id ON user_vaults(user_id)",
            "CREATE INDEX IF NOT EXISTS idx_user_vaults_vault_id ON user_vaults(vault_id)",
            "CREATE INDEX IF NOT EXISTS idx_store_states_owner_id ON store_states(owner_id)",
            "CREATE INDEX IF NOT EXISTS idx_change_tracking_owner_id ON change_tracking(owner_id)",
            "CREATE INDEX IF NOT EXISTS idx_change_tracking_object_id ON change_tracking(object_id)",
        ];
        for sql in &indexes {
            self.conn.execute(sql, []).map_err(DatabaseError::Sqlite)?;
        }
        Ok(())
    }

    fn create_triggers(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TRIGGER IF NOT EXISTS update_db_metadata_timestamp
                 AFTER UPDATE OF version, kdf_params ON db_metadata
                 FOR EACH ROW
                 BEGIN
                     UPDATE db_metadata SET last_modified = (strftime('%s', 'now')) WHERE id = 1;
                 END;",
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    /// Validate the database schema version.
    pub fn validate_schema_version(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .query_row("SELECT version FROM db_metadata WHERE id = 1", [], |row| {
                row.get(0)
            })
            .map_err(DatabaseError::Sqlite)?;

        if version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        Err(DatabaseError::SchemaMismatch {
            expected: CURRENT_SCHEMA_VERSION,
            found: version,
        }
        .into())
    }

    /// Persist the KDF parameters used to derive this device's master key.
    pub fn save_kdf_params(&self, params: &KdfParams) -> Result<()> {
        let json = serde_json::to_string(params)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn
            .execute(
                "UPDATE db_metadata SET kdf_params = ?1 WHERE id = 1",
                [json],
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    /// Load the stored KDF parameters, if the vault has been initialized.
    pub fn load_kdf_params(&self) -> Result<Option<KdfParams>> {
        let json: Option<String> = self
            .conn
            .query_row("SELECT kdf_params FROM db_metadata WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(DatabaseError::Sqlite)?
            .flatten();

        match json {
            Some(json) => {
                let params = serde_json::from_str(&json)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
                Ok(Some(params))
            }
            None => Ok(None),
        }
    }

    /// Get a reference to the underlying connection
    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(db: &Database, sql: &str) -> Vec<String> {
        db.conn
            .prepare(sql)
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_in_memory_database() {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();

        let table_names = names(&db, "SELECT name FROM sqlite_master WHERE type='table'");
        for table in [
            "db_metadata",
            "users",
            "vaults",
            "user_vaults",
            "store_states",
            "change_tracking",
            "sync_metadata",
            "owner_change_versions",
        ] {
            assert!(table_names.contains(&table.to_string()), "missing {table}");
        }

        let index_names = names(
            &db,
            "SELECT name FROM sqlite_master WHERE type='index' AND name LIKE 'idx_%'",
        );
        assert!(index_names.contains(&"idx_user_vaults_user_id".to_string()));
        assert!(index_names.contains(&"idx_change_tracking_owner_id".to_string()));

        let trigger_names = names(&db, "SELECT name FROM sqlite_master WHERE type='trigger'");
        assert!(trigger_names.contains(&"update_db_metadata_timestamp".to_string()));
    }

    #[test]
    fn test_schema_version() {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();
        db.validate_schema_version().unwrap();

        // initializing twice is harmless
        db.initialize_schema().unwrap();
        db.validate_schema_version().unwrap();

        db.conn
            .execute("UPDATE db_metadata SET version = 99 WHERE id = 1", [])
            .unwrap();
        assert!(matches!(
            db.validate_schema_version(),
            Err(crate::VaulticError::Database(DatabaseError::SchemaMismatch {
                expected: CURRENT_SCHEMA_VERSION,
                found: 99
            }))
        ));
    }

    #[test]
    fn test_foreign_keys_enforced() {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();

        let orphan = db.conn.execute(
            "INSERT INTO user_vaults (id, user_id, vault_id, entity_state, record)
             VALUES (1, 10, 20, 'Inserted', '{}')",
            [],
        );
        assert!(orphan.is_err());
    }

    #[test]
    fn test_kdf_params_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("vault.db")).unwrap();
        db.initialize_schema().unwrap();
        assert!(db.load_kdf_params().unwrap().is_none());

        let params = KdfParams::default();
        db.save_kdf_params(&params).unwrap();
        assert_eq!(db.load_kdf_params().unwrap(), Some(params));
    }
}
