//! Vaultic Core Library
//!
//! This library provides the integrity, encryption and synchronization core
//! of the Vaultic password vault: entity signing and verification, selective
//! field encryption, the transactional unit of work, change tracking, and
//! reconciliation of local records against a server-held backup.

pub mod context;
pub mod crypto;
pub mod database;
pub mod entity;
pub mod repository;
pub mod settings;
pub mod sync;
pub mod transaction;

#[cfg(test)]
pub(crate) mod test_support;

pub use context::{Session, VaulticContext};
pub use crypto::{CryptoError, CryptoResult, KeyCache, KeyScope, SymmetricKey};
pub use database::Database;
pub use entity::{
    AnyEntity, ChangeTracking, Entity, EntityKind, EntityState, StoreState, StoreStateKind, User,
    UserVault, Vault,
};
pub use settings::{SyncSettings, VaulticSettings};
pub use transaction::{DeleteFilter, Operation, Transaction};

use thiserror::Error;

/// Result type for vault core operations
pub type Result<T> = std::result::Result<T, VaulticError>;

/// Errors raised by the storage layer
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: i32, found: i32 },

    #[error("Database error: {0}")]
    Other(String),
}

/// Errors raised while reading or writing individual entity properties
#[derive(Error, Debug)]
pub enum FieldError {
    #[error("Unknown property `{0}`")]
    UnknownProperty(String),

    #[error("Property `{0}` is not encryptable")]
    NotEncryptable(String),

    #[error("Property `{0}` cannot be overridden")]
    NotOverridable(String),

    #[error("Invalid value for `{name}`: {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("Failed to encrypt `{name}`: {source}")]
    Encryption { name: String, source: CryptoError },

    #[error("Failed to decrypt `{name}`: {source}")]
    Decryption { name: String, source: CryptoError },
}

/// General error type for vault core operations
#[derive(Error, Debug)]
pub enum VaulticError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Field error: {0}")]
    Field(#[from] FieldError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Signature verification failed for {kind} {id}")]
    Verification { kind: EntityKind, id: i64 },

    #[error("Transaction failed at operation {index}: {source}")]
    Transaction {
        index: usize,
        #[source]
        source: Box<VaulticError>,
    },

    #[error("{kind} {id} not found")]
    EntityNotFound { kind: EntityKind, id: i64 },

    #[error("{kind} {id} was changed by another writer")]
    Stale { kind: EntityKind, id: i64 },

    #[error("Gave up after {rounds} re-push rounds")]
    RePushLimitExceeded { rounds: u32 },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("A sync is already in progress")]
    SyncInProgress,

    #[error("Vault is locked")]
    VaultLocked,

    #[error("Backup server error: {0}")]
    Server(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VaulticError {
    /// Whether this failure means an entity could not be trusted.
    ///
    /// Reconciliation treats such entities as absent instead of merging them.
    pub fn is_verification(&self) -> bool {
        match self {
            Self::Verification { .. } => true,
            Self::Transaction { source, .. } => source.is_verification(),
            _ => false,
        }
    }

    /// Whether a commit lost a race: the row it rewrites changed after it was read.
    pub fn is_stale(&self) -> bool {
        match self {
            Self::Stale { .. } => true,
            Self::Transaction { source, .. } => source.is_stale(),
            _ => false,
        }
    }
}
