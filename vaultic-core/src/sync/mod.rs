//! Multi-device sync through an untrusted backup server.
//!
//! - Pending entities and change-log entries are collected into a backup
//!   payload and acknowledged once the server accepts it
//! - A rejected backup returns the server's copy, which is reconciled into
//!   the local store before the backup is sent again
//! - Store-state documents merge per path, with later edits winning
//! - Vault keys are shared by sealing them to the recipient's public key
//!
//! The server only ever sees ciphertext and signatures.

pub mod change_tracker;
pub mod config;
pub mod engine;
#[cfg(any(test, feature = "memory-server"))]
pub mod memory;
pub mod merge;
pub mod models;
pub mod reconcile;
pub mod server;


pub use config::SyncMetadata;
pub use engine::SyncEngine;
#[cfg(any(test, feature = "memory-server"))]
pub use memory::MemoryServer;
pub use models::{BackupResponse, EntityPayload, SyncReport, UserDataPayload};
pub use reconcile::ReconcileOutcome;
pub use server::BackupServer;
