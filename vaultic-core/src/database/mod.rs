//! Database layer for the vault core.
//!
//! This module handles schema management, the SQLite connection and the
//! row-level reads and writes behind [`crate::repository`] and
//! [`crate::transaction`].

pub mod rows;
pub mod schema;

pub use rows::DeleteFilter;
pub use schema::{Database, CURRENT_SCHEMA_VERSION};
