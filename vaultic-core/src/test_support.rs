//! Shared helpers for unit tests.

use crate::crypto::SymmetricKey;
use crate::database::Database;
use std::sync::{Arc, Mutex, Once};

static TRACING: Once = Once::new();

/// Install a test subscriber once per process; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Fresh in-memory database with the schema applied.
pub fn test_db() -> Arc<Mutex<Database>> {
    init_tracing();
    let db = Database::in_memory().unwrap();
    db.initialize_schema().unwrap();
    Arc::new(Mutex::new(db))
}

/// Deterministic key for readable test failures.
pub fn key(byte: u8) -> SymmetricKey {
    SymmetricKey::from_bytes([byte; 32])
}
