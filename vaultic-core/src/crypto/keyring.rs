//! Key hierarchy and the session key cache.
//!
//! Master Password → Argon2id → Master Key → wraps → Vault Keys
//!
//! A shared vault key travels sealed to the recipient's X25519 public key
//! until the recipient unseals it and re-wraps it with their own master key.

use crate::crypto::asymmetric::{asymmetric_decrypt, asymmetric_encrypt, KeyPair};
use crate::crypto::cipher::{symmetric_decrypt, symmetric_encrypt, SymmetricKey};
use crate::crypto::{CryptoError, CryptoResult};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use zeroize::Zeroize;

/// Which key owns an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyScope {
    /// User-scoped entities (User, UserVault, app/user/vault preferences)
    Master,
    /// Vault-scoped entities, keyed by vault id
    Vault(i64),
}

#[derive(Default)]
struct CacheInner {
    master: Option<SymmetricKey>,
    vaults: HashMap<i64, SymmetricKey>,
}

/// In-memory cache of the keys unlocked for the current session.
///
/// Keys are zeroized when removed or when the cache is dropped. Nothing here
/// is ever persisted.
#[derive(Default)]
pub struct KeyCache {
    inner: RwLock<CacheInner>,
}

impl KeyCache {
    /// Create an empty (locked) cache
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheInner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install the master key, replacing any previous one
    pub fn set_master_key(&self, key: SymmetricKey) {
        self.write().master = Some(key);
    }

    /// Install an unwrapped vault key
    pub fn insert_vault_key(&self, vault_id: i64, key: SymmetricKey) {
        self.write().vaults.insert(vault_id, key);
    }

    /// Forget a single vault key
    pub fn remove_vault_key(&self, vault_id: i64) {
        self.write().vaults.remove(&vault_id);
    }

    /// Get a copy of the master key
    pub fn master_key(&self) -> Option<SymmetricKey> {
        self.read().master.clone()
    }

    /// Get a copy of the key for `scope`
    pub fn key_for(&self, scope: KeyScope) -> Option<SymmetricKey> {
        let inner = self.read();
        match scope {
            KeyScope::Master => inner.master.clone(),
            KeyScope::Vault(id) => inner.vaults.get(&id).cloned(),
        }
    }

    /// Check whether the master key is loaded
    pub fn is_unlocked(&self) -> bool {
        self.read().master.is_some()
    }

    /// Drop every key from memory
    pub fn clear(&self) {
        let mut inner = self.write();
        inner.master.take();
        inner.vaults.clear();
    }
}

/// Wrap a vault key with the master key.
///
/// The result is the same as field-encrypting the base64 key, which is how
/// `UserVault::vault_key` stores it.
pub fn wrap_key(master: &SymmetricKey, key: &SymmetricKey) -> CryptoResult<String> {
    let mut encoded = encode_key(key);
    let wrapped = symmetric_encrypt(master, &encoded);
    encoded.zeroize();
    wrapped
}

/// Unwrap a vault key previously wrapped with [`wrap_key`].
pub fn unwrap_key(master: &SymmetricKey, wrapped: &str) -> CryptoResult<SymmetricKey> {
    let mut encoded = symmetric_decrypt(master, wrapped)?;
    let key = decode_key(&encoded);
    encoded.zeroize();
    key
}

/// Base64 form of a raw key, as stored in plaintext-side fields before encryption.
pub fn encode_key(key: &SymmetricKey) -> String {
    STANDARD.encode(key.as_bytes())
}

/// Parse the base64 form produced by [`encode_key`].
pub fn decode_key(encoded: &str) -> CryptoResult<SymmetricKey> {
    let mut bytes = STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    let key = SymmetricKey::from_slice(&bytes);
    bytes.zeroize();
    key
}

/// Seal a vault key to another user's public key for sharing.
pub fn seal_key_for(recipient_public: &str, key: &SymmetricKey) -> CryptoResult<String> {
    let mut encoded = encode_key(key);
    let sealed = asymmetric_encrypt(recipient_public, &encoded);
    encoded.zeroize();
    sealed
}

/// Open a vault key sealed with [`seal_key_for`].
pub fn unseal_key(key_pair: &KeyPair, sealed: &str) -> CryptoResult<SymmetricKey> {
    let mut encoded = asymmetric_decrypt(key_pair, sealed)?;
    let key = decode_key(&encoded);
    encoded.zeroize();
    key
}
