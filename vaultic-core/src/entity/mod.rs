//! Entity model: the signed, selectively encrypted records the vault stores.
//!
//! Every entity flattens an [`EntityBase`] (identity, signature metadata,
//! lifecycle state and change tracking) next to its own properties. Each
//! type declares which properties are signed, encrypted, backed up and
//! overridable as compile-time lists; the signer, the field encryptor and
//! the backup builder only ever look at those lists.

pub mod change_tracking;
pub mod fields;
pub mod signing;
pub mod store_state;
pub mod tracking;
pub mod user;
pub mod user_vault;
pub mod vault;

pub use change_tracking::{ChangeOp, ChangeOpKind, ChangeScope, ChangeTracking};
pub use fields::decrypt_field;
pub use signing::{sign_entity, verify_entity};
pub use store_state::{StoreState, StoreStateKind};
pub use user::User;
pub use user_vault::UserVault;
pub use vault::Vault;

use crate::crypto::KeyScope;
use crate::FieldError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Property names shared by every entity.
pub const SIGNATURE_SECRET: &str = "signatureSecret";
pub const CURRENT_SIGNATURE: &str = "currentSignature";

/// Signature metadata every entity may receive through an override.
pub const SIGNATURE_METADATA: &[&str] = &[SIGNATURE_SECRET, CURRENT_SIGNATURE];

/// Lifecycle state of an entity, which governs what a backup transmits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    #[default]
    Inserted,
    Updated,
    Deleted,
    Unchanged,
}

impl EntityState {
    /// Convert the state to its column representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inserted => "Inserted",
            Self::Updated => "Updated",
            Self::Deleted => "Deleted",
            Self::Unchanged => "Unchanged",
        }
    }

    /// Whether the entity holds changes the server has not acknowledged.
    pub fn is_pending(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Discriminator for the concrete entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    User,
    Vault,
    UserVault,
    StoreState,
    ChangeTracking,
}

impl EntityKind {
    /// Table holding rows of this kind.
    pub fn table(&self) -> &'static str {
        match self {
            Self::User => "users",
            Self::Vault => "vaults",
            Self::UserVault => "user_vaults",
            Self::StoreState => "store_states",
            Self::ChangeTracking => "change_tracking",
        }
    }

    /// Properties an override may patch for this kind.
    pub fn overridable_properties(&self) -> &'static [&'static str] {
        match self {
            Self::User => User::OVERRIDABLE,
            Self::Vault => Vault::OVERRIDABLE,
            Self::UserVault => UserVault::OVERRIDABLE,
            Self::StoreState => StoreState::OVERRIDABLE,
            Self::ChangeTracking => ChangeTracking::OVERRIDABLE,
        }
    }

    pub fn is_overridable(&self, name: &str) -> bool {
        SIGNATURE_METADATA.contains(&name) || self.overridable_properties().contains(&name)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::User => "User",
            Self::Vault => "Vault",
            Self::UserVault => "UserVault",
            Self::StoreState => "StoreState",
            Self::ChangeTracking => "ChangeTracking",
        };
        f.write_str(name)
    }
}

/// Fields common to every entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EntityBase {
    pub id: i64,
    /// Per-entity MAC key, encrypted with the owning key
    pub signature_secret: String,
    /// `v1.<base64url(mac)>` over the signable properties
    pub current_signature: String,
    pub entity_state: EntityState,
    /// Properties set during this session; never persisted
    #[serde(skip)]
    pub updated_properties: Vec<String>,
    /// Properties set since the last acknowledged backup
    pub properties_to_sync: Vec<String>,
}

impl EntityBase {
    /// Fresh base with a random positive id.
    ///
    /// Ids are assigned on the client so children can reference a parent
    /// before either has been committed.
    pub fn new() -> Self {
        Self {
            id: new_id(),
            ..Self::default()
        }
    }

    pub fn with_id(id: i64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    fn property(&self, name: &str) -> Option<Value> {
        match name {
            SIGNATURE_SECRET => Some(Value::String(self.signature_secret.clone())),
            CURRENT_SIGNATURE => Some(Value::String(self.current_signature.clone())),
            _ => None,
        }
    }

    fn write_property(&mut self, name: &str, value: Value) -> Result<bool, FieldError> {
        match name {
            SIGNATURE_SECRET => self.signature_secret = string_value(name, value)?,
            CURRENT_SIGNATURE => self.current_signature = string_value(name, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Random positive entity id.
pub fn new_id() -> i64 {
    (rand::random::<u64>() >> 1).max(1) as i64
}

/// A record type the vault can sign, encrypt, persist and back up.
pub trait Entity:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: EntityKind;
    /// Integrity scope: covered by `currentSignature`
    const SIGNABLE: &'static [&'static str];
    /// Confidentiality scope: stored as ciphertext
    const ENCRYPTABLE: &'static [&'static str];
    /// Sync scope: sent to the backup server
    const BACKUPABLE: &'static [&'static str];
    /// Server-trusted properties an override may patch besides signature metadata
    const OVERRIDABLE: &'static [&'static str];
    /// Sent with every backup of this entity, dirty or not
    const BACKUP_ALWAYS: &'static [&'static str] = &[];

    fn base(&self) -> &EntityBase;
    fn base_mut(&mut self) -> &mut EntityBase;

    /// Which key signs and encrypts this entity.
    fn key_scope(&self) -> KeyScope;

    /// Read one of the entity's own properties.
    fn own_property(&self, name: &str) -> Option<Value>;

    /// Write one of the entity's own properties without touching tracking.
    fn write_own_property(&mut self, name: &str, value: Value) -> Result<(), FieldError>;

    fn into_any(self) -> AnyEntity;
    fn from_any(any: AnyEntity) -> Option<Self>;

    fn id(&self) -> i64 {
        self.base().id
    }

    fn signable_properties(&self) -> &'static [&'static str] {
        Self::SIGNABLE
    }

    fn encryptable_properties(&self) -> &'static [&'static str] {
        Self::ENCRYPTABLE
    }

    fn backupable_properties(&self) -> &'static [&'static str] {
        Self::BACKUPABLE
    }

    /// Whether `set` accepts this property.
    fn is_declared(name: &str) -> bool {
        Self::SIGNABLE.contains(&name)
            || Self::ENCRYPTABLE.contains(&name)
            || Self::BACKUPABLE.contains(&name)
    }

    /// Last signature the server acknowledged, for types that track it.
    fn previous_signature(&self) -> Option<&str> {
        None
    }

    fn set_previous_signature(&mut self, _signature: String) {}

    /// Read any property, including signature metadata.
    fn property(&self, name: &str) -> Option<Value> {
        self.base()
            .property(name)
            .or_else(|| self.own_property(name))
    }

    /// Write any property without recording it as dirty.
    fn write_property(&mut self, name: &str, value: Value) -> Result<(), FieldError> {
        if self.base_mut().write_property(name, value.clone())? {
            return Ok(());
        }
        self.write_own_property(name, value)
    }

    /// Set a declared property and record it for re-signing and sync.
    fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), FieldError>
    where
        Self: Sized,
    {
        if !Self::is_declared(name) {
            return Err(FieldError::UnknownProperty(name.to_string()));
        }
        self.write_own_property(name, value.into())?;
        tracking::mark_dirty(self.base_mut(), name);
        Ok(())
    }

    /// Whether anything was set since the entity was loaded.
    fn is_dirty(&self) -> bool {
        !self.base().updated_properties.is_empty()
    }

    /// Secret, signature and every backupable property.
    fn get_backup(&self) -> Map<String, Value>
    where
        Self: Sized,
    {
        self.backup_fields(true)
    }

    /// Fields to send to the backup server.
    ///
    /// A partial backup carries only the backupable properties recorded in
    /// `propertiesToSync`.
    fn backup_fields(&self, full: bool) -> Map<String, Value>
    where
        Self: Sized,
    {
        let base = self.base();
        let mut map = Map::new();
        map.insert("id".to_string(), Value::from(base.id));
        map.insert(
            SIGNATURE_SECRET.to_string(),
            Value::String(base.signature_secret.clone()),
        );
        map.insert(
            CURRENT_SIGNATURE.to_string(),
            Value::String(base.current_signature.clone()),
        );
        for name in Self::BACKUP_ALWAYS {
            if let Some(value) = self.property(name) {
                map.insert(name.to_string(), value);
            }
        }
        for name in Self::BACKUPABLE {
            if full || base.properties_to_sync.iter().any(|p| p == name) {
                if let Some(value) = self.property(name) {
                    map.insert(name.to_string(), value);
                }
            }
        }
        map
    }
}

/// Any concrete entity, for heterogeneous operation queues.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyEntity {
    User(User),
    Vault(Vault),
    UserVault(UserVault),
    StoreState(StoreState),
    ChangeTracking(ChangeTracking),
}

/// Run `$body` with `$e` bound to the concrete entity inside an [`AnyEntity`].
#[macro_export]
macro_rules! with_entity {
    ($any:expr, $e:ident => $body:expr) => {
        match $any {
            $crate::entity::AnyEntity::User($e) => $body,
            $crate::entity::AnyEntity::Vault($e) => $body,
            $crate::entity::AnyEntity::UserVault($e) => $body,
            $crate::entity::AnyEntity::StoreState($e) => $body,
            $crate::entity::AnyEntity::ChangeTracking($e) => $body,
        }
    };
}

impl AnyEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::User(_) => EntityKind::User,
            Self::Vault(_) => EntityKind::Vault,
            Self::UserVault(_) => EntityKind::UserVault,
            Self::StoreState(_) => EntityKind::StoreState,
            Self::ChangeTracking(_) => EntityKind::ChangeTracking,
        }
    }

    pub fn id(&self) -> i64 {
        self.base().id
    }

    pub fn base(&self) -> &EntityBase {
        with_entity!(self, e => e.base())
    }

    pub fn base_mut(&mut self) -> &mut EntityBase {
        with_entity!(self, e => e.base_mut())
    }

    pub fn key_scope(&self) -> KeyScope {
        with_entity!(self, e => e.key_scope())
    }

    /// Serialize the full record for storage.
    pub fn to_record(&self) -> serde_json::Result<String> {
        with_entity!(self, e => serde_json::to_string(e))
    }

    /// Convert back into a concrete type.
    pub fn into_entity<E: Entity>(self) -> Option<E> {
        E::from_any(self)
    }
}

macro_rules! impl_from_entity {
    ($($ty:ident),*) => {
        $(
            impl From<$ty> for AnyEntity {
                fn from(entity: $ty) -> Self {
                    AnyEntity::$ty(entity)
                }
            }
        )*
    };
}

impl_from_entity!(User, Vault, UserVault, StoreState, ChangeTracking);

pub(crate) fn string_value(name: &str, value: Value) -> Result<String, FieldError> {
    match value {
        Value::String(s) => Ok(s),
        Value::Null => Ok(String::new()),
        other => Err(invalid(name, format!("expected string, got {}", other))),
    }
}

pub(crate) fn bool_value(name: &str, value: Value) -> Result<bool, FieldError> {
    value
        .as_bool()
        .ok_or_else(|| invalid(name, format!("expected bool, got {}", value)))
}

pub(crate) fn i64_value(name: &str, value: Value) -> Result<i64, FieldError> {
    value
        .as_i64()
        .ok_or_else(|| invalid(name, format!("expected integer, got {}", value)))
}

pub(crate) fn invalid(name: &str, reason: String) -> FieldError {
    FieldError::InvalidValue {
        name: name.to_string(),
        reason,
    }
}
