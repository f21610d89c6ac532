//! Per-entity change tracking and lifecycle transitions.

use crate::entity::{Entity, EntityBase, EntityState};

/// Record `name` as set in this session and pending for sync.
pub fn mark_dirty(base: &mut EntityBase, name: &str) {
    if !base.updated_properties.iter().any(|p| p == name) {
        base.updated_properties.push(name.to_string());
    }
    if !base.properties_to_sync.iter().any(|p| p == name) {
        base.properties_to_sync.push(name.to_string());
    }
    if base.entity_state == EntityState::Unchanged {
        base.entity_state = EntityState::Updated;
    }
}

/// Prepare a brand-new entity: everything backupable goes out with the first backup.
pub fn mark_inserted<E: Entity>(entity: &mut E) {
    let base = entity.base_mut();
    base.entity_state = EntityState::Inserted;
    base.properties_to_sync = E::BACKUPABLE.iter().map(|p| p.to_string()).collect();
}

/// Mark an entity as matching what the server holds.
///
/// Clears both tracking lists and advances `previousSignature`.
pub fn mark_synced<E: Entity>(entity: &mut E) {
    let signature = entity.base().current_signature.clone();
    entity.set_previous_signature(signature);
    let base = entity.base_mut();
    base.entity_state = EntityState::Unchanged;
    base.properties_to_sync.clear();
    base.updated_properties.clear();
}

/// Forget this session's dirtiness once it has been committed.
pub fn clear_session(base: &mut EntityBase) {
    base.updated_properties.clear();
}

/// Whether the entity has something the next backup must send.
pub fn has_pending_sync(base: &EntityBase) -> bool {
    base.entity_state.is_pending() || !base.properties_to_sync.is_empty()
}

/// Properties set this session that also need re-signing.
pub fn needs_resign<E: Entity>(entity: &E) -> bool {
    let base = entity.base();
    base.current_signature.is_empty()
        || base
            .updated_properties
            .iter()
            .any(|p| E::SIGNABLE.contains(&p.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{StoreState, StoreStateKind, Vault};

    #[test]
    fn inserted_marks_all_backupable() {
        let mut vault = Vault::new("Personal");
        mark_inserted(&mut vault);
        assert_eq!(vault.base.properties_to_sync, vec!["name".to_string()]);
        assert!(has_pending_sync(&vault.base));
    }

    #[test]
    fn synced_advances_previous_signature() {
        let mut state = StoreState::new(StoreStateKind::Password, 9, "{}");
        state.base.current_signature = "v1.abc".to_string();
        state.set("state", "{\"a\":1}").unwrap();

        mark_synced(&mut state);
        assert_eq!(state.previous_signature, "v1.abc");
        assert_eq!(state.base.entity_state, EntityState::Unchanged);
        assert!(state.base.properties_to_sync.is_empty());
        assert!(!has_pending_sync(&state.base));
    }

    #[test]
    fn resign_only_for_signable_changes() {
        let mut state = StoreState::new(StoreStateKind::Password, 9, "{}");
        assert!(needs_resign(&state));

        state.base.current_signature = "v1.abc".to_string();
        assert!(!needs_resign(&state));

        state.set("state", "{}").unwrap();
        assert!(needs_resign(&state));
    }
}
