//! Save assertions.
//!
//! [`should_not_save`] also checks that an atomic failure left every
//! tracked entity exactly as it was.

use entiq_core::{Entity, EntityKey, EntityState, SaveResult, Session, SessionError};
use serde_json::{Map, Value};

/// Observable tracking state of every entity in a session.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSnapshot {
    entries: Vec<SnapshotEntry>,
}

/// One entity in a [`CacheSnapshot`].
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    /// Tracking key.
    pub key: Option<EntityKey>,
    /// Tracking state.
    pub state: EntityState,
    /// Current values.
    pub values: Map<String, Value>,
    /// Original values of changed properties.
    pub original_values: Map<String, Value>,
}

impl CacheSnapshot {
    /// Captures the session's tracked entities in attach order.
    pub fn capture(session: &Session) -> Self {
        let entries = session
            .entities(None, &[])
            .iter()
            .map(|entity| SnapshotEntry {
                key: entity.key(),
                state: entity.state(),
                values: entity.values(),
                original_values: entity.original_values(),
            })
            .collect();
        Self { entries }
    }

    /// Returns the captured entries.
    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    /// Returns the number of tracked entities captured.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Saves and panics unless the save succeeds. Returns the result.
pub async fn should_save(session: &Session, entities: Option<&[Entity]>) -> SaveResult {
    match session.save_changes(entities).await {
        Ok(result) => result,
        Err(err) => panic!("expected the save to succeed, got: {err}"),
    }
}

/// Saves and panics unless the save fails. Returns the error.
///
/// When the failure committed nothing, also asserts that no tracked
/// entity changed.
pub async fn should_not_save(session: &Session, entities: Option<&[Entity]>) -> SessionError {
    let before = CacheSnapshot::capture(session);
    let err = match session.save_changes(entities).await {
        Ok(result) => panic!(
            "expected the save to fail, but {} entities were saved",
            result.entities.len()
        ),
        Err(err) => err,
    };
    if err.save_error().map_or(true, |save| save.is_atomic()) {
        assert_eq!(
            CacheSnapshot::capture(session),
            before,
            "failed save changed tracked entities: {err}"
        );
    }
    err
}

/// Asserts an entity's tracking state.
#[track_caller]
pub fn assert_state(entity: &Entity, expected: EntityState) {
    assert_eq!(
        entity.state(),
        expected,
        "unexpected state for {:?}",
        entity.key()
    );
}

/// Asserts that two handles are the same tracked instance.
#[track_caller]
pub fn assert_same_instance(a: &Entity, b: &Entity) {
    assert!(
        Entity::ptr_eq(a, b),
        "expected one instance, got {:?} and {:?}",
        a.key(),
        b.key()
    );
}
