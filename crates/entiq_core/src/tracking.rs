//! Entity tracking metadata and the entity state machine.

use crate::key::EntityKey;
use crate::session::SessionShared;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Weak;

/// Change-tracking state of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EntityState {
    /// Not tracked by any session.
    Detached,
    /// Tracked, no pending changes.
    Unchanged,
    /// Created locally, not yet saved.
    Added,
    /// Tracked with pending property changes.
    Modified,
    /// Marked for deletion, not yet saved.
    Deleted,
}

impl EntityState {
    /// Returns true for states that take part in a save.
    pub fn is_changed(&self) -> bool {
        matches!(
            self,
            EntityState::Added | EntityState::Modified | EntityState::Deleted
        )
    }

    /// Returns true for every state but `Detached`.
    pub fn is_attached(&self) -> bool {
        !matches!(self, EntityState::Detached)
    }

    /// Returns the wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityState::Detached => "Detached",
            EntityState::Unchanged => "Unchanged",
            EntityState::Added => "Added",
            EntityState::Modified => "Modified",
            EntityState::Deleted => "Deleted",
        }
    }

    /// Returns the state reached by applying `operation`, or `None` when the
    /// operation is not allowed in this state.
    pub fn transition(self, operation: StateOperation) -> Option<EntityState> {
        use EntityState::*;
        use StateOperation as Op;

        match (self, operation) {
            (Detached, Op::Attach) => Some(Unchanged),
            (Detached, Op::Add) => Some(Added),
            (_, Op::Attach | Op::Add) => None,

            (Detached, Op::Merge) => None,
            (_, Op::Merge) => Some(Unchanged),

            (Unchanged | Modified, Op::PropertySet) => Some(Modified),
            (Added, Op::PropertySet) => Some(Added),
            (Detached, Op::PropertySet) => Some(Detached),
            (Deleted, Op::PropertySet) => None,

            (Unchanged | Modified, Op::MarkForDelete) => Some(Deleted),
            (Added, Op::MarkForDelete) => Some(Detached),
            (Deleted | Detached, Op::MarkForDelete) => None,

            (Added | Modified, Op::SaveSuccess) => Some(Unchanged),
            (Deleted, Op::SaveSuccess) => Some(Detached),
            (Unchanged | Detached, Op::SaveSuccess) => None,

            (state, Op::SaveFailure) => Some(state),

            (Unchanged | Modified | Deleted, Op::RejectChanges) => Some(Unchanged),
            (Added, Op::RejectChanges) => Some(Detached),
            (Detached, Op::RejectChanges) => None,

            (Detached, Op::Detach) => None,
            (_, Op::Detach) => Some(Detached),
        }
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session-mediated operations that move an entity between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateOperation {
    /// Attach an existing entity as unchanged.
    Attach,
    /// Add a new entity.
    Add,
    /// Merge server data into a tracked entity (query or save result).
    Merge,
    /// Change a property value.
    PropertySet,
    /// Mark the entity for deletion.
    MarkForDelete,
    /// The save containing the entity succeeded.
    SaveSuccess,
    /// The save containing the entity failed.
    SaveFailure,
    /// Discard pending changes.
    RejectChanges,
    /// Stop tracking the entity.
    Detach,
}

impl StateOperation {
    /// Every operation, for exhaustive checks.
    pub const ALL: [StateOperation; 9] = [
        StateOperation::Attach,
        StateOperation::Add,
        StateOperation::Merge,
        StateOperation::PropertySet,
        StateOperation::MarkForDelete,
        StateOperation::SaveSuccess,
        StateOperation::SaveFailure,
        StateOperation::RejectChanges,
        StateOperation::Detach,
    ];
}

impl fmt::Display for StateOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateOperation::Attach => "attach",
            StateOperation::Add => "add",
            StateOperation::Merge => "merge",
            StateOperation::PropertySet => "set a property of",
            StateOperation::MarkForDelete => "mark for delete",
            StateOperation::SaveSuccess => "commit a save of",
            StateOperation::SaveFailure => "roll back a save of",
            StateOperation::RejectChanges => "reject changes of",
            StateOperation::Detach => "detach",
        };
        f.write_str(name)
    }
}

/// Per-instance tracking record, present only while a session owns the entity.
#[derive(Debug, Clone)]
pub struct TrackingMetadata {
    pub(crate) key: EntityKey,
    pub(crate) key_properties: Vec<String>,
    pub(crate) state: EntityState,
    pub(crate) session: Weak<SessionShared>,
    pub(crate) original_values: Map<String, Value>,
    pub(crate) sequence: u64,
}

impl TrackingMetadata {
    pub(crate) fn new(
        key: EntityKey,
        key_properties: Vec<String>,
        state: EntityState,
        session: Weak<SessionShared>,
        sequence: u64,
    ) -> Self {
        Self {
            key,
            key_properties,
            state,
            session,
            original_values: Map::new(),
            sequence,
        }
    }

    /// Returns the entity type name.
    pub fn entity_type(&self) -> &str {
        self.key.entity_type()
    }

    /// Returns the current state.
    pub fn state(&self) -> EntityState {
        self.state
    }

    /// Returns the entity key.
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Returns the names of the key properties.
    pub fn key_properties(&self) -> &[String] {
        &self.key_properties
    }

    /// Returns the values properties had before they were first modified.
    pub fn original_values(&self) -> &Map<String, Value> {
        &self.original_values
    }

    /// Returns the attach order of the entity within its session.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns true while the owning session is alive.
    pub fn has_live_session(&self) -> bool {
        self.session.strong_count() > 0
    }
}
