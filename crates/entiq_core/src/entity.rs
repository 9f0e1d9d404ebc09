//! Entity instances.

use crate::change_feed::EntityAction;
use crate::error::{SessionError, SessionResult};
use crate::key::EntityKey;
use crate::session::SessionShared;
use crate::tracking::{EntityState, StateOperation, TrackingMetadata};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

pub(crate) struct EntityData {
    pub(crate) entity_type: String,
    pub(crate) values: Map<String, Value>,
    pub(crate) tracking: Option<TrackingMetadata>,
}

/// A shared handle to a mutable entity record.
///
/// Cloning the handle does not copy the entity: equality is instance
/// identity, so two handles are equal only if they point at the same
/// record. Tracking metadata is kept beside the values and is present only
/// while a session owns the entity.
#[derive(Clone)]
pub struct Entity {
    inner: Arc<RwLock<EntityData>>,
}

impl Entity {
    /// Creates a detached entity with no values.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self::from_values(entity_type, Map::new())
    }

    /// Creates a detached entity with the given values.
    pub fn from_values(entity_type: impl Into<String>, values: Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(EntityData {
                entity_type: entity_type.into(),
                values,
                tracking: None,
            })),
        }
    }

    /// Creates a detached entity from a JSON object. Non-object values
    /// produce an empty entity.
    pub fn from_json(entity_type: impl Into<String>, value: Value) -> Self {
        let values = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::from_values(entity_type, values)
    }

    /// Returns the entity type name.
    pub fn entity_type(&self) -> String {
        self.inner.read().entity_type.clone()
    }

    /// Returns a property value.
    pub fn get(&self, property: &str) -> Option<Value> {
        self.inner.read().values.get(property).cloned()
    }

    /// Returns a snapshot of every value.
    pub fn values(&self) -> Map<String, Value> {
        self.inner.read().values.clone()
    }

    /// Returns the values as a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(self.values())
    }

    /// Returns the tracking state; `Detached` when untracked.
    pub fn state(&self) -> EntityState {
        self.inner
            .read()
            .tracking
            .as_ref()
            .map_or(EntityState::Detached, |t| t.state)
    }

    /// Returns the key while tracked.
    pub fn key(&self) -> Option<EntityKey> {
        self.inner.read().tracking.as_ref().map(|t| t.key.clone())
    }

    /// Returns a copy of the tracking metadata.
    pub fn tracking(&self) -> Option<TrackingMetadata> {
        self.inner.read().tracking.clone()
    }

    /// Returns the original values of changed properties.
    pub fn original_values(&self) -> Map<String, Value> {
        self.inner
            .read()
            .tracking
            .as_ref()
            .map(|t| t.original_values.clone())
            .unwrap_or_default()
    }

    /// Sets a property.
    ///
    /// On a tracked entity this is a state transition: `Unchanged` becomes
    /// `Modified` and the first prior value of each changed property is
    /// kept. Setting a property of a `Deleted` entity, or a key property of
    /// a saved entity, is rejected. Setting a property to its current value
    /// changes nothing.
    ///
    /// Changing a key property of an `Added` entity re-indexes it under the
    /// new key, and fails with [`SessionError::DuplicateKey`] when the
    /// session already tracks that key.
    pub fn set(&self, property: &str, value: impl Into<Value>) -> SessionResult<()> {
        let value = value.into();
        if let Some(session) = self.rekey_owner(property, &value) {
            return session.rekey(self, property, value);
        }
        let notify = {
            let mut data = self.inner.write();
            let EntityData {
                values, tracking, ..
            } = &mut *data;

            let Some(tracking) = tracking.as_mut() else {
                values.insert(property.to_string(), value);
                return Ok(());
            };

            let next = tracking
                .state
                .transition(StateOperation::PropertySet)
                .ok_or_else(|| {
                    SessionError::invalid_transition(tracking.state, StateOperation::PropertySet)
                })?;

            let current = values.get(property).cloned().unwrap_or(Value::Null);
            if current == value {
                return Ok(());
            }
            if tracking.state != EntityState::Added
                && tracking.key_properties.iter().any(|k| k == property)
            {
                return Err(SessionError::invalid_operation(format!(
                    "key property '{property}' of {} cannot change",
                    tracking.key
                )));
            }

            if tracking.state != EntityState::Added
                && !tracking.original_values.contains_key(property)
            {
                tracking
                    .original_values
                    .insert(property.to_string(), current);
            }
            values.insert(property.to_string(), value);
            tracking.state = next;

            tracking
                .session
                .upgrade()
                .map(|session| (session, tracking.key.clone()))
        };

        if let Some((session, key)) = notify {
            session
                .feed
                .emit(EntityAction::PropertyChanged, key, Some(property.to_string()));
        }
        Ok(())
    }

    /// The owning session, when setting `property` to `value` changes the
    /// key of an added entity.
    fn rekey_owner(&self, property: &str, value: &Value) -> Option<Arc<SessionShared>> {
        let data = self.inner.read();
        let tracking = data.tracking.as_ref()?;
        let changes_key = tracking.state == EntityState::Added
            && tracking.key_properties.iter().any(|k| k == property)
            && data.values.get(property) != Some(value);
        if changes_key {
            tracking.session.upgrade()
        } else {
            None
        }
    }

    /// Returns true if both handles point at the same record.
    pub fn ptr_eq(a: &Entity, b: &Entity) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, EntityData> {
        self.inner.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, EntityData> {
        self.inner.write()
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        Entity::ptr_eq(self, other)
    }
}

impl Eq for Entity {}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.inner.read();
        f.debug_struct("Entity")
            .field("entity_type", &data.entity_type)
            .field(
                "state",
                &data
                    .tracking
                    .as_ref()
                    .map_or(EntityState::Detached, |t| t.state),
            )
            .field("values", &data.values)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Weak;

    fn tracked(state: EntityState) -> Entity {
        let entity = Entity::from_json("Todo", json!({"Id": 1, "Title": "a"}));
        entity.write().tracking = Some(TrackingMetadata::new(
            EntityKey::single("Todo", 1),
            vec!["Id".to_string()],
            state,
            Weak::new(),
            0,
        ));
        entity
    }

    #[test]
    fn detached_entities_accept_any_value() {
        let entity = Entity::new("Todo");
        entity.set("Title", "x").unwrap();
        entity.set("Id", 5).unwrap();
        assert_eq!(entity.get("Title"), Some(json!("x")));
        assert_eq!(entity.state(), EntityState::Detached);
        assert!(entity.key().is_none());
    }

    #[test]
    fn set_marks_unchanged_as_modified() {
        let entity = tracked(EntityState::Unchanged);
        entity.set("Title", "b").unwrap();
        entity.set("Title", "c").unwrap();
        assert_eq!(entity.state(), EntityState::Modified);
        assert_eq!(entity.original_values().get("Title"), Some(&json!("a")));
        assert_eq!(entity.get("Title"), Some(json!("c")));
    }

    #[test]
    fn setting_same_value_is_a_no_op() {
        let entity = tracked(EntityState::Unchanged);
        entity.set("Title", "a").unwrap();
        assert_eq!(entity.state(), EntityState::Unchanged);
        assert!(entity.original_values().is_empty());
    }

    #[test]
    fn added_entities_keep_no_originals() {
        let entity = tracked(EntityState::Added);
        entity.set("Title", "b").unwrap();
        assert_eq!(entity.state(), EntityState::Added);
        assert!(entity.original_values().is_empty());
    }

    #[test]
    fn deleted_entities_reject_sets() {
        let entity = tracked(EntityState::Deleted);
        let err = entity.set("Title", "b").unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidTransition {
                state: EntityState::Deleted,
                operation: StateOperation::PropertySet
            }
        ));
        assert_eq!(entity.get("Title"), Some(json!("a")));
    }

    #[test]
    fn key_of_saved_entity_is_fixed() {
        let entity = tracked(EntityState::Unchanged);
        assert!(entity.set("Id", 2).is_err());
        assert_eq!(entity.state(), EntityState::Unchanged);
    }

    #[test]
    fn equality_is_identity() {
        let a = Entity::from_json("Todo", json!({"Id": 1}));
        let b = Entity::from_json("Todo", json!({"Id": 1}));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
