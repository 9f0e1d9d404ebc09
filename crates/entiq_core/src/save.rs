//! Save bundle wire format.
//!
//! A save is one JSON document listing every changed entity with its
//! values and an `entityAspect` describing its state:
//!
//! ```json
//! {"entities":[{"Id":-1,"Title":"x","entityAspect":{"entityTypeName":"Todo",
//!   "entityState":"Added","originalValuesMap":{},
//!   "autoGeneratedKey":{"propertyName":"Id","autoGeneratedKeyType":"Identity"}}}],
//!  "saveOptions":{"allowConcurrentSaves":false}}
//! ```
//!
//! The service answers with `Entities`, `KeyMappings` and, on rejection,
//! `Errors` or `EntityErrors`. Both PascalCase and camelCase member names
//! are accepted.

use crate::entity::Entity;
use crate::error::EntityError;
use crate::key::{EntityKey, KeyValue};
use crate::mapper::normalize_type_name;
use crate::registry::{EntityType, KeyGeneration};
use crate::tracking::EntityState;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request document for a save.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveBundle {
    /// Changed entities, in attach order.
    pub entities: Vec<EntityChangeRecord>,
    /// Save options.
    pub save_options: SaveOptions,
}

/// Options sent with a save.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOptions {
    /// Always false: a session never overlaps saves.
    pub allow_concurrent_saves: bool,
}

/// One changed entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityChangeRecord {
    /// Current values.
    #[serde(flatten)]
    pub values: Map<String, Value>,
    /// State description.
    #[serde(rename = "entityAspect")]
    pub aspect: EntityAspect,
}

/// Tracking description of a changed entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityAspect {
    /// Entity type name.
    pub entity_type_name: String,
    /// State before the save.
    pub entity_state: EntityState,
    /// Prior values of modified properties.
    pub original_values_map: Map<String, Value>,
    /// Key generation details for added entities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_generated_key: Option<AutoGeneratedKey>,
}

/// Key generation details.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoGeneratedKey {
    /// Key property.
    pub property_name: String,
    /// Generation strategy name.
    pub auto_generated_key_type: String,
}

impl EntityChangeRecord {
    pub(crate) fn new(
        entity_type: &EntityType,
        state: EntityState,
        values: Map<String, Value>,
        original_values: Map<String, Value>,
    ) -> Self {
        let auto_generated_key = match (state, entity_type.key_generation()) {
            (EntityState::Added, KeyGeneration::Identity | KeyGeneration::ClientGuid) => entity_type
                .key_properties()
                .first()
                .map(|property| AutoGeneratedKey {
                    property_name: property.clone(),
                    auto_generated_key_type: entity_type.key_generation().as_str().to_string(),
                }),
            _ => None,
        };
        Self {
            values,
            aspect: EntityAspect {
                entity_type_name: entity_type.name().to_string(),
                entity_state: state,
                original_values_map: original_values,
                auto_generated_key,
            },
        }
    }
}

/// A temporary key replaced by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyMapping {
    /// Entity type name.
    pub entity_type: String,
    /// Temporary key value.
    pub temp_value: KeyValue,
    /// Server-assigned key value.
    pub real_value: KeyValue,
}

impl KeyMapping {
    /// Returns the temporary key.
    pub fn temp_key(&self) -> EntityKey {
        EntityKey::single(self.entity_type.clone(), self.temp_value.clone())
    }
}

/// Result of a successful save.
#[derive(Debug, Clone, Default)]
pub struct SaveResult {
    /// Entities committed by the save, in batch order.
    pub entities: Vec<Entity>,
    /// Key replacements applied.
    pub key_mappings: Vec<KeyMapping>,
}

impl SaveResult {
    /// Returns true if nothing was saved.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct KeyMappingRecord {
    #[serde(rename = "EntityTypeName", alias = "entityTypeName")]
    entity_type_name: String,
    #[serde(rename = "TempValue", alias = "tempValue")]
    temp_value: Value,
    #[serde(rename = "RealValue", alias = "realValue")]
    real_value: Value,
}

impl KeyMappingRecord {
    pub(crate) fn resolve(&self) -> Option<KeyMapping> {
        Some(KeyMapping {
            entity_type: normalize_type_name(&self.entity_type_name),
            temp_value: KeyValue::from_json(&self.temp_value)?,
            real_value: KeyValue::from_json(&self.real_value)?,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct EntityErrorRecord {
    #[serde(default, rename = "ErrorName", alias = "errorName")]
    error_name: Option<String>,
    #[serde(default, rename = "EntityTypeName", alias = "entityTypeName")]
    entity_type_name: Option<String>,
    #[serde(default, rename = "KeyValues", alias = "keyValues")]
    key_values: Option<Vec<Value>>,
    #[serde(default, rename = "PropertyName", alias = "propertyName")]
    property_name: Option<String>,
    #[serde(default, rename = "ErrorMessage", alias = "errorMessage")]
    error_message: Option<String>,
}

impl EntityErrorRecord {
    pub(crate) fn into_entity_error(self) -> EntityError {
        let message = self
            .error_message
            .or_else(|| self.error_name.clone())
            .unwrap_or_else(|| "entity rejected".to_string());
        EntityError {
            error_name: self.error_name,
            entity_type: self.entity_type_name,
            key_values: self.key_values.unwrap_or_default(),
            property_name: self.property_name,
            message,
            entity: None,
        }
    }
}

/// Body of a save response, successful or not.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct SaveResponseBody {
    #[serde(default, rename = "Entities", alias = "entities")]
    pub(crate) entities: Option<Vec<Value>>,
    #[serde(default, rename = "KeyMappings", alias = "keyMappings")]
    pub(crate) key_mappings: Option<Vec<KeyMappingRecord>>,
    #[serde(default, rename = "Errors", alias = "errors")]
    pub(crate) errors: Option<Vec<EntityErrorRecord>>,
    #[serde(default, rename = "EntityErrors", alias = "entityErrors")]
    pub(crate) entity_errors: Option<Vec<EntityErrorRecord>>,
    #[serde(default, rename = "ExceptionMessage", alias = "exceptionMessage")]
    pub(crate) exception_message: Option<String>,
    #[serde(default, rename = "Message", alias = "message")]
    pub(crate) message: Option<String>,
    #[serde(default, rename = "InnerException", alias = "innerException")]
    pub(crate) inner: Option<Box<SaveResponseBody>>,
}

impl SaveResponseBody {
    /// Parses a body; anything that is not a JSON object yields `None`.
    pub(crate) fn parse(body: &[u8]) -> Option<Self> {
        match serde_json::from_slice::<Value>(body).ok()? {
            value @ Value::Object(_) => serde_json::from_value(value).ok(),
            _ => None,
        }
    }

    /// Returns true if the body reports entity errors.
    pub(crate) fn has_errors(&self) -> bool {
        self.errors
            .iter()
            .chain(self.entity_errors.iter())
            .any(|e| !e.is_empty())
    }

    /// Returns the innermost server message.
    pub(crate) fn innermost_message(&self) -> Option<String> {
        self.inner
            .as_ref()
            .and_then(|inner| inner.innermost_message())
            .or_else(|| self.exception_message.clone())
            .or_else(|| self.message.clone())
    }

    pub(crate) fn take_entity_errors(&mut self) -> Vec<EntityError> {
        self.errors
            .take()
            .into_iter()
            .chain(self.entity_errors.take())
            .flatten()
            .map(EntityErrorRecord::into_entity_error)
            .collect()
    }

    pub(crate) fn key_mappings(&self) -> Vec<KeyMapping> {
        self.key_mappings
            .iter()
            .flatten()
            .filter_map(|record| {
                let mapping = record.resolve();
                if mapping.is_none() {
                    tracing::warn!(
                        entity_type = %record.entity_type_name,
                        "ignoring key mapping with unsupported key values"
                    );
                }
                mapping
            })
            .collect()
    }
}
