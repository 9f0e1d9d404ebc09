//! Entity type registry.
//!
//! Holds what the session knows about each entity type: its key
//! properties, how keys are generated, and which resources return it.
//! Types are registered by the caller, or inferred from payload structure
//! when the endpoint has no server metadata.

use crate::error::MappingError;
use crate::key::{EntityKey, KeyValue};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// How key values of new entities are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyGeneration {
    /// The caller supplies key values.
    #[default]
    None,
    /// The server assigns the key; a temporary negative key is used until
    /// the save returns the real one.
    Identity,
    /// The client assigns a random GUID.
    ClientGuid,
}

impl KeyGeneration {
    /// Returns the wire name used in save bundles.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyGeneration::None => "None",
            KeyGeneration::Identity => "Identity",
            KeyGeneration::ClientGuid => "KeyGenerator",
        }
    }
}

/// Description of one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityType {
    name: String,
    key_properties: Vec<String>,
    key_generation: KeyGeneration,
    resources: Vec<String>,
}

impl EntityType {
    /// Creates a type keyed by `Id`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_properties: vec!["Id".to_string()],
            key_generation: KeyGeneration::None,
            resources: Vec::new(),
        }
    }

    /// Sets the key properties, in key order.
    pub fn with_key<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_properties = properties.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the key generation strategy.
    pub fn with_key_generation(mut self, generation: KeyGeneration) -> Self {
        self.key_generation = generation;
        self
    }

    /// Marks the key as server-generated.
    pub fn identity(self) -> Self {
        self.with_key_generation(KeyGeneration::Identity)
    }

    /// Registers a resource name that returns this type.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resources.push(resource.into());
        self
    }

    /// Returns the type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the key property names.
    pub fn key_properties(&self) -> &[String] {
        &self.key_properties
    }

    /// Returns the key generation strategy.
    pub fn key_generation(&self) -> KeyGeneration {
        self.key_generation
    }

    /// Returns the resources mapped to this type.
    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    /// Extracts the key of a record of this type.
    pub fn key_of(&self, values: &Map<String, Value>) -> Result<EntityKey, MappingError> {
        let mut key = Vec::with_capacity(self.key_properties.len());
        for property in &self.key_properties {
            let value = match values.get(property) {
                None | Some(Value::Null) => {
                    return Err(MappingError::missing_key(&self.name, property))
                }
                Some(v) => v,
            };
            let component =
                KeyValue::from_json(value).ok_or_else(|| MappingError::InvalidKeyValue {
                    entity_type: self.name.clone(),
                    property: property.clone(),
                    value: value.clone(),
                })?;
            key.push(component);
        }
        Ok(EntityKey::new(self.name.clone(), key))
    }

    /// Infers a type from a sample record by looking for a conventional
    /// key property.
    pub fn infer(name: &str, sample: &Map<String, Value>) -> Option<Self> {
        let candidates = [
            "Id".to_string(),
            "id".to_string(),
            "ID".to_string(),
            format!("{name}Id"),
            format!("{name}ID"),
        ];
        candidates
            .into_iter()
            .find(|c| sample.get(c).and_then(KeyValue::from_json).is_some())
            .map(|key| EntityType::new(name).with_key([key]))
    }
}

#[derive(Default)]
struct RegistryInner {
    types: HashMap<String, EntityType>,
    resources: HashMap<String, String>,
}

/// Thread-safe table of known entity types.
#[derive(Default)]
pub struct EntityTypeRegistry {
    inner: RwLock<RegistryInner>,
}

impl EntityTypeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a type.
    pub fn register(&self, entity_type: EntityType) {
        let mut inner = self.inner.write();
        for resource in &entity_type.resources {
            inner
                .resources
                .insert(resource.clone(), entity_type.name.clone());
        }
        tracing::debug!(entity_type = %entity_type.name, "registered entity type");
        inner.types.insert(entity_type.name.clone(), entity_type);
    }

    /// Maps a resource name to an already registered type.
    pub fn map_resource(&self, resource: impl Into<String>, entity_type: &str) -> bool {
        let mut inner = self.inner.write();
        if !inner.types.contains_key(entity_type) {
            return false;
        }
        inner
            .resources
            .insert(resource.into(), entity_type.to_string());
        true
    }

    /// Looks up a type by name.
    pub fn get(&self, name: &str) -> Option<EntityType> {
        self.inner.read().types.get(name).cloned()
    }

    /// Looks up the type returned by a resource.
    pub fn for_resource(&self, resource: &str) -> Option<EntityType> {
        let inner = self.inner.read();
        inner
            .resources
            .get(resource)
            .and_then(|name| inner.types.get(name))
            .cloned()
    }

    /// Returns true if the type is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().types.contains_key(name)
    }

    /// Returns the registered type names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().types.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the number of registered types.
    pub fn len(&self) -> usize {
        self.inner.read().types.len()
    }

    /// Returns true if no type is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read().types.is_empty()
    }
}

impl std::fmt::Debug for EntityTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityTypeRegistry")
            .field("types", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn key_of_single_and_composite() {
        let todo = EntityType::new("Todo");
        let key = todo.key_of(&object(json!({"Id": 7, "Title": "x"}))).unwrap();
        assert_eq!(key, EntityKey::single("Todo", 7));

        let detail = EntityType::new("OrderDetail").with_key(["OrderId", "ProductId"]);
        let key = detail
            .key_of(&object(json!({"OrderId": 1, "ProductId": 2})))
            .unwrap();
        assert_eq!(key.values(), &[KeyValue::Int(1), KeyValue::Int(2)]);
    }

    #[test]
    fn key_of_missing_or_invalid() {
        let todo = EntityType::new("Todo");
        assert_eq!(
            todo.key_of(&object(json!({"Title": "x"}))),
            Err(MappingError::missing_key("Todo", "Id"))
        );
        assert_eq!(
            todo.key_of(&object(json!({"Id": null}))),
            Err(MappingError::missing_key("Todo", "Id"))
        );
        assert!(matches!(
            todo.key_of(&object(json!({"Id": 1.5}))),
            Err(MappingError::InvalidKeyValue { .. })
        ));
    }

    #[test]
    fn structural_inference() {
        let inferred = EntityType::infer("Todo", &object(json!({"TodoId": 3}))).unwrap();
        assert_eq!(inferred.key_properties(), &["TodoId".to_string()]);

        let inferred = EntityType::infer("Todo", &object(json!({"id": "a"}))).unwrap();
        assert_eq!(inferred.key_properties(), &["id".to_string()]);

        assert!(EntityType::infer("Todo", &object(json!({"Name": "a"}))).is_none());
    }

    #[test]
    fn registry_resources() {
        let registry = EntityTypeRegistry::new();
        registry.register(EntityType::new("Todo").identity().with_resource("Todos"));

        assert!(registry.contains("Todo"));
        assert_eq!(registry.for_resource("Todos").unwrap().name(), "Todo");
        assert!(registry.for_resource("Orders").is_none());

        assert!(registry.map_resource("OpenTodos", "Todo"));
        assert!(!registry.map_resource("Orders", "Order"));
        assert_eq!(
            registry.for_resource("OpenTodos").unwrap().key_generation(),
            KeyGeneration::Identity
        );
        assert_eq!(registry.names(), vec!["Todo".to_string()]);
    }
}
