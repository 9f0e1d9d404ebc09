//! Entity keys.

use serde_json::Value;
use std::fmt;

/// A single key component.
///
/// Keys are restricted to values with exact equality: integers, text and
/// booleans. GUID keys travel as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyValue {
    /// Boolean key component.
    Bool(bool),
    /// Integer key component.
    Int(i64),
    /// Text key component.
    Text(String),
}

impl KeyValue {
    /// Converts a JSON value into a key component.
    ///
    /// Returns `None` for null, floats, arrays and objects.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(KeyValue::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
                .map(KeyValue::Int),
            Value::String(s) => Some(KeyValue::Text(s.clone())),
            _ => None,
        }
    }

    /// Converts the key component back to JSON.
    pub fn to_json(&self) -> Value {
        match self {
            KeyValue::Bool(b) => Value::Bool(*b),
            KeyValue::Int(i) => Value::from(*i),
            KeyValue::Text(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Bool(b) => write!(f, "{b}"),
            KeyValue::Int(i) => write!(f, "{i}"),
            KeyValue::Text(s) => write!(f, "'{s}'"),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        KeyValue::Int(value)
    }
}

impl From<i32> for KeyValue {
    fn from(value: i32) -> Self {
        KeyValue::Int(i64::from(value))
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        KeyValue::Text(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        KeyValue::Text(value)
    }
}

impl From<bool> for KeyValue {
    fn from(value: bool) -> Self {
        KeyValue::Bool(value)
    }
}

/// Identity of an entity within a session: its type plus ordered key values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    entity_type: String,
    values: Vec<KeyValue>,
}

impl EntityKey {
    /// Creates a key from its parts.
    pub fn new(entity_type: impl Into<String>, values: Vec<KeyValue>) -> Self {
        Self {
            entity_type: entity_type.into(),
            values,
        }
    }

    /// Creates a single-component key.
    pub fn single(entity_type: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        Self::new(entity_type, vec![value.into()])
    }

    /// Returns the entity type name.
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Returns the key components in key-property order.
    pub fn values(&self) -> &[KeyValue] {
        &self.values
    }

    /// Returns the key components as JSON values.
    pub fn to_json_values(&self) -> Vec<Value> {
        self.values.iter().map(KeyValue::to_json).collect()
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.entity_type)?;
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str(")")
    }
}
