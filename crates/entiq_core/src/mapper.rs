//! Result mapping.
//!
//! Turns a raw response body into normalized records. The body is first
//! classified into a [`ResponsePayload`], then reconciled with the
//! [`ResultShape`] the query expects:
//!
//! | shape                 | array        | object         | envelope     | null |
//! |-----------------------|--------------|----------------|--------------|------|
//! | `SingleEntity`        | mismatch     | 1 record       | ≤ 1 result   | 0    |
//! | `EntityArray`         | N records    | 1 record       | N records    | 0    |
//! | `AnonymousArray`      | N values     | 1 value        | N values     | 0    |
//! | `InlineCountEnvelope` | mismatch     | mismatch       | N + count    | mismatch |
//!
//! Typed records get their type from `$type` when present, otherwise from
//! the type declared by the query. `$id`/`$ref` pairs are resolved.

use crate::error::MappingError;
use crate::query::ResultShape;
use entiq_transport::RawResponse;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Header some services use to report the inline count.
pub const INLINE_COUNT_HEADER: &str = "X-InlineCount";

/// A response body classified by its top-level structure.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    /// Empty body or JSON null.
    Null,
    /// A bare array.
    Array(Vec<Value>),
    /// A bare object.
    Object(Map<String, Value>),
    /// An object wrapping a results array.
    Envelope {
        /// The wrapped results.
        results: Vec<Value>,
        /// Count reported next to the results.
        inline_count: Option<u64>,
    },
    /// A bare scalar.
    Scalar(Value),
}

impl ResponsePayload {
    /// Classifies a parsed body.
    pub fn classify(value: Value) -> Self {
        match value {
            Value::Null => ResponsePayload::Null,
            Value::Array(items) => ResponsePayload::Array(items),
            Value::Object(mut object) => {
                let results_key = ["Results", "results"]
                    .into_iter()
                    .find(|k| object.get(*k).is_some_and(Value::is_array));
                match results_key {
                    Some(key) => {
                        let inline_count = ["InlineCount", "inlineCount"]
                            .into_iter()
                            .find_map(|k| object.get(k).and_then(parse_count));
                        let results = match object.remove(key) {
                            Some(Value::Array(items)) => items,
                            _ => Vec::new(),
                        };
                        ResponsePayload::Envelope {
                            results,
                            inline_count,
                        }
                    }
                    None => ResponsePayload::Object(object),
                }
            }
            scalar => ResponsePayload::Scalar(scalar),
        }
    }

    /// Parses and classifies a body. Blank bodies are `Null`.
    pub fn parse(body: &[u8]) -> Result<Self, MappingError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(ResponsePayload::Null);
        }
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| MappingError::InvalidJson(e.to_string()))?;
        Ok(Self::classify(value))
    }

    fn describe(&self) -> &'static str {
        match self {
            ResponsePayload::Null => "null",
            ResponsePayload::Array(_) => "an array",
            ResponsePayload::Object(_) => "an object",
            ResponsePayload::Envelope { .. } => "a results envelope",
            ResponsePayload::Scalar(_) => "a scalar",
        }
    }
}

fn parse_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A record ready for materialization.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    /// Entity type, absent for untyped records.
    pub entity_type: Option<String>,
    /// Record content. Always an object for typed records.
    pub data: Value,
}

impl NormalizedRecord {
    /// Returns the fields of an object record.
    pub fn fields(&self) -> Option<&Map<String, Value>> {
        self.data.as_object()
    }

    /// Returns true if the record carries a type.
    pub fn is_typed(&self) -> bool {
        self.entity_type.is_some()
    }
}

/// Output of a mapping.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MappedResult {
    /// Records in response order.
    pub records: Vec<NormalizedRecord>,
    /// Inline count, when the service reported one.
    pub inline_count: Option<u64>,
}

/// Pluggable response-to-records conversion used by the session.
pub trait ResultsAdapter: Send + Sync {
    /// Maps a full response.
    fn map(
        &self,
        response: &RawResponse,
        shape: ResultShape,
        declared_type: Option<&str>,
    ) -> Result<MappedResult, MappingError>;

    /// Maps entity payloads embedded in a save response.
    fn map_saved(&self, entities: Vec<Value>) -> Result<MappedResult, MappingError>;

    /// Returns the adapter name.
    fn name(&self) -> &str;
}

/// Default JSON results adapter.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultMapper;

impl ResultMapper {
    /// Creates a mapper.
    pub fn new() -> Self {
        Self
    }

    /// Maps a raw body.
    pub fn map_body(
        &self,
        body: &[u8],
        shape: ResultShape,
        declared_type: Option<&str>,
    ) -> Result<MappedResult, MappingError> {
        self.map_payload(ResponsePayload::parse(body)?, shape, declared_type)
    }

    /// Maps an already classified payload.
    pub fn map_payload(
        &self,
        payload: ResponsePayload,
        shape: ResultShape,
        declared_type: Option<&str>,
    ) -> Result<MappedResult, MappingError> {
        let (items, inline_count) = reconcile(payload, shape)?;
        let typed = shape != ResultShape::AnonymousArray;
        let records = normalize(items, typed, declared_type)?;
        Ok(MappedResult {
            records,
            inline_count,
        })
    }
}

impl ResultsAdapter for ResultMapper {
    fn map(
        &self,
        response: &RawResponse,
        shape: ResultShape,
        declared_type: Option<&str>,
    ) -> Result<MappedResult, MappingError> {
        let mut mapped = self.map_body(&response.body, shape, declared_type)?;
        if mapped.inline_count.is_none() {
            mapped.inline_count = response
                .header(INLINE_COUNT_HEADER)
                .and_then(|v| v.trim().parse().ok());
        }
        tracing::trace!(
            records = mapped.records.len(),
            inline_count = ?mapped.inline_count,
            "mapped response"
        );
        Ok(mapped)
    }

    fn map_saved(&self, entities: Vec<Value>) -> Result<MappedResult, MappingError> {
        self.map_payload(
            ResponsePayload::Array(entities),
            ResultShape::EntityArray,
            None,
        )
    }

    fn name(&self) -> &str {
        "json"
    }
}

fn reconcile(
    payload: ResponsePayload,
    shape: ResultShape,
) -> Result<(Vec<Value>, Option<u64>), MappingError> {
    let found = payload.describe();
    match (shape, payload) {
        (ResultShape::InlineCountEnvelope, ResponsePayload::Envelope {
            results,
            inline_count,
        }) => Ok((results, inline_count)),
        (ResultShape::InlineCountEnvelope, _) => Err(MappingError::shape_mismatch(shape, found)),

        (_, ResponsePayload::Null) => Ok((Vec::new(), None)),

        (ResultShape::SingleEntity, ResponsePayload::Array(_)) => {
            Err(MappingError::shape_mismatch(shape, found))
        }
        (ResultShape::SingleEntity, ResponsePayload::Envelope { results, .. })
            if results.len() > 1 =>
        {
            Err(MappingError::shape_mismatch(shape, "an envelope with several results"))
        }

        (ResultShape::AnonymousArray, ResponsePayload::Scalar(value)) => Ok((vec![value], None)),
        (_, ResponsePayload::Scalar(_)) => Err(MappingError::shape_mismatch(shape, found)),

        (_, ResponsePayload::Array(items)) => Ok((items, None)),
        (_, ResponsePayload::Object(object)) => Ok((vec![Value::Object(object)], None)),
        (_, ResponsePayload::Envelope {
            results,
            inline_count,
        }) => Ok((results, inline_count)),
    }
}

fn normalize(
    items: Vec<Value>,
    typed: bool,
    declared_type: Option<&str>,
) -> Result<Vec<NormalizedRecord>, MappingError> {
    let mut ids = HashMap::new();
    for item in &items {
        collect_ids(item, &mut ids);
    }

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let item = resolve_ref(item, &ids)?;
            if !typed {
                let data = match item {
                    Value::Object(object) => Value::Object(strip_markers(object).1),
                    other => other,
                };
                return Ok(NormalizedRecord {
                    entity_type: None,
                    data,
                });
            }
            match item {
                Value::Object(object) => {
                    let (tag, fields) = strip_markers(object);
                    Ok(NormalizedRecord {
                        entity_type: tag.or_else(|| declared_type.map(str::to_string)),
                        data: Value::Object(fields),
                    })
                }
                _ => Err(MappingError::NotAnObject { index }),
            }
        })
        .collect()
}

fn collect_ids(value: &Value, ids: &mut HashMap<String, Value>) {
    match value {
        Value::Object(object) => {
            if let Some(id) = object.get("$id").and_then(marker_text) {
                ids.entry(id).or_insert_with(|| value.clone());
            }
            for nested in object.values() {
                collect_ids(nested, ids);
            }
        }
        Value::Array(items) => {
            for nested in items {
                collect_ids(nested, ids);
            }
        }
        _ => {}
    }
}

fn resolve_ref(item: Value, ids: &HashMap<String, Value>) -> Result<Value, MappingError> {
    let reference = match &item {
        Value::Object(object) if object.len() == 1 => object.get("$ref").and_then(marker_text),
        _ => None,
    };
    match reference {
        Some(id) => ids
            .get(&id)
            .cloned()
            .ok_or(MappingError::DanglingReference { id }),
        None => Ok(item),
    }
}

fn marker_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn strip_markers(mut object: Map<String, Value>) -> (Option<String>, Map<String, Value>) {
    object.remove("$id");
    object.remove("$ref");
    let tag = match object.remove("$type") {
        Some(Value::String(name)) => Some(normalize_type_name(&name)),
        _ => None,
    };
    (tag, object)
}

/// Reduces a server type name to its short form.
///
/// `"Demo.Models.Todo, Demo"`, `"Todo:#Demo.Models"` and `"Demo.Models.Todo"`
/// all become `"Todo"`.
pub fn normalize_type_name(raw: &str) -> String {
    let name = raw.split(',').next().unwrap_or(raw).trim();
    let name = name.split(":#").next().unwrap_or(name);
    name.rsplit('.').next().unwrap_or(name).to_string()
}
