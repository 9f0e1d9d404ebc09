//! Error types for query execution and saves.

use crate::entity::Entity;
use crate::key::EntityKey;
use crate::query::ResultShape;
use crate::tracking::{EntityState, StateOperation};
use entiq_transport::TransportError;
use serde_json::Value;
use thiserror::Error;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors raised while turning a response body into records.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MappingError {
    /// The body is not JSON.
    #[error("response body is not valid JSON: {0}")]
    InvalidJson(String),

    /// The body cannot be reconciled with the expected result shape.
    #[error("expected {expected} result but the response is {found}")]
    ShapeMismatch {
        /// Shape the query asked for.
        expected: ResultShape,
        /// What the body turned out to be.
        found: &'static str,
    },

    /// An entity result is not a JSON object.
    #[error("result #{index} is not an object")]
    NotAnObject {
        /// Position of the offending element.
        index: usize,
    },

    /// A `$ref` names an `$id` that does not appear in the body.
    #[error("unresolved reference $ref '{id}'")]
    DanglingReference {
        /// The referenced id.
        id: String,
    },

    /// A record lacks a value for a key property.
    #[error("{entity_type} record has no value for key property '{property}'")]
    MissingKey {
        /// Entity type name.
        entity_type: String,
        /// Key property name.
        property: String,
    },

    /// A key property holds a value that cannot be a key.
    #[error("key property '{property}' of {entity_type} holds unsupported value {value}")]
    InvalidKeyValue {
        /// Entity type name.
        entity_type: String,
        /// Key property name.
        property: String,
        /// Offending value.
        value: Value,
    },

    /// A record names a type the session does not know.
    #[error("unknown entity type '{0}'")]
    UnknownEntityType(String),
}

impl MappingError {
    /// Creates a shape mismatch error.
    pub fn shape_mismatch(expected: ResultShape, found: &'static str) -> Self {
        MappingError::ShapeMismatch { expected, found }
    }

    /// Creates a missing key error.
    pub fn missing_key(entity_type: impl Into<String>, property: impl Into<String>) -> Self {
        MappingError::MissingKey {
            entity_type: entity_type.into(),
            property: property.into(),
        }
    }
}

/// A server-reported problem with one entity of a save batch.
#[derive(Debug, Clone)]
pub struct EntityError {
    /// Server-side error name or validator.
    pub error_name: Option<String>,
    /// Entity type named by the server.
    pub entity_type: Option<String>,
    /// Key values named by the server.
    pub key_values: Vec<Value>,
    /// Property the error refers to.
    pub property_name: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// The tracked entity the error was resolved to, if any.
    pub entity: Option<Entity>,
}

impl EntityError {
    /// Returns the key the error names, when both type and key are present.
    pub fn key(&self) -> Option<EntityKey> {
        let entity_type = self.entity_type.as_ref()?;
        if self.key_values.is_empty() {
            return None;
        }
        let values = self
            .key_values
            .iter()
            .map(crate::key::KeyValue::from_json)
            .collect::<Option<Vec<_>>>()?;
        Some(EntityKey::new(
            crate::mapper::normalize_type_name(entity_type),
            values,
        ))
    }
}

/// The server rejected all or part of a save batch.
///
/// `committed` lists the keys that were committed anyway under
/// [`SavePolicy::PartialCommit`](crate::SavePolicy::PartialCommit). It is
/// empty whenever no tracked entity changed state.
#[derive(Debug, Clone, Error)]
#[error("save rejected: {message}")]
pub struct SaveError {
    /// Server-reported reason.
    pub message: String,
    /// HTTP status of the rejection, when the transport reported one.
    pub status: Option<u16>,
    /// Per-entity problems.
    pub entity_errors: Vec<EntityError>,
    /// Keys committed despite the rejection.
    pub committed: Vec<EntityKey>,
}

impl SaveError {
    /// Returns true when no entity changed state.
    pub fn is_atomic(&self) -> bool {
        self.committed.is_empty()
    }

    /// Returns the tracked entities named by the server.
    pub fn implicated(&self) -> Vec<Entity> {
        self.entity_errors
            .iter()
            .filter_map(|e| e.entity.clone())
            .collect()
    }
}

/// Coarse error category, for callers branching on outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network or HTTP failure.
    Transport,
    /// Response did not match the expected shape.
    Mapping,
    /// Server rejected a save.
    Save,
    /// Another save is in flight.
    Busy,
    /// Caller misuse: invalid state change, foreign entity, duplicate key.
    Usage,
}

/// Errors returned by [`Session`](crate::Session) operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Transport failure, propagated unchanged.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Response mapping failure.
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// Server-side save rejection.
    #[error(transparent)]
    Save(#[from] SaveError),

    /// A save is already in flight on this session.
    #[error("a save is already in progress on this session")]
    Busy,

    /// The entity's state does not allow the operation.
    #[error("cannot {operation} an entity in state {state}")]
    InvalidTransition {
        /// Current state.
        state: EntityState,
        /// Rejected operation.
        operation: StateOperation,
    },

    /// Another instance with the same key is already tracked.
    #[error("an entity with key {key} is already tracked")]
    DuplicateKey {
        /// The conflicting key.
        key: EntityKey,
    },

    /// The entity is not tracked by any session.
    #[error("entity is not tracked")]
    NotTracked,

    /// The entity is tracked by a different session.
    #[error("entity belongs to another session")]
    ForeignEntity,

    /// No entity type is registered under this name.
    #[error("unknown entity type '{0}'")]
    UnknownEntityType(String),

    /// Other caller misuse.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A session was asked for the ambient transport but none is enabled.
    #[error("no ambient transport adapter is enabled")]
    NoAmbientTransport,

    /// JSON serialization of a save bundle failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SessionError {
    /// Creates an invalid transition error.
    pub fn invalid_transition(state: EntityState, operation: StateOperation) -> Self {
        SessionError::InvalidTransition { state, operation }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        SessionError::InvalidOperation(msg.into())
    }

    /// Returns the coarse category of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Transport(_) => ErrorKind::Transport,
            SessionError::Mapping(_) => ErrorKind::Mapping,
            SessionError::Save(_) => ErrorKind::Save,
            SessionError::Busy => ErrorKind::Busy,
            _ => ErrorKind::Usage,
        }
    }

    /// Returns true when the server rejected a save on its merits.
    pub fn is_save_rejection(&self) -> bool {
        matches!(self, SessionError::Save(_))
    }

    /// Returns the save rejection, if this is one.
    pub fn save_error(&self) -> Option<&SaveError> {
        match self {
            SessionError::Save(e) => Some(e),
            _ => None,
        }
    }

    /// Returns the transport failure, if this is one.
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            SessionError::Transport(e) => Some(e),
            _ => None,
        }
    }

    /// Returns true if repeating the operation could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Transport(e) => e.is_retryable(),
            SessionError::Busy => true,
            _ => false,
        }
    }
}
