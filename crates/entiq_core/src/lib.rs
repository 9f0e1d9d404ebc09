//! # entiq Core
//!
//! Query execution, entity change tracking and saves for entiq.
//!
//! This crate provides:
//! - Immutable, composable queries with OData-style filters
//! - A pluggable result mapper that normalizes arrays, objects and
//!   results envelopes into records
//! - Shared entity handles with tracking metadata and a state machine
//! - The [`Session`], which merges query results into an identity cache
//!   and saves pending changes as one batch
//!
//! ## Architecture
//!
//! A query flows through the session in three steps:
//! 1. The transport fetches the raw response
//! 2. The results adapter maps it into normalized records
//! 3. The session merges typed records into its cache
//!
//! Saves go the other way: the session collects changed entities into a
//! save bundle, sends it, and commits the response.
//!
//! ## Key Invariants
//!
//! - One instance per `(entity type, key)` within a session
//! - A failed mapping or save leaves tracked entities untouched
//! - At most one save in flight per session
//! - State changes only through session-mediated operations

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod config;
mod entity;
mod error;
mod key;
mod mapper;
mod predicate;
mod query;
mod registry;
mod save;
mod session;
mod tracking;

pub use change_feed::{ChangeFeed, EntityAction, EntityChange};
pub use config::{SavePolicy, SessionConfig};
pub use entity::Entity;
pub use error::{EntityError, ErrorKind, MappingError, SaveError, SessionError, SessionResult};
pub use key::{EntityKey, KeyValue};
pub use mapper::{
    normalize_type_name, MappedResult, NormalizedRecord, ResponsePayload, ResultMapper,
    ResultsAdapter, INLINE_COUNT_HEADER,
};
pub use predicate::{FilterOp, Predicate, PropertyRef};
pub use query::{
    EntityQuery, MergeStrategy, OrderBy, QueryItem, QueryResult, ResultShape, SortDirection,
};
pub use registry::{EntityType, EntityTypeRegistry, KeyGeneration};
pub use save::{
    AutoGeneratedKey, EntityAspect, EntityChangeRecord, KeyMapping, SaveBundle, SaveOptions,
    SaveResult,
};
pub use session::Session;
pub use tracking::{EntityState, StateOperation, TrackingMetadata};

pub use entiq_transport::{ServiceEndpoint, Transport, TransportError};
