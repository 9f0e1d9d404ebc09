//! The session: entity cache, query pipeline and save pipeline.
//!
//! A session owns the tracked entities of one unit of work. It is a cheap,
//! cloneable handle; clones share the same cache.
//!
//! Locks are always taken in the order cache, then entity, then change
//! feed, and none is held across an `.await`.

use crate::change_feed::{ChangeFeed, EntityAction, EntityChange};
use crate::config::{SavePolicy, SessionConfig};
use crate::entity::{Entity, EntityData};
use crate::error::{EntityError, MappingError, SaveError, SessionError, SessionResult};
use crate::key::EntityKey;
use crate::mapper::{NormalizedRecord, ResultMapper, ResultsAdapter};
use crate::predicate::order_values;
use crate::query::{EntityQuery, MergeStrategy, QueryItem, QueryResult, SortDirection};
use crate::registry::{EntityType, EntityTypeRegistry, KeyGeneration};
use crate::save::{
    EntityChangeRecord, KeyMapping, SaveBundle, SaveOptions, SaveResponseBody, SaveResult,
};
use crate::tracking::{EntityState, StateOperation, TrackingMetadata};
use entiq_transport::{ambient, Transport, TransportError};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

type EntityCache = HashMap<EntityKey, Entity>;

pub(crate) struct SessionShared {
    pub(crate) config: SessionConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) adapter: Arc<dyn ResultsAdapter>,
    pub(crate) registry: EntityTypeRegistry,
    pub(crate) cache: RwLock<EntityCache>,
    pub(crate) feed: ChangeFeed,
    saving: AtomicBool,
    next_sequence: AtomicU64,
    next_temp_key: AtomicI64,
}

/// Marks a save as in flight for as long as it lives.
struct SaveGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> SaveGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for SaveGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl SessionShared {
    /// Moves an added entity to the key derived from setting `property`.
    pub(crate) fn rekey(&self, entity: &Entity, property: &str, value: Value) -> SessionResult<()> {
        let (from, to) = {
            let mut cache = self.cache.write();
            if self.saving.load(Ordering::Acquire) {
                return Err(SessionError::invalid_operation(format!(
                    "key property '{property}' cannot change while a save is in flight"
                )));
            }
            let mut data = entity.write();
            let EntityData {
                values, tracking, ..
            } = &mut *data;
            let Some(meta) = tracking.as_mut() else {
                values.insert(property.to_string(), value);
                return Ok(());
            };
            if meta.state != EntityState::Added {
                return Err(SessionError::invalid_operation(format!(
                    "key property '{property}' of {} cannot change",
                    meta.key
                )));
            }
            let entity_type = self
                .registry
                .get(meta.entity_type())
                .ok_or_else(|| SessionError::UnknownEntityType(meta.entity_type().to_string()))?;

            let mut next = values.clone();
            next.insert(property.to_string(), value);
            let key = entity_type.key_of(&next)?;
            if key != meta.key {
                if cache.contains_key(&key) {
                    return Err(SessionError::DuplicateKey { key });
                }
                cache.remove(&meta.key);
                cache.insert(key.clone(), entity.clone());
            }
            *values = next;
            let from = std::mem::replace(&mut meta.key, key.clone());
            (from, key)
        };
        if from != to {
            tracing::trace!(%from, %to, "re-keyed added entity");
            self.feed.emit(EntityAction::KeyChanged, to.clone(), None);
        }
        self.feed
            .emit(EntityAction::PropertyChanged, to, Some(property.to_string()));
        Ok(())
    }
}

/// A record whose type and key are resolved, ready to merge.
enum Prepared {
    Value(Value),
    Entity {
        entity_type: EntityType,
        key: EntityKey,
        fields: Map<String, Value>,
    },
}

/// One entity of a save batch, as it was when the save started.
struct BatchEntry {
    entity: Entity,
    key: EntityKey,
    sequence: u64,
    /// State and values sent to the service.
    state: EntityState,
    values: Map<String, Value>,
}

/// Unit of work over a remote service.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Creates a session using the given transport and the default mapper.
    pub fn new(config: SessionConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_results_adapter(config, transport, Arc::new(ResultMapper::new()))
    }

    /// Creates a session with a custom results adapter.
    pub fn with_results_adapter(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        adapter: Arc<dyn ResultsAdapter>,
    ) -> Self {
        tracing::debug!(
            service = %config.endpoint.service_name,
            transport = transport.name(),
            adapter = adapter.name(),
            "creating session"
        );
        let feed = ChangeFeed::with_max_history(config.change_history);
        Self {
            shared: Arc::new(SessionShared {
                config,
                transport,
                adapter,
                registry: EntityTypeRegistry::new(),
                cache: RwLock::new(HashMap::new()),
                feed,
                saving: AtomicBool::new(false),
                next_sequence: AtomicU64::new(0),
                next_temp_key: AtomicI64::new(-1),
            }),
        }
    }

    /// Creates a session using the process-wide ambient transport.
    ///
    /// The ambient adapter is read once, here; replacing it later does not
    /// affect this session.
    pub fn with_ambient_transport(config: SessionConfig) -> SessionResult<Self> {
        let transport = ambient::active().ok_or(SessionError::NoAmbientTransport)?;
        Ok(Self::new(config, transport))
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Returns the entity type registry.
    pub fn registry(&self) -> &EntityTypeRegistry {
        &self.shared.registry
    }

    /// Returns the transport.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.shared.transport)
    }

    /// Returns true while a save is in flight.
    pub fn is_saving(&self) -> bool {
        self.shared.saving.load(Ordering::Acquire)
    }

    /// Subscribes to entity change notifications.
    pub fn subscribe(&self) -> Receiver<EntityChange> {
        self.shared.feed.subscribe()
    }

    /// Returns recorded changes after `cursor`, up to `limit`.
    pub fn recent_changes(&self, cursor: u64, limit: usize) -> Vec<EntityChange> {
        self.shared.feed.poll(cursor, limit)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Executes a query against the service.
    ///
    /// Typed records are merged into the cache: a record whose key is
    /// already tracked updates that instance in place, others are
    /// materialized as `Unchanged`. Untyped records are returned as plain
    /// values. A mapping failure leaves the cache untouched.
    pub async fn execute_query(&self, query: &EntityQuery) -> SessionResult<QueryResult> {
        let declared = self.declared_type(query);
        let request = self.shared.config.endpoint.get(query.resource_path());
        tracing::debug!(
            resource = %query.resource_name(),
            shape = %query.shape(),
            "executing query"
        );

        let response = self.shared.transport.send(request).await?;
        let mapped = self
            .shared
            .adapter
            .map(&response, query.shape(), declared.as_deref())?;
        let prepared = self.prepare(mapped.records)?;

        let strategy = query
            .merge_strategy()
            .unwrap_or(self.shared.config.merge_strategy);
        let results = self.merge(
            prepared,
            strategy,
            EntityAction::AttachedOnQuery,
            EntityAction::MergedOnQuery,
        );
        tracing::debug!(results = results.len(), "query completed");

        Ok(QueryResult {
            results,
            inline_count: mapped.inline_count,
        })
    }

    /// Evaluates a query against the cache only.
    ///
    /// Considers tracked, non-deleted entities of the query's type; applies
    /// filter, ordering and paging. Ties keep attach order.
    pub fn execute_query_locally(&self, query: &EntityQuery) -> SessionResult<Vec<Entity>> {
        let type_name = self.declared_type(query).ok_or_else(|| {
            SessionError::invalid_operation(format!(
                "no entity type is known for resource '{}'",
                query.resource_name()
            ))
        })?;

        let mut candidates: Vec<(u64, Map<String, Value>, Entity)> = {
            let cache = self.shared.cache.read();
            cache
                .values()
                .filter_map(|entity| {
                    let data = entity.read();
                    let tracking = data.tracking.as_ref()?;
                    if tracking.entity_type() != type_name
                        || tracking.state == EntityState::Deleted
                    {
                        return None;
                    }
                    if let Some(filter) = query.filter() {
                        if !filter.matches(&data.values) {
                            return None;
                        }
                    }
                    Some((tracking.sequence, data.values.clone(), entity.clone()))
                })
                .collect()
        };

        candidates.sort_by(|a, b| {
            for clause in query.ordering() {
                let left = a.1.get(&clause.property).unwrap_or(&Value::Null);
                let right = b.1.get(&clause.property).unwrap_or(&Value::Null);
                let mut ordering = order_values(left, right).unwrap_or(CmpOrdering::Equal);
                if clause.direction == SortDirection::Descending {
                    ordering = ordering.reverse();
                }
                if ordering != CmpOrdering::Equal {
                    return ordering;
                }
            }
            a.0.cmp(&b.0)
        });

        let skip = query.skip_count().unwrap_or(0) as usize;
        let take = query.take_count().map_or(usize::MAX, |t| t as usize);
        Ok(candidates
            .into_iter()
            .skip(skip)
            .take(take)
            .map(|(_, _, entity)| entity)
            .collect())
    }

    fn declared_type(&self, query: &EntityQuery) -> Option<String> {
        query.entity_type().map(str::to_string).or_else(|| {
            self.shared
                .registry
                .for_resource(query.resource_name())
                .map(|t| t.name().to_string())
        })
    }

    fn lookup_type(&self, name: &str, sample: Option<&Map<String, Value>>) -> Option<EntityType> {
        if let Some(entity_type) = self.shared.registry.get(name) {
            return Some(entity_type);
        }
        if self.shared.config.endpoint.has_server_metadata {
            return None;
        }
        let inferred = EntityType::infer(name, sample?)?;
        tracing::debug!(
            entity_type = name,
            key = ?inferred.key_properties(),
            "inferred entity type from payload"
        );
        self.shared.registry.register(inferred.clone());
        Some(inferred)
    }

    fn prepare_record(&self, record: NormalizedRecord) -> Result<Prepared, MappingError> {
        let (type_name, fields) = match (record.entity_type, record.data) {
            (Some(type_name), Value::Object(fields)) => (type_name, fields),
            (_, data) => return Ok(Prepared::Value(data)),
        };
        let entity_type = self
            .lookup_type(&type_name, Some(&fields))
            .ok_or(MappingError::UnknownEntityType(type_name))?;
        let key = entity_type.key_of(&fields)?;
        Ok(Prepared::Entity {
            entity_type,
            key,
            fields,
        })
    }

    fn prepare(&self, records: Vec<NormalizedRecord>) -> Result<Vec<Prepared>, MappingError> {
        records
            .into_iter()
            .map(|record| self.prepare_record(record))
            .collect()
    }

    fn merge(
        &self,
        prepared: Vec<Prepared>,
        strategy: MergeStrategy,
        on_new: EntityAction,
        on_merge: EntityAction,
    ) -> Vec<QueryItem> {
        let mut events = Vec::new();
        let items = {
            let mut cache = self.shared.cache.write();
            prepared
                .into_iter()
                .map(|p| match p {
                    Prepared::Value(value) => QueryItem::Value(value),
                    Prepared::Entity {
                        entity_type,
                        key,
                        fields,
                    } => QueryItem::Entity(self.merge_one(
                        &mut cache,
                        &entity_type,
                        key,
                        fields,
                        strategy,
                        (on_new, on_merge),
                        &mut events,
                    )),
                })
                .collect()
        };
        self.shared.feed.emit_all(events);
        items
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_one(
        &self,
        cache: &mut EntityCache,
        entity_type: &EntityType,
        key: EntityKey,
        fields: Map<String, Value>,
        strategy: MergeStrategy,
        (on_new, on_merge): (EntityAction, EntityAction),
        events: &mut Vec<(EntityAction, EntityKey)>,
    ) -> Entity {
        if let Some(existing) = cache.get(&key) {
            let mut data = existing.write();
            let EntityData {
                values, tracking, ..
            } = &mut *data;
            if let Some(tracking) = tracking.as_mut() {
                let overwrite = strategy == MergeStrategy::OverwriteChanges
                    || tracking.state == EntityState::Unchanged;
                if let (true, Some(next)) =
                    (overwrite, tracking.state.transition(StateOperation::Merge))
                {
                    values.extend(fields);
                    tracking.state = next;
                    tracking.original_values.clear();
                    events.push((on_merge, key));
                }
            }
            return existing.clone();
        }

        let entity = Entity::from_values(entity_type.name(), fields);
        entity.write().tracking = Some(self.new_tracking(
            key.clone(),
            entity_type,
            EntityState::Unchanged,
        ));
        cache.insert(key.clone(), entity.clone());
        events.push((on_new, key));
        entity
    }

    fn new_tracking(
        &self,
        key: EntityKey,
        entity_type: &EntityType,
        state: EntityState,
    ) -> TrackingMetadata {
        TrackingMetadata::new(
            key,
            entity_type.key_properties().to_vec(),
            state,
            Arc::downgrade(&self.shared),
            self.shared.next_sequence.fetch_add(1, Ordering::SeqCst),
        )
    }

    // ------------------------------------------------------------------
    // Local tracking operations
    // ------------------------------------------------------------------

    /// Returns true if this session tracks the entity.
    pub fn owns(&self, entity: &Entity) -> bool {
        entity
            .read()
            .tracking
            .as_ref()
            .is_some_and(|t| self.owns_tracking(t))
    }

    fn owns_tracking(&self, tracking: &TrackingMetadata) -> bool {
        std::ptr::eq(tracking.session.as_ptr(), Arc::as_ptr(&self.shared))
    }

    fn owned<'a>(&self, data: &'a mut EntityData) -> SessionResult<&'a mut TrackingMetadata> {
        match data.tracking.as_mut() {
            None => Err(SessionError::NotTracked),
            Some(t) if !self.owns_tracking(t) => Err(SessionError::ForeignEntity),
            Some(t) => Ok(t),
        }
    }

    /// Creates an entity of a registered type and adds it.
    pub fn create_entity(&self, entity_type: &str, initial: Value) -> SessionResult<Entity> {
        let entity = Entity::from_json(entity_type, initial);
        self.add_entity(&entity)?;
        Ok(entity)
    }

    /// Starts tracking a new entity as `Added`.
    ///
    /// Server-generated keys get a temporary negative value and client
    /// GUID keys a random UUID when the key is not set.
    pub fn add_entity(&self, entity: &Entity) -> SessionResult<()> {
        self.track(entity, StateOperation::Add, EntityAction::Added)
    }

    /// Starts tracking an existing entity as `Unchanged`.
    pub fn attach_entity(&self, entity: &Entity) -> SessionResult<()> {
        self.track(entity, StateOperation::Attach, EntityAction::Attached)
    }

    fn track(
        &self,
        entity: &Entity,
        operation: StateOperation,
        action: EntityAction,
    ) -> SessionResult<()> {
        let key = {
            let mut cache = self.shared.cache.write();
            let mut data = entity.write();
            if let Some(tracking) = &data.tracking {
                return Err(if self.owns_tracking(tracking) {
                    SessionError::invalid_transition(tracking.state, operation)
                } else {
                    SessionError::ForeignEntity
                });
            }
            let state = EntityState::Detached
                .transition(operation)
                .ok_or_else(|| SessionError::invalid_transition(EntityState::Detached, operation))?;

            let entity_type = self
                .lookup_type(&data.entity_type, Some(&data.values))
                .ok_or_else(|| SessionError::UnknownEntityType(data.entity_type.clone()))?;
            if operation == StateOperation::Add {
                self.generate_key(&entity_type, &mut data.values);
            }
            let key = entity_type.key_of(&data.values)?;
            if cache.contains_key(&key) {
                return Err(SessionError::DuplicateKey { key });
            }

            data.tracking = Some(self.new_tracking(key.clone(), &entity_type, state));
            cache.insert(key.clone(), entity.clone());
            key
        };
        tracing::trace!(%key, ?action, "tracking entity");
        self.shared.feed.emit(action, key, None);
        Ok(())
    }

    fn generate_key(&self, entity_type: &EntityType, values: &mut Map<String, Value>) {
        let [property] = entity_type.key_properties() else {
            return;
        };
        let unset = match values.get(property) {
            None | Some(Value::Null) => true,
            Some(Value::Number(n)) => n.as_i64() == Some(0),
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        };
        if !unset {
            return;
        }
        match entity_type.key_generation() {
            KeyGeneration::Identity => {
                let temp = self.shared.next_temp_key.fetch_sub(1, Ordering::SeqCst);
                values.insert(property.clone(), Value::from(temp));
            }
            KeyGeneration::ClientGuid => {
                values.insert(
                    property.clone(),
                    Value::String(uuid::Uuid::new_v4().to_string()),
                );
            }
            KeyGeneration::None => {}
        }
    }

    /// Marks an entity for deletion.
    ///
    /// An `Added` entity was never saved and is detached instead.
    pub fn mark_for_delete(&self, entity: &Entity) -> SessionResult<()> {
        let (action, key) = {
            let mut cache = self.shared.cache.write();
            let mut data = entity.write();
            let tracking = self.owned(&mut data)?;
            let next = tracking
                .state
                .transition(StateOperation::MarkForDelete)
                .ok_or_else(|| {
                    SessionError::invalid_transition(tracking.state, StateOperation::MarkForDelete)
                })?;
            let key = tracking.key.clone();
            if next == EntityState::Detached {
                cache.remove(&key);
                data.tracking = None;
                (EntityAction::Detached, key)
            } else {
                tracking.state = next;
                (EntityAction::MarkedForDelete, key)
            }
        };
        self.shared.feed.emit(action, key, None);
        Ok(())
    }

    /// Discards pending changes of an entity.
    ///
    /// Modified and deleted entities get their original values back and
    /// become `Unchanged`; added entities are detached.
    pub fn reject_changes(&self, entity: &Entity) -> SessionResult<()> {
        let (action, key) = {
            let mut cache = self.shared.cache.write();
            let mut data = entity.write();
            let tracking = self.owned(&mut data)?;
            let next = tracking
                .state
                .transition(StateOperation::RejectChanges)
                .ok_or_else(|| {
                    SessionError::invalid_transition(tracking.state, StateOperation::RejectChanges)
                })?;
            let key = tracking.key.clone();
            if next == EntityState::Detached {
                cache.remove(&key);
                data.tracking = None;
                (EntityAction::Detached, key)
            } else {
                tracking.state = next;
                let originals = std::mem::take(&mut tracking.original_values);
                data.values.extend(originals);
                (EntityAction::ChangesRejected, key)
            }
        };
        self.shared.feed.emit(action, key, None);
        Ok(())
    }

    /// Stops tracking an entity.
    pub fn detach_entity(&self, entity: &Entity) -> SessionResult<()> {
        let key = {
            let mut cache = self.shared.cache.write();
            let mut data = entity.write();
            let key = self.owned(&mut data)?.key.clone();
            cache.remove(&key);
            data.tracking = None;
            key
        };
        self.shared.feed.emit(EntityAction::Detached, key, None);
        Ok(())
    }

    /// Looks up a tracked entity by key.
    pub fn find_entity_by_key(&self, key: &EntityKey) -> Option<Entity> {
        self.shared.cache.read().get(key).cloned()
    }

    /// Returns tracked entities, optionally filtered by type and states,
    /// in attach order. An empty `states` slice matches every state.
    pub fn entities(&self, entity_type: Option<&str>, states: &[EntityState]) -> Vec<Entity> {
        let mut found: Vec<(u64, Entity)> = {
            let cache = self.shared.cache.read();
            cache
                .values()
                .filter_map(|entity| {
                    let data = entity.read();
                    let tracking = data.tracking.as_ref()?;
                    let type_matches = entity_type.map_or(true, |t| t == tracking.entity_type());
                    let state_matches = states.is_empty() || states.contains(&tracking.state);
                    (type_matches && state_matches).then(|| (tracking.sequence, entity.clone()))
                })
                .collect()
        };
        found.sort_by_key(|(sequence, _)| *sequence);
        found.into_iter().map(|(_, entity)| entity).collect()
    }

    /// Returns entities with pending changes, in attach order.
    pub fn changes(&self) -> Vec<Entity> {
        self.entities(
            None,
            &[EntityState::Added, EntityState::Modified, EntityState::Deleted],
        )
    }

    /// Returns true if any entity has pending changes.
    pub fn has_changes(&self) -> bool {
        self.shared
            .cache
            .read()
            .values()
            .any(|e| e.state().is_changed())
    }

    /// Returns the number of tracked entities.
    pub fn tracked_count(&self) -> usize {
        self.shared.cache.read().len()
    }

    // ------------------------------------------------------------------
    // Saves
    // ------------------------------------------------------------------

    /// Saves pending changes as one batch.
    ///
    /// With `None` every added, modified and deleted entity is saved; with
    /// a slice only those entities are (unchanged ones are skipped). An
    /// empty change set succeeds without contacting the service.
    ///
    /// Only one save may be in flight per session: a concurrent call fails
    /// with [`SessionError::Busy`] before anything is sent.
    ///
    /// On success added and modified entities become `Unchanged` with
    /// server keys applied, and deleted ones are detached. Edits made while
    /// the save is in flight are kept as pending changes, and an entity
    /// marked for deletion meanwhile stays `Deleted`. If the entities
    /// echoed by the service cannot be mapped, the call fails with
    /// [`SessionError::Mapping`] before any state changes. On failure no
    /// entity changes state, except under [`SavePolicy::PartialCommit`]
    /// where a successful response that also reports entity errors commits
    /// the entities not named by an error and lists them in
    /// [`SaveError::committed`].
    pub async fn save_changes(&self, entities: Option<&[Entity]>) -> SessionResult<SaveResult> {
        let _guard = SaveGuard::acquire(&self.shared.saving).ok_or(SessionError::Busy)?;

        let (batch, records) = self.collect_batch(entities)?;
        if batch.is_empty() {
            tracing::debug!("no changes to save");
            return Ok(SaveResult::default());
        }

        let bundle = SaveBundle {
            entities: records,
            save_options: SaveOptions {
                allow_concurrent_saves: false,
            },
        };
        let endpoint = &self.shared.config.endpoint;
        let request = endpoint.post_json(endpoint.save_resource.clone(), serde_json::to_vec(&bundle)?);
        tracing::debug!(entities = batch.len(), "saving changes");

        let response = match self.shared.transport.send(request).await {
            Ok(response) => response,
            Err(err) => return Err(self.classify_save_failure(err, &batch)),
        };

        let mut body = if response.body.iter().all(u8::is_ascii_whitespace) {
            SaveResponseBody::default()
        } else {
            SaveResponseBody::parse(&response.body).ok_or_else(|| {
                MappingError::InvalidJson("save response is not a JSON object".to_string())
            })?
        };

        if !body.has_errors() {
            let returned = self.prepare_saved(body.entities.take().unwrap_or_default())?;
            let (result, _) = self.commit(&batch, &body, returned, |_| true);
            tracing::debug!(saved = result.entities.len(), "save completed");
            return Ok(result);
        }

        let entity_errors = self.resolve_errors(body.take_entity_errors(), &batch);
        let message = body
            .innermost_message()
            .unwrap_or_else(|| "the service rejected the save".to_string());
        let failed: Option<HashSet<EntityKey>> =
            entity_errors.iter().map(EntityError::key).collect();

        let committed = match (self.shared.config.save_policy, failed) {
            (SavePolicy::PartialCommit, Some(failed)) => {
                let returned = self.prepare_saved(body.entities.take().unwrap_or_default())?;
                self.commit(&batch, &body, returned, |key| !failed.contains(key))
                    .1
            }
            _ => Vec::new(),
        };
        tracing::warn!(
            errors = entity_errors.len(),
            committed = committed.len(),
            "save rejected"
        );
        Err(SaveError {
            message,
            status: Some(response.status),
            entity_errors,
            committed,
        }
        .into())
    }

    fn collect_batch(
        &self,
        scope: Option<&[Entity]>,
    ) -> SessionResult<(Vec<BatchEntry>, Vec<EntityChangeRecord>)> {
        let candidates = match scope {
            None => self.changes(),
            Some(list) => {
                let mut unique: Vec<Entity> = Vec::with_capacity(list.len());
                for entity in list {
                    match &entity.read().tracking {
                        None => return Err(SessionError::NotTracked),
                        Some(t) if !self.owns_tracking(t) => {
                            return Err(SessionError::ForeignEntity)
                        }
                        Some(_) => {}
                    }
                    if !unique.contains(entity) {
                        unique.push(entity.clone());
                    }
                }
                unique
            }
        };

        let mut batch = Vec::new();
        for entity in candidates {
            let data = entity.read();
            let Some(tracking) = data.tracking.as_ref() else {
                continue;
            };
            if !tracking.state.is_changed() {
                continue;
            }
            let entity_type = self
                .shared
                .registry
                .get(tracking.entity_type())
                .ok_or_else(|| SessionError::UnknownEntityType(tracking.entity_type().to_string()))?;
            let record = EntityChangeRecord::new(
                &entity_type,
                tracking.state,
                data.values.clone(),
                tracking.original_values.clone(),
            );
            let entry = BatchEntry {
                entity: entity.clone(),
                key: tracking.key.clone(),
                sequence: tracking.sequence,
                state: tracking.state,
                values: data.values.clone(),
            };
            batch.push((entry, record));
        }
        batch.sort_by_key(|(entry, _)| entry.sequence);
        Ok(batch.into_iter().unzip())
    }

    fn classify_save_failure(&self, err: TransportError, batch: &[BatchEntry]) -> SessionError {
        if let TransportError::Status { status, body } = &err {
            if let Some(mut parsed) = SaveResponseBody::parse(body.as_bytes()) {
                if parsed.has_errors() {
                    let entity_errors = self.resolve_errors(parsed.take_entity_errors(), batch);
                    let message = parsed
                        .innermost_message()
                        .unwrap_or_else(|| format!("the service rejected the save ({status})"));
                    tracing::warn!(status, errors = entity_errors.len(), "save rejected");
                    return SaveError {
                        message,
                        status: Some(*status),
                        entity_errors,
                        committed: Vec::new(),
                    }
                    .into();
                }
            }
        }
        tracing::debug!(error = %err, "save failed in transport");
        SessionError::Transport(err)
    }

    fn resolve_errors(&self, mut errors: Vec<EntityError>, batch: &[BatchEntry]) -> Vec<EntityError> {
        for error in &mut errors {
            if let Some(key) = error.key() {
                error.entity = batch
                    .iter()
                    .find(|entry| entry.key == key)
                    .map(|entry| entry.entity.clone());
            }
        }
        errors
    }

    /// Applies a successful save response to the entities accepted by
    /// `include`, in one step under the cache lock. Returns the result and
    /// the final keys of the committed entities.
    ///
    /// Each entity is committed against what was sent. Edits made while the
    /// save was in flight stay pending, and an entity whose state moved
    /// since the batch was collected keeps that state.
    fn commit(
        &self,
        batch: &[BatchEntry],
        body: &SaveResponseBody,
        returned: Vec<Prepared>,
        include: impl Fn(&EntityKey) -> bool,
    ) -> (SaveResult, Vec<EntityKey>) {
        let key_mappings = body.key_mappings();

        let mut events = Vec::new();
        let mut committed = Vec::new();
        let mut committed_keys = Vec::new();
        let mut applied = Vec::new();
        {
            let mut cache = self.shared.cache.write();
            let mut skip_merge: HashSet<EntityKey> = HashSet::new();

            for entry in batch {
                if !include(&entry.key) {
                    skip_merge.insert(entry.key.clone());
                    continue;
                }
                let mut data = entry.entity.write();
                let EntityData {
                    values, tracking, ..
                } = &mut *data;
                let Some(meta) = tracking.as_mut().filter(|m| self.owns_tracking(m)) else {
                    tracing::debug!(key = %entry.key, "saved entity was detached during the save");
                    continue;
                };
                let Some(next) = entry.state.transition(StateOperation::SaveSuccess) else {
                    continue;
                };
                let held = match (entry.state, meta.state) {
                    (sent, now) if sent == now => None,
                    (EntityState::Modified, EntityState::Unchanged) => None,
                    (EntityState::Modified, EntityState::Deleted) => Some(EntityState::Deleted),
                    (sent, now) => {
                        tracing::debug!(key = %meta.key, ?sent, ?now, "entity left pending after save");
                        skip_merge.insert(meta.key.clone());
                        continue;
                    }
                };

                if next == EntityState::Detached {
                    cache.remove(&meta.key);
                    skip_merge.insert(meta.key.clone());
                    events.push((EntityAction::Detached, meta.key.clone()));
                    committed_keys.push(meta.key.clone());
                    *tracking = None;
                } else {
                    let mut saved = entry.values.clone();
                    if entry.state == EntityState::Added {
                        if let Some(mapping) = key_mappings.iter().find(|m| m.temp_key() == meta.key)
                        {
                            apply_key_mapping(&mut cache, &entry.entity, meta, values, mapping);
                            events.push((EntityAction::KeyChanged, meta.key.clone()));
                            applied.push(mapping.clone());
                        }
                        for property in &meta.key_properties {
                            if let Some(value) = values.get(property) {
                                saved.insert(property.clone(), value.clone());
                            }
                        }
                    }
                    meta.original_values = unsaved_originals(values, &saved);
                    meta.state = held.unwrap_or(if meta.original_values.is_empty() {
                        next
                    } else {
                        EntityState::Modified
                    });
                    if meta.state != next {
                        skip_merge.insert(meta.key.clone());
                    }
                    events.push((EntityAction::Saved, meta.key.clone()));
                    committed_keys.push(meta.key.clone());
                }
                committed.push(entry.entity.clone());
            }

            for prepared in returned {
                if let Prepared::Entity {
                    entity_type,
                    key,
                    fields,
                } = prepared
                {
                    if skip_merge.contains(&key) {
                        continue;
                    }
                    self.merge_one(
                        &mut cache,
                        &entity_type,
                        key,
                        fields,
                        MergeStrategy::OverwriteChanges,
                        (EntityAction::Attached, EntityAction::MergedOnSave),
                        &mut events,
                    );
                }
            }
        }
        self.shared.feed.emit_all(events);

        let result = SaveResult {
            entities: committed,
            key_mappings: applied,
        };
        (result, committed_keys)
    }

    /// Maps the entities echoed by a save. Runs before anything is
    /// committed, so a response that cannot be read changes no state.
    fn prepare_saved(&self, entities: Vec<Value>) -> Result<Vec<Prepared>, MappingError> {
        if entities.is_empty() {
            return Ok(Vec::new());
        }
        let mapped = self.shared.adapter.map_saved(entities).map_err(|err| {
            tracing::warn!(error = %err, "unreadable entities in save response");
            err
        })?;
        self.prepare(mapped.records)
    }
}

/// Values of `values` that differ from what the service now holds, keyed
/// to the saved value they replace.
fn unsaved_originals(values: &Map<String, Value>, saved: &Map<String, Value>) -> Map<String, Value> {
    let mut originals = Map::new();
    for (property, value) in values {
        let baseline = saved.get(property).unwrap_or(&Value::Null);
        if baseline != value {
            originals.insert(property.clone(), baseline.clone());
        }
    }
    for (property, baseline) in saved {
        if !values.contains_key(property) {
            originals.insert(property.clone(), baseline.clone());
        }
    }
    originals
}

fn apply_key_mapping(
    cache: &mut EntityCache,
    entity: &Entity,
    meta: &mut TrackingMetadata,
    values: &mut Map<String, Value>,
    mapping: &KeyMapping,
) {
    let Some(property) = meta.key_properties.first().cloned() else {
        return;
    };
    let new_key = EntityKey::single(meta.key.entity_type(), mapping.real_value.clone());
    tracing::trace!(from = %meta.key, to = %new_key, "applying server key");

    cache.remove(&meta.key);
    values.insert(property, mapping.real_value.to_json());
    if let Some(previous) = cache.insert(new_key.clone(), entity.clone()) {
        if !Entity::ptr_eq(&previous, entity) {
            tracing::warn!(key = %new_key, "server key replaced another tracked entity");
            previous.write().tracking = None;
        }
    }
    meta.key = new_key;
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("service", &self.shared.config.endpoint.service_name)
            .field("transport", &self.shared.transport.name())
            .field("tracked", &self.tracked_count())
            .field("saving", &self.is_saving())
            .finish()
    }
}
