//! In-process fake data service.
//!
//! Answers requests the way a JSON data controller does:
//! - `GET <resource>` returns the rows of the table serving that resource,
//!   each tagged with a namespace-qualified `$type`, honoring `$filter`,
//!   `$orderby`, `$skip`, `$top` and `$inlinecount`
//! - `POST <save resource>` applies a save bundle in one step and answers
//!   with the saved entities and the key mappings of identity keys
//!
//! Tables have a single integer key. A validation hook can reject saves
//! with `403` entity errors, and canned failures can be queued for the
//! next requests.
//!
//! Serve it to a session through [`entiq_transport::LoopbackClient`].

use entiq_core::{normalize_type_name, EntityType, KeyGeneration, Predicate};
use entiq_transport::{
    LoopbackServer, Method, RawResponse, RequestDescriptor, DEFAULT_SAVE_RESOURCE,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};

/// A rejection produced by a validation hook.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationFailure {
    /// Offending property, if any.
    pub property: Option<String>,
    /// Message reported to the client.
    pub message: String,
}

impl ValidationFailure {
    /// Creates an entity-level failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            property: None,
            message: message.into(),
        }
    }

    /// Creates a failure for one property.
    pub fn on(property: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            property: Some(property.into()),
            message: message.into(),
        }
    }
}

type Validator =
    Box<dyn Fn(&str, &Map<String, Value>) -> Option<ValidationFailure> + Send + Sync>;

struct Table {
    entity_type: EntityType,
    key_property: String,
    rows: BTreeMap<i64, Map<String, Value>>,
    next_id: i64,
}

impl Table {
    fn new(entity_type: EntityType) -> Self {
        let key_property = entity_type
            .key_properties()
            .first()
            .cloned()
            .unwrap_or_else(|| "Id".to_string());
        Self {
            entity_type,
            key_property,
            rows: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn identity(&self) -> bool {
        self.entity_type.key_generation() == KeyGeneration::Identity
    }

    fn key_of(&self, values: &Map<String, Value>) -> Option<i64> {
        values.get(&self.key_property).and_then(Value::as_i64)
    }

    fn insert(&mut self, key: i64, values: Map<String, Value>) {
        self.next_id = self.next_id.max(key + 1);
        self.rows.insert(key, values);
    }
}

#[derive(Default)]
struct ServiceState {
    tables: Vec<Table>,
    failures: VecDeque<RawResponse>,
    requests: usize,
    saves: usize,
}

impl ServiceState {
    fn table(&self, type_name: &str) -> Option<&Table> {
        self.tables
            .iter()
            .find(|t| t.entity_type.name() == type_name)
    }

    fn table_mut(&mut self, type_name: &str) -> Option<&mut Table> {
        self.tables
            .iter_mut()
            .find(|t| t.entity_type.name() == type_name)
    }
}

/// An error answer.
struct Fault {
    status: u16,
    body: Value,
}

impl Fault {
    fn message(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "Message": message.into() }),
        }
    }
}

/// A decoded entry of a save bundle.
struct Change {
    type_name: String,
    state: String,
    key: Option<i64>,
    values: Map<String, Value>,
}

#[derive(Default)]
struct QueryOptions {
    filter: Option<Predicate>,
    order: Vec<(String, bool)>,
    skip: usize,
    top: Option<usize>,
    inline_count: bool,
}

/// An in-memory data service.
pub struct FakeService {
    namespace: String,
    save_resource: String,
    state: Mutex<ServiceState>,
    validator: RwLock<Option<Validator>>,
}

impl FakeService {
    /// Creates a service whose type tags use `namespace`.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            save_resource: DEFAULT_SAVE_RESOURCE.to_string(),
            state: Mutex::new(ServiceState::default()),
            validator: RwLock::new(None),
        }
    }

    /// Adds a table for an entity type, served at the type's resources.
    pub fn with_entity_type(self, entity_type: EntityType) -> Self {
        self.state.lock().tables.push(Table::new(entity_type));
        self
    }

    /// Sets the resource accepting save bundles.
    pub fn with_save_resource(mut self, resource: impl Into<String>) -> Self {
        self.save_resource = resource.into();
        self
    }

    /// Installs a validation hook run on every added or modified entity.
    pub fn with_validator<F>(self, validator: F) -> Self
    where
        F: Fn(&str, &Map<String, Value>) -> Option<ValidationFailure> + Send + Sync + 'static,
    {
        self.set_validator(validator);
        self
    }

    /// Replaces the validation hook.
    pub fn set_validator<F>(&self, validator: F)
    where
        F: Fn(&str, &Map<String, Value>) -> Option<ValidationFailure> + Send + Sync + 'static,
    {
        *self.validator.write() = Some(Box::new(validator));
    }

    /// Removes the validation hook.
    pub fn clear_validator(&self) {
        *self.validator.write() = None;
    }

    /// Returns the entity types the service knows.
    pub fn entity_types(&self) -> Vec<EntityType> {
        self.state
            .lock()
            .tables
            .iter()
            .map(|t| t.entity_type.clone())
            .collect()
    }

    /// Inserts rows into the table of `type_name`. Rows without an integer
    /// key are skipped. Returns the number inserted.
    pub fn seed<I>(&self, type_name: &str, rows: I) -> usize
    where
        I: IntoIterator<Item = Value>,
    {
        let mut state = self.state.lock();
        let Some(table) = state.table_mut(type_name) else {
            return 0;
        };
        let mut inserted = 0;
        for row in rows {
            let Value::Object(values) = row else {
                continue;
            };
            if let Some(key) = table.key_of(&values) {
                table.insert(key, values);
                inserted += 1;
            }
        }
        inserted
    }

    /// Changes a stored value, as another client would.
    pub fn update_row(&self, type_name: &str, id: i64, property: &str, value: Value) -> bool {
        let mut state = self.state.lock();
        match state
            .table_mut(type_name)
            .and_then(|t| t.rows.get_mut(&id))
        {
            Some(row) => {
                row.insert(property.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Deletes a stored row, as another client would.
    pub fn remove_row(&self, type_name: &str, id: i64) -> bool {
        self.state
            .lock()
            .table_mut(type_name)
            .is_some_and(|t| t.rows.remove(&id).is_some())
    }

    /// Returns the stored rows of `type_name`, in key order.
    pub fn rows(&self, type_name: &str) -> Vec<Map<String, Value>> {
        self.state
            .lock()
            .table(type_name)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns one stored row.
    pub fn row(&self, type_name: &str, id: i64) -> Option<Map<String, Value>> {
        self.state
            .lock()
            .table(type_name)
            .and_then(|t| t.rows.get(&id).cloned())
    }

    /// Answers the next request with `response` instead of handling it.
    pub fn fail_next(&self, response: RawResponse) {
        self.state.lock().failures.push_back(response);
    }

    /// Returns the number of requests received.
    pub fn request_count(&self) -> usize {
        self.state.lock().requests
    }

    /// Returns the number of save bundles received.
    pub fn save_count(&self) -> usize {
        self.state.lock().saves
    }

    /// Returns the `$type` tag for a short type name.
    pub fn type_tag(&self, type_name: &str) -> String {
        format!("{0}.{1}, {0}", self.namespace, type_name)
    }

    fn tagged(&self, type_name: &str, values: &Map<String, Value>) -> Value {
        let mut record = values.clone();
        record.insert("$type".to_string(), Value::String(self.type_tag(type_name)));
        Value::Object(record)
    }

    fn query(&self, state: &ServiceState, resource: &str) -> Result<Value, Fault> {
        let (name, query) = resource.split_once('?').unwrap_or((resource, ""));
        let table = state
            .tables
            .iter()
            .find(|t| t.entity_type.resources().iter().any(|r| r == name))
            .ok_or_else(|| Fault::message(404, format!("no resource named '{name}'")))?;
        let options = parse_options(query)?;

        let mut rows: Vec<&Map<String, Value>> = table
            .rows
            .values()
            .filter(|row| options.filter.as_ref().map_or(true, |f| f.matches(row)))
            .collect();
        if !options.order.is_empty() {
            rows.sort_by(|a, b| {
                for (property, descending) in &options.order {
                    let ordering = compare_values(a.get(property), b.get(property));
                    let ordering = if *descending {
                        ordering.reverse()
                    } else {
                        ordering
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }

        let count = rows.len();
        let type_name = table.entity_type.name();
        let page: Vec<Value> = rows
            .into_iter()
            .skip(options.skip)
            .take(options.top.unwrap_or(usize::MAX))
            .map(|row| self.tagged(type_name, row))
            .collect();
        tracing::trace!(resource = name, count, returned = page.len(), "fake query");

        Ok(if options.inline_count {
            json!({ "Results": page, "InlineCount": count })
        } else {
            Value::Array(page)
        })
    }

    fn save(&self, state: &mut ServiceState, request: &RequestDescriptor) -> Result<Value, Fault> {
        let bundle: Value = request
            .body_text()
            .and_then(|text| serde_json::from_str(text).ok())
            .ok_or_else(|| Fault::message(400, "save bundle is not JSON"))?;
        let entries = bundle
            .get("entities")
            .and_then(Value::as_array)
            .ok_or_else(|| Fault::message(400, "save bundle has no entities"))?;

        let mut changes = Vec::with_capacity(entries.len());
        let mut errors = Vec::new();
        for entry in entries {
            let change = decode_change(state, entry)?;
            if change.state != "Deleted" {
                if let Some(failure) = self.validate(&change) {
                    errors.push(json!({
                        "ErrorName": "ValidationError",
                        "EntityTypeName": self.type_tag(&change.type_name),
                        "KeyValues": [change.key],
                        "PropertyName": failure.property,
                        "ErrorMessage": failure.message,
                    }));
                }
            }
            changes.push(change);
        }
        if !errors.is_empty() {
            tracing::debug!(errors = errors.len(), "fake save rejected");
            return Err(Fault {
                status: 403,
                body: json!({ "Message": "Validation error", "EntityErrors": errors }),
            });
        }

        let mut saved = Vec::with_capacity(changes.len());
        let mut key_mappings = Vec::new();
        for Change {
            type_name,
            state: entity_state,
            key,
            mut values,
        } in changes
        {
            let Some(table) = state.table_mut(&type_name) else {
                continue;
            };
            match (entity_state.as_str(), key) {
                ("Deleted", Some(key)) => {
                    table.rows.remove(&key);
                }
                ("Added", key) => {
                    let real = match key {
                        Some(key) if !(table.identity() && key <= 0) => key,
                        temp => {
                            let real = table.next_id;
                            values.insert(table.key_property.clone(), Value::from(real));
                            key_mappings.push(json!({
                                "EntityTypeName": self.type_tag(&type_name),
                                "TempValue": temp,
                                "RealValue": real,
                            }));
                            real
                        }
                    };
                    table.insert(real, values.clone());
                }
                (_, Some(key)) => table.insert(key, values.clone()),
                (_, None) => continue,
            }
            saved.push(self.tagged(&type_name, &values));
        }
        tracing::debug!(
            saved = saved.len(),
            mappings = key_mappings.len(),
            "fake save applied"
        );

        Ok(json!({ "Entities": saved, "KeyMappings": key_mappings }))
    }

    fn validate(&self, change: &Change) -> Option<ValidationFailure> {
        self.validator
            .read()
            .as_ref()
            .and_then(|validate| validate(&change.type_name, &change.values))
    }
}

impl LoopbackServer for FakeService {
    fn handle(&self, request: &RequestDescriptor) -> RawResponse {
        let mut state = self.state.lock();
        state.requests += 1;
        if let Some(failure) = state.failures.pop_front() {
            return failure;
        }

        let outcome = match request.method {
            Method::Get => self.query(&state, &request.resource),
            Method::Post if request.resource_name() == self.save_resource => {
                state.saves += 1;
                self.save(&mut state, request)
            }
            Method::Post => Err(Fault::message(
                404,
                format!("no save resource named '{}'", request.resource_name()),
            )),
        };
        match outcome {
            Ok(body) => RawResponse::ok_json(&body),
            Err(fault) => RawResponse::json(fault.status, &fault.body),
        }
    }
}

impl std::fmt::Debug for FakeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FakeService")
            .field("namespace", &self.namespace)
            .field("tables", &state.tables.len())
            .field("requests", &state.requests)
            .finish()
    }
}

fn decode_change(state: &ServiceState, entry: &Value) -> Result<Change, Fault> {
    let mut values = entry
        .as_object()
        .cloned()
        .ok_or_else(|| Fault::message(400, "save entry is not an object"))?;
    let aspect = values
        .remove("entityAspect")
        .ok_or_else(|| Fault::message(400, "save entry has no entityAspect"))?;
    let type_name = normalize_type_name(
        aspect
            .get("entityTypeName")
            .and_then(Value::as_str)
            .unwrap_or_default(),
    );
    let entity_state = aspect
        .get("entityState")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let table = state
        .table(&type_name)
        .ok_or_else(|| Fault::message(400, format!("unknown entity type '{type_name}'")))?;
    let key = table.key_of(&values);
    match entity_state.as_str() {
        "Added" => {
            if key.is_none() && !table.identity() {
                return Err(Fault::message(400, format!("new {type_name} has no key")));
            }
            if let Some(key) = key.filter(|k| table.rows.contains_key(k)) {
                if !(table.identity() && key <= 0) {
                    return Err(Fault::message(
                        409,
                        format!("{type_name} {key} already exists"),
                    ));
                }
            }
        }
        "Modified" | "Deleted" => {
            if !key.is_some_and(|k| table.rows.contains_key(&k)) {
                return Err(Fault::message(
                    409,
                    format!("{type_name} {key:?} no longer exists"),
                ));
            }
        }
        other => {
            return Err(Fault::message(400, format!("unsupported entity state '{other}'")));
        }
    }

    Ok(Change {
        type_name,
        state: entity_state,
        key,
        values,
    })
}

fn parse_options(query: &str) -> Result<QueryOptions, Fault> {
    let mut options = QueryOptions::default();
    for (name, value) in form_urlencoded::parse(query.as_bytes()) {
        match name.as_ref() {
            "$filter" => {
                options.filter = Some(
                    parse_filter(&value)
                        .ok_or_else(|| Fault::message(400, format!("unsupported filter '{value}'")))?,
                );
            }
            "$orderby" => {
                options.order = value
                    .split(',')
                    .map(|clause| match clause.trim().split_once(' ') {
                        Some((property, direction)) => {
                            (property.to_string(), direction.eq_ignore_ascii_case("desc"))
                        }
                        None => (clause.trim().to_string(), false),
                    })
                    .collect();
            }
            "$skip" => options.skip = parse_count(&name, &value)?,
            "$top" => options.top = Some(parse_count(&name, &value)?),
            "$inlinecount" => options.inline_count = value == "allpages",
            _ => {}
        }
    }
    Ok(options)
}

fn parse_count(name: &str, value: &str) -> Result<usize, Fault> {
    value
        .parse()
        .map_err(|_| Fault::message(400, format!("{name} must be a count, got '{value}'")))
}

/// Parses the filter subset produced by [`Predicate::to_odata`].
pub fn parse_filter(text: &str) -> Option<Predicate> {
    let text = text.trim();
    if let Some(inner) = text.strip_prefix("not ") {
        let (group, rest) = split_group(inner.trim_start())?;
        if !rest.trim().is_empty() {
            return None;
        }
        return parse_filter(group).map(|p| !p);
    }
    if text.starts_with('(') {
        return parse_groups(text);
    }
    if let Some(args) = call_args(text, "substringof") {
        let (literal, property) = args.rsplit_once(',')?;
        return Some(Predicate::property(property.trim()).contains(parse_literal(literal)?));
    }
    if let Some(args) = call_args(text, "startswith") {
        let (property, literal) = args.split_once(',')?;
        return Some(Predicate::property(property.trim()).starts_with(parse_literal(literal)?));
    }
    if let Some(args) = call_args(text, "endswith") {
        let (property, literal) = args.split_once(',')?;
        return Some(Predicate::property(property.trim()).ends_with(parse_literal(literal)?));
    }

    let (property, rest) = text.split_once(' ')?;
    let (op, literal) = rest.split_once(' ')?;
    let value = parse_literal(literal)?;
    let property = Predicate::property(property);
    Some(match op {
        "eq" => property.eq(value),
        "ne" => property.ne(value),
        "lt" => property.lt(value),
        "le" => property.le(value),
        "gt" => property.gt(value),
        "ge" => property.ge(value),
        _ => return None,
    })
}

fn parse_groups(mut text: &str) -> Option<Predicate> {
    let mut parts = Vec::new();
    let mut connector: Option<&str> = None;
    loop {
        let (group, rest) = split_group(text)?;
        parts.push(parse_filter(group)?);
        let rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        let (word, next) = rest.split_once(' ')?;
        if !matches!(word, "and" | "or") || connector.is_some_and(|c| c != word) {
            return None;
        }
        connector = Some(word);
        text = next.trim_start();
    }
    match connector {
        None if parts.len() == 1 => parts.pop(),
        Some("and") => Some(Predicate::And(parts)),
        Some(_) => Some(Predicate::Or(parts)),
        None => None,
    }
}

/// Splits a leading parenthesized group from the rest of `text`.
fn split_group(text: &str) -> Option<(&str, &str)> {
    if !text.starts_with('(') {
        return None;
    }
    let mut depth = 0usize;
    let mut quoted = false;
    for (i, c) in text.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => {
                depth -= 1;
                if depth == 0 {
                    return Some((&text[1..i], &text[i + 1..]));
                }
            }
            _ => {}
        }
    }
    None
}

fn call_args<'a>(text: &'a str, function: &str) -> Option<&'a str> {
    text.strip_prefix(function)?
        .strip_prefix('(')?
        .strip_suffix(')')
}

fn parse_literal(text: &str) -> Option<Value> {
    let text = text.trim();
    if let Some(inner) = text
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
    {
        return Some(Value::String(inner.replace("''", "'")));
    }
    serde_json::from_str::<Value>(text)
        .ok()
        .filter(|v| !(v.is_array() || v.is_object() || v.is_string()))
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a.unwrap_or(&Value::Null), b.unwrap_or(&Value::Null)) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}
