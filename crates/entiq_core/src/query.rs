//! Immutable query descriptions and their results.

use crate::entity::Entity;
use crate::predicate::Predicate;
use serde_json::Value;
use std::fmt;

/// Shape the caller expects the response body to have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResultShape {
    /// One entity, or none.
    SingleEntity,
    /// A list of entities.
    #[default]
    EntityArray,
    /// A list of untyped values (projections).
    AnonymousArray,
    /// A results envelope carrying an inline count.
    InlineCountEnvelope,
}

impl fmt::Display for ResultShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultShape::SingleEntity => "single entity",
            ResultShape::EntityArray => "entity array",
            ResultShape::AnonymousArray => "anonymous array",
            ResultShape::InlineCountEnvelope => "inline count envelope",
        };
        f.write_str(name)
    }
}

/// How query results are merged into entities that are already tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MergeStrategy {
    /// Server values replace local ones, pending changes included.
    #[default]
    OverwriteChanges,
    /// Entities with pending changes are left untouched.
    PreserveChanges,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortDirection {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// One ordering clause.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderBy {
    /// Property to sort by.
    pub property: String,
    /// Direction.
    pub direction: SortDirection,
}

/// Immutable description of a fetch.
///
/// Builder methods return a modified copy; the receiver is never changed.
///
/// ```
/// use entiq_core::{EntityQuery, Predicate};
///
/// let open = EntityQuery::from("Todos").with_filter(Predicate::property("IsDone").eq(false));
/// let page = open.order_by("Title").with_paging(0, 10);
/// assert_ne!(open, page);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct EntityQuery {
    resource_name: String,
    filter: Option<Predicate>,
    order_by: Vec<OrderBy>,
    skip: Option<u64>,
    take: Option<u64>,
    shape: ResultShape,
    entity_type: Option<String>,
    merge_strategy: Option<MergeStrategy>,
    parameters: Vec<(String, String)>,
}

impl EntityQuery {
    /// Creates a query for the given resource.
    pub fn from(resource_name: impl Into<String>) -> Self {
        Self {
            resource_name: resource_name.into(),
            filter: None,
            order_by: Vec::new(),
            skip: None,
            take: None,
            shape: ResultShape::default(),
            entity_type: None,
            merge_strategy: None,
            parameters: Vec::new(),
        }
    }

    /// Adds a filter. An existing filter is combined with `and`.
    pub fn with_filter(&self, predicate: Predicate) -> Self {
        let mut next = self.clone();
        next.filter = Some(match next.filter.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        next
    }

    /// Appends an ordering clause.
    pub fn with_ordering(&self, property: impl Into<String>, direction: SortDirection) -> Self {
        let mut next = self.clone();
        next.order_by.push(OrderBy {
            property: property.into(),
            direction,
        });
        next
    }

    /// Appends an ascending ordering clause.
    pub fn order_by(&self, property: impl Into<String>) -> Self {
        self.with_ordering(property, SortDirection::Ascending)
    }

    /// Appends a descending ordering clause.
    pub fn order_by_desc(&self, property: impl Into<String>) -> Self {
        self.with_ordering(property, SortDirection::Descending)
    }

    /// Sets both skip and take.
    pub fn with_paging(&self, skip: u64, take: u64) -> Self {
        let mut next = self.clone();
        next.skip = Some(skip);
        next.take = Some(take);
        next
    }

    /// Skips the first `count` results.
    pub fn skip(&self, count: u64) -> Self {
        let mut next = self.clone();
        next.skip = Some(count);
        next
    }

    /// Limits the number of results.
    pub fn take(&self, count: u64) -> Self {
        let mut next = self.clone();
        next.take = Some(count);
        next
    }

    /// Asks the service for the total count alongside the page.
    pub fn with_inline_count(&self) -> Self {
        self.expecting(ResultShape::InlineCountEnvelope)
    }

    /// Sets the expected result shape.
    pub fn expecting(&self, shape: ResultShape) -> Self {
        let mut next = self.clone();
        next.shape = shape;
        next
    }

    /// Declares the entity type of untagged results.
    pub fn to_type(&self, entity_type: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.entity_type = Some(entity_type.into());
        next
    }

    /// Overrides the session's merge strategy for this query.
    pub fn with_merge_strategy(&self, strategy: MergeStrategy) -> Self {
        let mut next = self.clone();
        next.merge_strategy = Some(strategy);
        next
    }

    /// Adds a custom query-string parameter.
    pub fn with_parameter(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.parameters.push((name.into(), value.into()));
        next
    }

    /// Returns the resource name.
    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    /// Returns the filter.
    pub fn filter(&self) -> Option<&Predicate> {
        self.filter.as_ref()
    }

    /// Returns the ordering clauses.
    pub fn ordering(&self) -> &[OrderBy] {
        &self.order_by
    }

    /// Returns the skip count.
    pub fn skip_count(&self) -> Option<u64> {
        self.skip
    }

    /// Returns the take count.
    pub fn take_count(&self) -> Option<u64> {
        self.take
    }

    /// Returns the expected result shape.
    pub fn shape(&self) -> ResultShape {
        self.shape
    }

    /// Returns the declared entity type.
    pub fn entity_type(&self) -> Option<&str> {
        self.entity_type.as_deref()
    }

    /// Returns the merge strategy override.
    pub fn merge_strategy(&self) -> Option<MergeStrategy> {
        self.merge_strategy
    }

    /// Renders the resource with its query string.
    ///
    /// Parameters appear in a fixed order: `$filter`, `$orderby`, `$skip`,
    /// `$top`, `$inlinecount`, then custom parameters as added.
    pub fn resource_path(&self) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        let mut any = false;

        if let Some(filter) = &self.filter {
            query.append_pair("$filter", &filter.to_odata());
            any = true;
        }
        if !self.order_by.is_empty() {
            let clauses: Vec<String> = self
                .order_by
                .iter()
                .map(|o| match o.direction {
                    SortDirection::Ascending => o.property.clone(),
                    SortDirection::Descending => format!("{} desc", o.property),
                })
                .collect();
            query.append_pair("$orderby", &clauses.join(","));
            any = true;
        }
        if let Some(skip) = self.skip {
            query.append_pair("$skip", &skip.to_string());
            any = true;
        }
        if let Some(take) = self.take {
            query.append_pair("$top", &take.to_string());
            any = true;
        }
        if self.shape == ResultShape::InlineCountEnvelope {
            query.append_pair("$inlinecount", "allpages");
            any = true;
        }
        for (name, value) in &self.parameters {
            query.append_pair(name, value);
            any = true;
        }

        if any {
            format!("{}?{}", self.resource_name, query.finish())
        } else {
            self.resource_name.clone()
        }
    }
}

/// One query result: a tracked entity or a plain value.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryItem {
    /// A tracked entity.
    Entity(Entity),
    /// An untyped value.
    Value(Value),
}

impl QueryItem {
    /// Returns the entity, if this is one.
    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            QueryItem::Entity(e) => Some(e),
            QueryItem::Value(_) => None,
        }
    }

    /// Returns the value, if this is one.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            QueryItem::Value(v) => Some(v),
            QueryItem::Entity(_) => None,
        }
    }

    /// Returns true for tracked entities.
    pub fn is_entity(&self) -> bool {
        matches!(self, QueryItem::Entity(_))
    }
}

/// Result of [`Session::execute_query`](crate::Session::execute_query).
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Results in response order.
    pub results: Vec<QueryItem>,
    /// Total count reported by the service.
    pub inline_count: Option<u64>,
}

impl QueryResult {
    /// Returns the number of results.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Returns true if there are no results.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Returns the tracked entities among the results.
    pub fn entities(&self) -> Vec<Entity> {
        self.results
            .iter()
            .filter_map(|r| r.as_entity().cloned())
            .collect()
    }

    /// Returns the untyped values among the results.
    pub fn values(&self) -> Vec<Value> {
        self.results
            .iter()
            .filter_map(|r| r.as_value().cloned())
            .collect()
    }
}
