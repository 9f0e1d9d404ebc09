//! Property-based test generators using proptest.

use entiq_core::{KeyValue, Predicate};
use proptest::prelude::*;
use serde_json::{json, Value};

/// A generated `Todo` row.
#[derive(Debug, Clone, PartialEq)]
pub struct TodoRow {
    /// Key.
    pub id: i64,
    /// Title.
    pub title: String,
    /// Completion flag.
    pub is_done: bool,
    /// Priority, 0 to 9.
    pub priority: i64,
}

impl TodoRow {
    /// Returns the row as stored by the service.
    pub fn to_json(&self) -> Value {
        json!({
            "Id": self.id,
            "Title": self.title,
            "IsDone": self.is_done,
            "Priority": self.priority,
        })
    }
}

/// Strategy for key values of every kind.
pub fn key_value_strategy() -> impl Strategy<Value = KeyValue> {
    prop_oneof![
        any::<i64>().prop_map(KeyValue::Int),
        "[a-zA-Z0-9-]{1,12}".prop_map(KeyValue::Text),
        any::<bool>().prop_map(KeyValue::Bool),
    ]
}

/// Strategy for short titles, quotes included.
pub fn title_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z' ]{1,8}").expect("Invalid regex")
}

/// Strategy for up to `max` todo rows with distinct positive keys.
pub fn todo_rows_strategy(max: usize) -> impl Strategy<Value = Vec<TodoRow>> {
    prop::collection::btree_map(1i64..1000, (title_strategy(), any::<bool>(), 0i64..10), 0..max)
        .prop_map(|rows| {
            rows.into_iter()
                .map(|(id, (title, is_done, priority))| TodoRow {
                    id,
                    title,
                    is_done,
                    priority,
                })
                .collect()
        })
}

/// Strategy for a single comparison over the todo columns.
pub fn comparison_strategy() -> impl Strategy<Value = Predicate> {
    prop_oneof![
        (0i64..10, 0usize..6).prop_map(|(n, op)| {
            let priority = Predicate::property("Priority");
            match op {
                0 => priority.eq(n),
                1 => priority.ne(n),
                2 => priority.lt(n),
                3 => priority.le(n),
                4 => priority.gt(n),
                _ => priority.ge(n),
            }
        }),
        any::<bool>().prop_map(|done| Predicate::property("IsDone").eq(done)),
        "[a-z']{1,2}".prop_map(|text| Predicate::property("Title").contains(text)),
        "[a-z]{1,2}".prop_map(|text| Predicate::property("Title").starts_with(text)),
    ]
}

/// Strategy for filters combining up to three comparisons.
pub fn filter_strategy() -> impl Strategy<Value = Predicate> {
    prop_oneof![
        comparison_strategy(),
        (comparison_strategy(), comparison_strategy()).prop_map(|(a, b)| a.and(b)),
        (comparison_strategy(), comparison_strategy()).prop_map(|(a, b)| a.or(b)),
        comparison_strategy().prop_map(|p| !p),
    ]
}

/// Strategy for `(row index, new title)` edits, indexes taken modulo the
/// row count.
pub fn edits_strategy() -> impl Strategy<Value = Vec<(usize, String)>> {
    prop::collection::vec((any::<usize>(), title_strategy()), 1..8)
}
