//! Filter predicates.
//!
//! A predicate is rendered into an OData `$filter` expression for remote
//! queries and evaluated directly against cached values for local ones.

use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt::Write as _;

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
    /// Text contains.
    Contains,
    /// Text starts with.
    StartsWith,
    /// Text ends with.
    EndsWith,
}

impl FilterOp {
    fn keyword(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Ne => "ne",
            FilterOp::Lt => "lt",
            FilterOp::Le => "le",
            FilterOp::Gt => "gt",
            FilterOp::Ge => "ge",
            FilterOp::Contains => "substringof",
            FilterOp::StartsWith => "startswith",
            FilterOp::EndsWith => "endswith",
        }
    }
}

/// Boolean filter over entity properties.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Compares one property with a literal.
    Compare {
        /// Property name.
        property: String,
        /// Operator.
        op: FilterOp,
        /// Literal operand.
        value: Value,
    },
    /// All of the inner predicates hold.
    And(Vec<Predicate>),
    /// Any of the inner predicates holds.
    Or(Vec<Predicate>),
    /// The inner predicate does not hold.
    Not(Box<Predicate>),
}

/// A property reference used to build comparisons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyRef(String);

macro_rules! comparison {
    ($($(#[$doc:meta])* $name:ident => $op:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            pub fn $name(self, value: impl Into<Value>) -> Predicate {
                Predicate::Compare {
                    property: self.0,
                    op: FilterOp::$op,
                    value: value.into(),
                }
            }
        )*
    };
}

impl PropertyRef {
    comparison! {
        /// `property == value`.
        eq => Eq,
        /// `property != value`.
        ne => Ne,
        /// `property < value`.
        lt => Lt,
        /// `property <= value`.
        le => Le,
        /// `property > value`.
        gt => Gt,
        /// `property >= value`.
        ge => Ge,
        /// Text property contains `value`.
        contains => Contains,
        /// Text property starts with `value`.
        starts_with => StartsWith,
        /// Text property ends with `value`.
        ends_with => EndsWith,
    }
}

impl Predicate {
    /// Starts a comparison on `name`.
    pub fn property(name: impl Into<String>) -> PropertyRef {
        PropertyRef(name.into())
    }

    /// Combines with `other` so both must hold.
    pub fn and(self, other: Predicate) -> Predicate {
        match self {
            Predicate::And(mut parts) => {
                parts.push(other);
                Predicate::And(parts)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    /// Combines with `other` so either may hold.
    pub fn or(self, other: Predicate) -> Predicate {
        match self {
            Predicate::Or(mut parts) => {
                parts.push(other);
                Predicate::Or(parts)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    /// Renders the predicate as an OData filter expression.
    pub fn to_odata(&self) -> String {
        let mut out = String::new();
        self.write_odata(&mut out);
        out
    }

    fn write_odata(&self, out: &mut String) {
        match self {
            Predicate::Compare {
                property,
                op,
                value,
            } => match op {
                FilterOp::Contains => {
                    let _ = write!(out, "substringof({},{})", literal(value), property);
                }
                FilterOp::StartsWith | FilterOp::EndsWith => {
                    let _ = write!(out, "{}({},{})", op.keyword(), property, literal(value));
                }
                _ => {
                    let _ = write!(out, "{} {} {}", property, op.keyword(), literal(value));
                }
            },
            Predicate::And(parts) => join(out, parts, " and "),
            Predicate::Or(parts) => join(out, parts, " or "),
            Predicate::Not(inner) => {
                out.push_str("not (");
                inner.write_odata(out);
                out.push(')');
            }
        }
    }

    /// Evaluates the predicate against a record. Missing properties read
    /// as null.
    pub fn matches(&self, values: &Map<String, Value>) -> bool {
        match self {
            Predicate::Compare {
                property,
                op,
                value,
            } => {
                let actual = values.get(property).unwrap_or(&Value::Null);
                compare(actual, *op, value)
            }
            Predicate::And(parts) => parts.iter().all(|p| p.matches(values)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(values)),
            Predicate::Not(inner) => !inner.matches(values),
        }
    }
}

impl std::ops::Not for Predicate {
    type Output = Predicate;

    fn not(self) -> Predicate {
        Predicate::Not(Box::new(self))
    }
}

fn join(out: &mut String, parts: &[Predicate], separator: &str) {
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push_str(separator);
        }
        out.push('(');
        part.write_odata(out);
        out.push(')');
    }
}

fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => other.to_string(),
    }
}

/// Orders two JSON values of the same kind. Numbers compare numerically,
/// text lexicographically, booleans false-first; null sorts first.
pub(crate) fn order_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn compare(actual: &Value, op: FilterOp, expected: &Value) -> bool {
    match op {
        FilterOp::Eq => values_equal(actual, expected),
        FilterOp::Ne => !values_equal(actual, expected),
        FilterOp::Lt | FilterOp::Le | FilterOp::Gt | FilterOp::Ge => {
            if actual.is_null() || expected.is_null() {
                return false;
            }
            match order_values(actual, expected) {
                Some(ordering) => match op {
                    FilterOp::Lt => ordering == Ordering::Less,
                    FilterOp::Le => ordering != Ordering::Greater,
                    FilterOp::Gt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                },
                None => false,
            }
        }
        FilterOp::Contains | FilterOp::StartsWith | FilterOp::EndsWith => {
            match (actual.as_str(), expected.as_str()) {
                (Some(text), Some(needle)) => match op {
                    FilterOp::Contains => text.contains(needle),
                    FilterOp::StartsWith => text.starts_with(needle),
                    _ => text.ends_with(needle),
                },
                _ => false,
            }
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn renders_comparisons() {
        assert_eq!(Predicate::property("Id").eq(3).to_odata(), "Id eq 3");
        assert_eq!(
            Predicate::property("Title").ne("it's").to_odata(),
            "Title ne 'it''s'"
        );
        assert_eq!(
            Predicate::property("Title").contains("milk").to_odata(),
            "substringof('milk',Title)"
        );
        assert_eq!(
            Predicate::property("Title").starts_with("Buy").to_odata(),
            "startswith(Title,'Buy')"
        );
    }

    #[test]
    fn renders_combinations() {
        let p = Predicate::property("IsDone")
            .eq(false)
            .and(Predicate::property("Priority").ge(2))
            .and(!Predicate::property("Title").eq(Value::Null));
        assert_eq!(
            p.to_odata(),
            "(IsDone eq false) and (Priority ge 2) and (not (Title eq null))"
        );

        let p = Predicate::property("A").eq(1).or(Predicate::property("B").eq(2));
        assert_eq!(p.to_odata(), "(A eq 1) or (B eq 2)");
    }

    #[test]
    fn evaluates_against_records() {
        let todo = record(json!({"Id": 1, "Title": "Buy milk", "IsDone": false, "Priority": 2}));

        assert!(Predicate::property("Id").eq(1.0).matches(&todo));
        assert!(Predicate::property("Priority").gt(1).matches(&todo));
        assert!(!Predicate::property("Priority").lt(2).matches(&todo));
        assert!(Predicate::property("Title").contains("milk").matches(&todo));
        assert!(Predicate::property("Title").ends_with("milk").matches(&todo));
        assert!(!Predicate::property("Title").gt(3).matches(&todo));
        assert!(Predicate::property("Missing").eq(Value::Null).matches(&todo));
        assert!(!Predicate::property("Missing").lt(3).matches(&todo));

        let p = Predicate::property("IsDone")
            .eq(true)
            .or(Predicate::property("Priority").ge(2));
        assert!(p.matches(&todo));
        assert!(!(!p).matches(&todo));
    }
}
