//! Query-filter matching for the in-memory collections.
//!
//! Supports field equality and the comparison operators `$eq`, `$ne`, `$gt`,
//! `$gte`, `$lt`, `$lte`, `$in` and `$nin` on top-level fields.

use std::cmp::Ordering;

use storelane_core::Value;

/// Whether `doc` satisfies `filter`. A null or empty filter matches everything.
pub(crate) fn matches(doc: &Value, filter: &Value) -> bool {
    let Some(conditions) = filter.as_map() else {
        return filter.is_null();
    };
    conditions.iter().all(|(field, condition)| {
        let actual = doc.get(field);
        match operator_map(condition) {
            Some(operators) => operators
                .iter()
                .all(|(op, expected)| apply(op, actual, expected)),
            None => actual == Some(condition),
        }
    })
}

/// Returns the operator document when every key starts with `$`.
fn operator_map(condition: &Value) -> Option<Vec<(&str, &Value)>> {
    let fields = condition.as_map()?;
    if fields.is_empty() || !fields.keys().all(|k| k.starts_with('$')) {
        return None;
    }
    Some(fields.iter().map(|(k, v)| (k.as_str(), v)).collect())
}

fn apply(op: &str, actual: Option<&Value>, expected: &Value) -> bool {
    match op {
        "$eq" => actual == Some(expected),
        "$ne" => actual != Some(expected),
        "$gt" => compare(actual, expected) == Some(Ordering::Greater),
        "$gte" => matches!(compare(actual, expected), Some(Ordering::Greater | Ordering::Equal)),
        "$lt" => compare(actual, expected) == Some(Ordering::Less),
        "$lte" => matches!(compare(actual, expected), Some(Ordering::Less | Ordering::Equal)),
        "$in" => expected
            .as_array()
            .is_some_and(|options| actual.is_some_and(|a| options.contains(a))),
        "$nin" => expected
            .as_array()
            .is_some_and(|options| actual.map_or(true, |a| !options.contains(a))),
        _ => false,
    }
}

#[allow(clippy::cast_precision_loss)]
fn compare(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    match (actual?, expected) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
        (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
