//! # Blend Rules
//!
//! How incoming content merges with a contact's current content.
//!
//! | mode           | accepts        | result                                   |
//! |----------------|----------------|------------------------------------------|
//! | `accept-last`  | anything       | incoming replaces current                |
//! | `max` / `min`  | numbers        | larger / smaller wins, regressions reject |
//! | `set-union`    | arrays, scalars| union in first-seen order                |
//! | `boolean-or`   | booleans       | logical or                               |
//! | `object-merge` | objects        | shallow merge, incoming keys win         |
//!
//! A write the rule cannot accept is a contradiction: the current content is
//! kept and the caller records the reason.

use crate::types::BlendMode;
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

/// Result of blending one incoming value into a contact.
#[derive(Debug, Clone, PartialEq)]
pub enum BlendOutcome {
    /// The contact takes this new content.
    Changed(Value),
    /// The merged content equals the current content.
    Unchanged,
    /// The write conflicts with the rule; content is kept.
    Contradiction(String),
}

impl BlendMode {
    /// Merge `incoming` into `current` according to this mode.
    #[must_use]
    pub fn blend(self, current: Option<&Value>, incoming: &Value) -> BlendOutcome {
        match self {
            Self::AcceptLast => accept_last(current, incoming),
            Self::Max => monotonic(current, incoming, Ordering::Greater, "max"),
            Self::Min => monotonic(current, incoming, Ordering::Less, "min"),
            Self::SetUnion => set_union(current, incoming),
            Self::BooleanOr => boolean_or(current, incoming),
            Self::ObjectMerge => object_merge(current, incoming),
        }
    }
}

fn accept_last(current: Option<&Value>, incoming: &Value) -> BlendOutcome {
    if current == Some(incoming) {
        BlendOutcome::Unchanged
    } else {
        BlendOutcome::Changed(incoming.clone())
    }
}

/// Order two JSON numbers without losing integer precision.
fn compare_numbers(a: &Number, b: &Number) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return Some(x.cmp(&y));
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return Some(x.cmp(&y));
    }
    a.as_f64()?.partial_cmp(&b.as_f64()?)
}

/// `max` (`wins == Greater`) and `min` (`wins == Less`).
fn monotonic(
    current: Option<&Value>,
    incoming: &Value,
    wins: Ordering,
    name: &str,
) -> BlendOutcome {
    let Value::Number(next) = incoming else {
        return BlendOutcome::Contradiction(format!(
            "{} expects a number, got {}",
            name,
            kind_of(incoming)
        ));
    };
    let Some(Value::Number(held)) = current else {
        return BlendOutcome::Changed(incoming.clone());
    };
    match compare_numbers(next, held) {
        Some(Ordering::Equal) => BlendOutcome::Unchanged,
        Some(order) if order == wins => BlendOutcome::Changed(incoming.clone()),
        Some(_) => BlendOutcome::Contradiction(format!(
            "{} rejected regressing value {} (holding {})",
            name, next, held
        )),
        None => BlendOutcome::Contradiction(format!("{} cannot order {} and {}", name, next, held)),
    }
}

fn set_union(current: Option<&Value>, incoming: &Value) -> BlendOutcome {
    let mut merged: Vec<Value> = match current {
        None => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
    };
    let before = merged.len();
    let additions: &[Value] = match incoming {
        Value::Array(items) => items,
        other => std::slice::from_ref(other),
    };
    for item in additions {
        if !merged.contains(item) {
            merged.push(item.clone());
        }
    }
    // A scalar becoming a one-element set is still a change of shape.
    let reshaped = !matches!(current, None | Some(Value::Array(_)));
    if merged.len() == before && !reshaped && current.is_some() {
        BlendOutcome::Unchanged
    } else {
        BlendOutcome::Changed(Value::Array(merged))
    }
}

fn boolean_or(current: Option<&Value>, incoming: &Value) -> BlendOutcome {
    let Value::Bool(next) = incoming else {
        return BlendOutcome::Contradiction(format!(
            "boolean-or expects a boolean, got {}",
            kind_of(incoming)
        ));
    };
    match current {
        Some(Value::Bool(held)) if *held || !*next => BlendOutcome::Unchanged,
        _ => BlendOutcome::Changed(Value::Bool(*next)),
    }
}

fn object_merge(current: Option<&Value>, incoming: &Value) -> BlendOutcome {
    let Value::Object(fields) = incoming else {
        return BlendOutcome::Contradiction(format!(
            "object-merge expects an object, got {}",
            kind_of(incoming)
        ));
    };
    let mut merged: Map<String, Value> = match current {
        Some(Value::Object(held)) => held.clone(),
        _ => Map::new(),
    };
    for (key, value) in fields {
        merged.insert(key.clone(), value.clone());
    }
    let merged = Value::Object(merged);
    if current == Some(&merged) {
        BlendOutcome::Unchanged
    } else {
        BlendOutcome::Changed(merged)
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// TESTS
// =============================================================================
