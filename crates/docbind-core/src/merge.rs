//! Deep merge of two field mappings.
//!
//! For every key of `incoming`:
//!  - sequence on both sides: `base[key] ++ incoming[key]` (no deduplication)
//!  - mapping in `incoming`: recursive merge, an absent or non-mapping base counts as empty
//!  - anything else: `incoming[key]` wins
//!
//! Keys only present in `base` are kept as they are.

use crate::document::Fields;
use serde_json::Value;

/// Merge `incoming` into `base`, producing a new mapping.
pub fn merge(base: &Fields, incoming: &Fields) -> Fields {
    let mut merged = base.clone();

    for (key, value) in incoming {
        let combined = match (base.get(key), value) {
            (Some(Value::Array(left)), Value::Array(right)) => {
                let mut items = Vec::with_capacity(left.len() + right.len());
                items.extend(left.iter().cloned());
                items.extend(right.iter().cloned());
                Value::Array(items)
            }
            (existing, Value::Object(right)) => {
                let left = match existing {
                    Some(Value::Object(left)) => left.clone(),
                    _ => Fields::new(),
                };
                Value::Object(merge(&left, right))
            }
            (_, other) => other.clone(),
        };
        merged.insert(key.clone(), combined);
    }

    merged
}

/// Merge two arbitrary values with the same rules, mappings at the top level.
///
/// Returns `None` when either side is not a mapping.
pub fn merge_values(base: &Value, incoming: &Value) -> Option<Value> {
    match (base, incoming) {
        (Value::Object(left), Value::Object(right)) => Some(Value::Object(merge(left, right))),
        _ => None,
    }
}
