//! Recursive merge of model settings

use serde_yaml::{Mapping, Value};

/// Merge `overlay` over `base`.
///
/// Nested mappings merge key by key; any other overlay value replaces the
/// base value unless it is null.
pub fn merge(base: &Mapping, overlay: &Mapping) -> Mapping {
    let mut merged = base.clone();

    for (key, value) in overlay {
        match (merged.get_mut(key), value) {
            (Some(Value::Mapping(inner)), Value::Mapping(over)) => {
                *inner = merge(inner, over);
            }
            (_, Value::Null) => {}
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }

    merged
}
