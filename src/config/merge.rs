//! Configuration merge logic
//!
//! Merge semantics:
//! - Objects: deep-merge by key
//! - Arrays: UNION (base order kept, new items appended once)
//! - Scalars: override (last wins)
//!
//! Every array-valued option is an omission or dependency list, and a later
//! layer only ever adds to those.

use serde_json::Value;

/// Deep merge two JSON values.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        // Both objects: deep merge
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = if let Some(base_value) = base_map.remove(&key) {
                    deep_merge(base_value, overlay_value)
                } else {
                    overlay_value
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }

        // Arrays: union, first occurrence wins the position
        (Value::Array(mut base_items), Value::Array(overlay_items)) => {
            for item in overlay_items {
                if !base_items.contains(&item) {
                    base_items.push(item);
                }
            }
            Value::Array(base_items)
        }

        // Scalars and any other case: overlay wins
        (_, overlay) => overlay,
    }
}

/// Merge multiple config layers in order (first is base, last has highest precedence)
pub fn merge_layers(layers: Vec<Value>) -> Value {
    layers.into_iter().fold(Value::Null, deep_merge)
}
