// src/context/merge.rs
// The one merge rule used everywhere: per-key replacement, except that when
// both sides hold a mapping the nested keys merge one level deep. Anything
// deeper is replaced wholesale.

use serde_json::Value;

use crate::context::types::JsonMap;

/// Merge `overlay` into `base` in place. Overlay keys win on conflict; when
/// both values are objects their keys merge one level deep.
pub fn merge_into(base: &mut JsonMap, overlay: &JsonMap) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                for (nested_key, nested_value) in incoming {
                    existing.insert(nested_key.clone(), nested_value.clone());
                }
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Merge an ordered chain of data mappings, root first. Later entries win.
pub fn merge_chain<'a, I>(chain: I) -> JsonMap
where
    I: IntoIterator<Item = &'a JsonMap>,
{
    let mut merged = JsonMap::new();
    for data in chain {
        merge_into(&mut merged, data);
    }
    merged
}
