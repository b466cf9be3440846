//! ST-003: Tree utilities — coerce, pop-and-interpret, selective mapping.
//!
//! Every shorthand expander pops the keys it understands out of a mapping
//! with [`extract_key`] and passes whatever remains through untouched.

use super::error::Result;
use super::types::{Mapping, Node};
use serde_json::Value;

/// Coerce any node to a mapping. Non-mappings become empty; null entries are dropped.
pub fn as_mapping(node: &Node) -> Mapping {
    match node {
        Value::Object(map) => map
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        _ => Mapping::new(),
    }
}

/// Owned variant of [`as_mapping`].
pub fn into_mapping(node: Node) -> Mapping {
    match node {
        Value::Object(map) => map.into_iter().filter(|(_, v)| !v.is_null()).collect(),
        _ => Mapping::new(),
    }
}

/// Remove `key` from `map`, running `on_present` on its value.
///
/// When the key is absent and `default` is supplied, `on_present` runs on the
/// default instead. The remaining mapping is returned otherwise unchanged.
pub fn extract_key<F>(mut map: Mapping, key: &str, default: Option<Node>, on_present: F) -> Result<Mapping>
where
    F: FnOnce(Node) -> Result<()>,
{
    if let Some(value) = map.shift_remove(key).or(default) {
        on_present(value)?;
    }
    Ok(map)
}

/// Remove `key` from `map` and return it alongside the rest.
pub fn take_key(mut map: Mapping, key: &str) -> (Option<Node>, Mapping) {
    let value = map.shift_remove(key);
    (value, map)
}

/// Apply `handler` to the values of the selected `keys` only.
pub fn map_keys<F>(mut map: Mapping, keys: &[&str], mut handler: F) -> Result<Mapping>
where
    F: FnMut(&str, Node) -> Result<Node>,
{
    for key in keys {
        if let Some(slot) = map.get_mut(*key) {
            let value = std::mem::take(slot);
            *slot = handler(key, value)?;
        }
    }
    Ok(map)
}

/// Read a string-valued node, if it is one.
pub fn as_str(node: &Node) -> Option<&str> {
    match node {
        Value::String(s) => Some(s.as_str()),
        _ => None,
    }
}
