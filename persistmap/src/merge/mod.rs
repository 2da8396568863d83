//! In-place deep merge of a freshly parsed document into the live mirror.
//!
//! Containers already present in the target are updated through `&mut`
//! rather than replaced, so a slot keeps its container as long as the source
//! holds a container of the same kind there.

use serde_json::{Map, Value};

/// Make `target` structurally equal to `source`, reusing its containers.
pub fn merge(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(t), Value::Object(s)) => merge_object(t, s),
        (Value::Array(t), Value::Array(s)) => merge_array(t, s),
        (slot, source) => *slot = fresh(source),
    }
}

/// Root-level merge: the document root is always an object.
pub fn merge_object(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    target.retain(|key, _| source.contains_key(key));

    for (key, value) in source {
        match target.get_mut(key) {
            Some(slot) => merge(slot, value),
            None => {
                target.insert(key.clone(), fresh(value));
            }
        }
    }
}

/// Arrays merge index by index. Trailing indices the source no longer has are
/// dropped, new ones are appended.
fn merge_array(target: &mut Vec<Value>, source: &[Value]) {
    target.truncate(source.len());

    for (slot, value) in target.iter_mut().zip(source) {
        merge(slot, value);
    }
    let existing = target.len();
    target.extend(source[existing..].iter().map(fresh));
}

/// A container of the source's kind, filled by merging into an empty one;
/// scalars are copied.
fn fresh(source: &Value) -> Value {
    match source {
        Value::Object(s) => {
            let mut map = Map::new();
            merge_object(&mut map, s);
            Value::Object(map)
        }
        Value::Array(s) => {
            let mut items = Vec::with_capacity(s.len());
            merge_array(&mut items, s);
            Value::Array(items)
        }
        scalar => scalar.clone(),
    }
}
