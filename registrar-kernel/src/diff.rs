//! Top-level attribute diffing used by every registry merge.
//!
//! Merges are upserts: a field missing from the incoming set is left alone,
//! never removed. Nested values are compared with deep equality.

use crate::models::FieldSet;

/// Names of the fields of `new` whose value is absent from, or different in, `old`.
pub fn diff(old: &FieldSet, new: &FieldSet) -> Vec<String> {
    let mut changed: Vec<String> = new
        .iter()
        .filter(|(key, value)| old.get(key.as_str()) != Some(value))
        .map(|(key, _)| key.clone())
        .collect();
    changed.sort();
    changed
}

/// Overwrites the changed fields of `current` with the incoming values and
/// returns their names.
pub fn merge_into(current: &mut FieldSet, incoming: FieldSet) -> Vec<String> {
    let changed = diff(current, &incoming);
    for (key, value) in incoming {
        if changed.contains(&key) {
            current.insert(key, value);
        }
    }
    changed
}
