//! Immutable state patching.
//!
//! Reducers return patches rather than whole states; [`merge`] folds a patch
//! into the previous state without touching either input.

use serde_json::Value;

/// Apply `patch` on top of `original`, returning a new value.
///
/// - Two objects merge key by key, recursively. Keys absent from the patch
///   keep their original value.
/// - Anything else (arrays, scalars, `null`, mismatched kinds) is replaced by
///   the patch outright; an array patch never merges element-wise.
///
/// Neither input is modified and the result shares no storage with
/// `patch`.
///
/// # Examples
///
/// ```
/// use entity_store::merge::merge;
/// use serde_json::json;
///
/// let state = json!({"name": "a", "tags": [1, 2], "inner": {"x": 1, "y": 2}});
/// let next = merge(&state, &json!({"tags": [3], "inner": {"y": 5}}));
///
/// assert_eq!(next, json!({"name": "a", "tags": [3], "inner": {"x": 1, "y": 5}}));
/// ```
pub fn merge(original: &Value, patch: &Value) -> Value {
    match (original, patch) {
        (Value::Object(base), Value::Object(changes)) => {
            let mut merged = base.clone();
            for (key, change) in changes {
                let next = match base.get(key) {
                    Some(current) => merge(current, change),
                    None => change.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, replacement) => replacement.clone(),
    }
}

/// Apply several patches in order.
///
/// Equivalent to folding [`merge`] over `patches`, starting from `original`.
pub fn merge_all<'a, I>(original: &Value, patches: I) -> Value
where
    I: IntoIterator<Item = &'a Value>,
{
    patches
        .into_iter()
        .fold(original.clone(), |state, patch| merge(&state, patch))
}
