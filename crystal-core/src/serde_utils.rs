use serde_json::{Map, Value};

/// Shallow merge of `patch` into the JSON object `target`.
///
/// Keys present in `patch` replace the ones in `target`; everything else is kept.
pub fn merge_object(target: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        target.insert(key, value);
    }
}
