//! User metadata sanitizing for object headers.
//!
//! S3 sends user metadata as `x-amz-meta-*` headers: values must be ASCII,
//! the total is capped at 2 KiB, and free-form lists such as tags are not
//! representable.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

/// Total byte budget for metadata keys and values.
pub const MAX_METADATA_BYTES: usize = 2048;

/// Keys carrying free-form lists, never forwarded to the store.
const REJECTED_KEYS: &[&str] = &["tags", "keywords", "categories"];

fn clean_key(key: &str) -> String {
    key.trim()
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

fn clean_value(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Strip everything the store would reject.
///
/// Keys are processed in sorted order so the budget cut is deterministic.
pub fn sanitize_metadata(raw: &HashMap<String, String>) -> HashMap<String, String> {
    let sorted: BTreeMap<String, &String> = raw
        .iter()
        .map(|(k, v)| (clean_key(k), v))
        .filter(|(k, _)| !k.is_empty() && !REJECTED_KEYS.contains(&k.as_str()))
        .collect();

    let mut out = HashMap::new();
    let mut used = 0usize;
    for (key, value) in sorted {
        let value = clean_value(value);
        if value.is_empty() {
            continue;
        }
        let cost = key.len() + value.len();
        if used + cost > MAX_METADATA_BYTES {
            debug!(key = %key, "Dropping metadata entry over header budget");
            continue;
        }
        used += cost;
        out.insert(key, value);
    }
    out
}

/// Flatten a JSON metadata object into string headers.
///
/// Scalars are stringified; arrays and nested objects are dropped.
pub fn metadata_from_json(value: Option<&serde_json::Value>) -> HashMap<String, String> {
    let Some(serde_json::Value::Object(map)) = value else {
        return HashMap::new();
    };

    let raw: HashMap<String, String> = map
        .iter()
        .filter_map(|(k, v)| {
            let s = match v {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((k.clone(), s))
        })
        .collect();

    sanitize_metadata(&raw)
}
