//! Bounded copies of arbitrary JSON payloads kept for diagnostics.

use serde_json::{Map, Value};

const MAX_DEPTH: usize = 4;
const MAX_ENTRIES: usize = 32;
const MAX_STRING_CHARS: usize = 2_000;
const TRUNCATED: &str = "[truncated]";

/// Returns a copy of `value` bounded in depth, breadth and string length.
///
/// Objects and arrays beyond the depth limit collapse to `"[truncated]"`;
/// extra entries are dropped and counted under `"_truncated_entries"`
/// (objects) or a trailing marker (arrays).
pub fn sanitize_payload(value: &Value) -> Value {
    sanitize_at(value, 0)
}

fn sanitize_at(value: &Value, depth: usize) -> Value {
    match value {
        Value::String(s) => Value::String(truncate_chars(s, MAX_STRING_CHARS)),
        Value::Array(items) => {
            if depth >= MAX_DEPTH {
                return Value::String(TRUNCATED.into());
            }
            let mut out: Vec<Value> = items
                .iter()
                .take(MAX_ENTRIES)
                .map(|item| sanitize_at(item, depth + 1))
                .collect();
            if items.len() > MAX_ENTRIES {
                out.push(Value::String(format!(
                    "[{} more items]",
                    items.len() - MAX_ENTRIES
                )));
            }
            Value::Array(out)
        }
        Value::Object(map) => {
            if depth >= MAX_DEPTH {
                return Value::String(TRUNCATED.into());
            }
            let mut out = Map::new();
            for (key, item) in map.iter().take(MAX_ENTRIES) {
                out.insert(key.clone(), sanitize_at(item, depth + 1));
            }
            if map.len() > MAX_ENTRIES {
                out.insert(
                    "_truncated_entries".into(),
                    Value::from((map.len() - MAX_ENTRIES) as u64),
                );
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Truncates to at most `max_chars` characters, marking the cut with `…`.
pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let mut out = s[..idx].to_string();
            out.push('…');
            out
        }
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn small_payloads_are_unchanged() {
        let value = json!({"a": 1, "b": [true, null, "x"], "c": {"d": 2.5}});
        assert_eq!(sanitize_payload(&value), value);
    }

    #[test]
    fn deep_nesting_is_collapsed() {
        let value = json!({"l1": {"l2": {"l3": {"l4": {"l5": 1}}}}});
        let out = sanitize_payload(&value);
        assert_eq!(out["l1"]["l2"]["l3"]["l4"], json!("[truncated]"));
    }

    #[test]
    fn wide_objects_and_arrays_are_capped() {
        let map: Map<String, Value> = (0..40).map(|i| (format!("k{i:02}"), json!(i))).collect();
        let out = sanitize_payload(&Value::Object(map));
        let obj = out.as_object().expect("object");
        assert_eq!(obj.len(), MAX_ENTRIES + 1);
        assert_eq!(obj["_truncated_entries"], json!(8));

        let arr = Value::Array((0..35).map(|i| json!(i)).collect());
        let out = sanitize_payload(&arr);
        let items = out.as_array().expect("array");
        assert_eq!(items.len(), MAX_ENTRIES + 1);
        assert_eq!(items.last(), Some(&json!("[3 more items]")));
    }

    #[test]
    fn long_strings_are_truncated_on_char_boundaries() {
        let s = "é".repeat(MAX_STRING_CHARS + 5);
        let out = sanitize_payload(&Value::String(s));
        let text = out.as_str().expect("string");
        assert_eq!(text.chars().count(), MAX_STRING_CHARS + 1);
        assert!(text.ends_with('…'));
    }
}
