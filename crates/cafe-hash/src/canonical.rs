use serde_json::Value;
use std::fmt::Write;

/// Renders `value` as canonical JSON: object keys sorted lexicographically,
/// no insignificant whitespace, UTF-8, numbers in their shortest round-trip
/// form (delegated to `serde_json`, which already prints the shortest
/// representation that round-trips).
///
/// `serde_json`'s own `Value::Object` preserves insertion order (or, with
/// the `preserve_order` feature, a `Map`'s iteration order); neither is
/// guaranteed sorted, so keys are sorted explicitly here rather than relying
/// on map iteration order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            write!(out, "{n}").expect("writing to a String cannot fail");
        }
        Value::String(s) => write_json_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

fn write_json_string(s: &str, out: &mut String) {
    // serde_json's Display for a bare string is not quoted/escaped, so
    // round-trip through its serializer to get spec-correct JSON string
    // escaping without hand-rolling it.
    let quoted = serde_json::to_string(s).expect("string serialization cannot fail");
    out.push_str(&quoted);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_object_keys() {
        let value = json!({"b": 1, "a": 2});
        assert_eq!(canonical_json(&value), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn no_insignificant_whitespace() {
        let value = json!({"a": [1, 2, 3], "b": "x"});
        let s = canonical_json(&value);
        assert!(!s.contains(' '));
        assert!(!s.contains('\n'));
    }

    #[test]
    fn nested_objects_sorted_recursively() {
        let value = json!({"z": {"y": 1, "x": 2}, "a": 3});
        assert_eq!(canonical_json(&value), r#"{"a":3,"z":{"x":2,"y":1}}"#);
    }

    #[test]
    fn escapes_strings() {
        let value = json!({"a": "hello \"world\"\n"});
        assert_eq!(canonical_json(&value), r#"{"a":"hello \"world\"\n"}"#);
    }

    #[test]
    fn deterministic_across_calls() {
        let value = json!({"inputs": {"b.txt": "h2", "a.txt": "h1"}, "command": "run"});
        assert_eq!(canonical_json(&value), canonical_json(&value));
    }
}
