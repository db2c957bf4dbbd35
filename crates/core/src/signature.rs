//! Stable hashes of tool calls, used by the executor to detect repeated
//! identical attempts.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::domain::tool::ToolArgs;

/// Hash of a tool name plus its arguments. Object keys are sorted at every
/// depth, so two calls that differ only in key order share a signature.
pub fn attempt_signature(tool: &str, args: &ToolArgs) -> String {
    let mut canonical = String::new();
    write_canonical(&Value::Object(args.clone()), &mut canonical);
    let mut hasher = blake3::Hasher::new();
    hasher.update(tool.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical.as_bytes());
    hasher.finalize().to_hex().to_string()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let sorted = map.iter().collect::<BTreeMap<_, _>>();
            out.push('{');
            for (index, (key, nested)) in sorted.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(nested, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, nested) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(nested, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::attempt_signature;
    use crate::domain::tool::ToolArgs;

    fn args(value: Value) -> ToolArgs {
        match value {
            Value::Object(map) => map,
            _ => ToolArgs::new(),
        }
    }

    #[test]
    fn key_order_does_not_change_signature() {
        let first = attempt_signature("sql_query", &args(json!({"query": "q", "limit": 5})));
        let second = attempt_signature("sql_query", &args(json!({"limit": 5, "query": "q"})));
        assert_eq!(first, second);
    }

    #[test]
    fn tool_name_and_values_are_part_of_signature() {
        let base = attempt_signature("sql_query", &args(json!({"query": "q"})));
        assert_ne!(base, attempt_signature("web_search", &args(json!({"query": "q"}))));
        assert_ne!(base, attempt_signature("sql_query", &args(json!({"query": "q2"}))));
    }
}
