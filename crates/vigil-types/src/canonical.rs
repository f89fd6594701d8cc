//! Canonical JSON rendering.
//!
//! Hashes and signatures must be stable across processes, so every byte
//! form fed to them is canonical JSON: UTF-8, object keys sorted, no
//! insignificant whitespace. Numbers render through serde_json's shortest
//! round-trip form.

use std::collections::BTreeMap;

use serde_json::Value;

/// Renders a JSON value canonically: sorted keys, compact separators.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            // BTreeMap re-sort covers builds with serde_json's
            // preserve_order feature enabled transitively.
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, val)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_value(out, val);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
