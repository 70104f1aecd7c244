//! Case-convention boundary between internal snake_case and the wire's
//! camelCase.
//!
//! Applied exactly once, to outgoing params and incoming results/errors
//! at the RPC client boundary. Keys are transformed recursively; values
//! (including string values) are never touched.

use serde_json::{Map, Value};

/// Converts all object keys from snake_case to camelCase, recursively.
pub fn to_wire(value: Value) -> Value {
    transform(value, snake_to_camel)
}

/// Converts all object keys from camelCase to snake_case, recursively.
pub fn from_wire(value: Value) -> Value {
    transform(value, camel_to_snake)
}

fn transform(value: Value, rename: fn(&str) -> String) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, inner) in map {
                out.insert(rename(&key), transform(inner, rename));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|v| transform(v, rename)).collect())
        }
        other => other,
    }
}

fn snake_to_camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for ch in key.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

fn camel_to_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 2);
    for ch in key.chars() {
        if ch.is_ascii_uppercase() {
            out.push('_');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
