//! Bounded rendering of JSON values for log lines.

use serde_json::Value;

/// Default per-element limit used by [`clipped`].
pub const DEFAULT_MAX_ELEMENT_LEN: usize = 64;

/// Return a copy of `value` where every scalar is rendered as a string of at
/// most `max_len` characters (plus `...` when cut). Objects and arrays keep
/// their shape.
pub fn clipped_with(value: &Value, max_len: usize) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| (key.clone(), clipped_with(inner, max_len)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|inner| clipped_with(inner, max_len)).collect())
        }
        Value::String(text) => Value::String(clip_text(text, max_len)),
        other => Value::String(clip_text(&other.to_string(), max_len)),
    }
}

pub fn clipped(value: &Value) -> Value {
    clipped_with(value, DEFAULT_MAX_ELEMENT_LEN)
}

fn clip_text(text: &str, max_len: usize) -> String {
    match text.char_indices().nth(max_len) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
