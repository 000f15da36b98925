//! Rendering of JSON values into prompt text.

use serde_json::Value;

/// Objects with at most this many scalar entries render as `Key: value` lines.
const MAX_KEY_VALUE_ENTRIES: usize = 10;

/// Array items longer than this switch the join separator to a newline.
const LONG_ITEM_CHARS: usize = 80;

/// Render a value the way it should appear inside a prompt.
///
/// - strings pass through; numbers and booleans use their display form
/// - arrays render as JSON if any element is an object, otherwise comma-joined
///   (newline-joined if any element is long or multi-line)
/// - objects with ≤10 scalar entries render as `Key: value` lines with
///   humanized keys, anything else as pretty JSON
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => {
            if items.iter().any(Value::is_object) {
                return pretty(value);
            }
            let rendered: Vec<String> = items.iter().map(stringify).collect();
            let long = rendered
                .iter()
                .any(|s| s.contains('\n') || s.chars().count() > LONG_ITEM_CHARS);
            rendered.join(if long { "\n" } else { ", " })
        }
        Value::Object(map) => {
            let all_scalar = map
                .values()
                .all(|v| !v.is_object() && !v.is_array());
            if map.len() <= MAX_KEY_VALUE_ENTRIES && all_scalar {
                map.iter()
                    .map(|(k, v)| format!("{}: {}", humanize_key(k), stringify(v)))
                    .collect::<Vec<_>>()
                    .join("\n")
            } else {
                pretty(value)
            }
        }
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Turn `camelCase` / `snake_case` / `kebab-case` keys into `Title Case` words.
pub fn humanize_key(key: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut prev_lower_or_digit = false;

    for c in key.chars() {
        if c == '_' || c == '-' || c == ' ' {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower_or_digit = false;
            continue;
        }
        if c.is_uppercase() && prev_lower_or_digit && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower_or_digit = c.is_lowercase() || c.is_ascii_digit();
        current.push(c);
    }
    if !current.is_empty() {
        words.push(current);
    }

    words
        .iter()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
