//! Transform pipelines: `{{token | transform | transform:arg}}`.
//!
//! Each transform maps a JSON value to a JSON value. Transforms leave `null`
//! untouched (so an unresolved token stays unresolved) except `default`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::format::stringify;

/// A custom transform: `(value, args) -> value`.
pub type TransformFn = Arc<dyn Fn(&Value, &[String]) -> Value + Send + Sync>;

/// Built-in plus user-registered transforms.
#[derive(Clone, Default)]
pub struct TransformRegistry {
    custom: HashMap<String, TransformFn>,
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.custom.keys().collect();
        names.sort();
        f.debug_struct("TransformRegistry")
            .field("custom", &names)
            .finish()
    }
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom transform. Custom transforms shadow built-ins of the same name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&Value, &[String]) -> Value + Send + Sync + 'static,
    ) {
        self.custom.insert(name.into(), Arc::new(f));
    }

    /// Apply the transform described by `spec` (e.g. `"truncate:20"`).
    /// Unknown transforms pass the value through.
    pub fn apply_spec(&self, spec: &str, value: &Value) -> Value {
        let (name, args) = parse_transform(spec);
        self.apply(&name, &args, value)
    }

    pub fn apply(&self, name: &str, args: &[String], value: &Value) -> Value {
        if let Some(f) = self.custom.get(name) {
            return f(value, args);
        }
        match builtin(name, args, value) {
            Some(v) => v,
            None => {
                tracing::debug!(transform = %name, "Unknown transform, passing value through");
                value.clone()
            }
        }
    }
}

/// Split `name:arg1:arg2` into the name and its arguments. Arguments may be
/// quoted with `"` or `'` to contain colons.
pub fn parse_transform(spec: &str) -> (String, Vec<String>) {
    let parts = split_outside_quotes(spec.trim(), ':');
    let mut iter = parts.into_iter();
    let name = iter.next().unwrap_or_default().trim().to_lowercase();
    let args = iter.map(|a| unquote(&a)).collect();
    (name, args)
}

/// Split on `sep` wherever it is not inside single or double quotes.
pub(crate) fn split_outside_quotes(input: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match quote {
            Some(q) if c == q => {
                quote = None;
                current.push(c);
            }
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                current.push(c);
            }
            None if c == sep => parts.push(std::mem::take(&mut current)),
            None => current.push(c),
        }
    }
    parts.push(current);
    parts
}

fn unquote(raw: &str) -> String {
    let s = raw.trim();
    if s.len() >= 2 {
        let bytes = s.as_bytes();
        if (bytes[0] == b'"' && bytes[s.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[s.len() - 1] == b'\'')
        {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn text(value: &Value) -> Option<String> {
    if value.is_null() {
        None
    } else {
        Some(stringify(value))
    }
}

fn map_text(value: &Value, f: impl FnOnce(String) -> String) -> Value {
    match text(value) {
        Some(s) => Value::String(f(s)),
        None => Value::Null,
    }
}

fn list_items(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().map(stringify).collect(),
        Value::Null => Vec::new(),
        other => vec![stringify(other)],
    }
}

fn builtin(name: &str, args: &[String], value: &Value) -> Option<Value> {
    let arg = |i: usize| args.get(i).map(String::as_str);

    let out = match name {
        "upper" | "uppercase" => map_text(value, |s| s.to_uppercase()),
        "lower" | "lowercase" => map_text(value, |s| s.to_lowercase()),
        "trim" => map_text(value, |s| s.trim().to_string()),
        "capitalize" => map_text(value, |s| {
            let mut chars = s.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        }),
        "truncate" => {
            let limit = arg(0).and_then(|a| a.parse::<usize>().ok()).unwrap_or(100);
            let suffix = arg(1).unwrap_or("...").to_string();
            map_text(value, |s| {
                if s.chars().count() > limit {
                    let mut cut: String = s.chars().take(limit).collect();
                    cut.push_str(&suffix);
                    cut
                } else {
                    s
                }
            })
        }
        "default" => {
            let empty = match value {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                Value::Array(items) => items.is_empty(),
                _ => false,
            };
            if empty {
                Value::String(arg(0).unwrap_or_default().to_string())
            } else {
                value.clone()
            }
        }
        "json" => {
            if value.is_null() {
                Value::Null
            } else {
                Value::String(
                    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
                )
            }
        }
        "join" => match value {
            Value::Array(_) => Value::String(list_items(value).join(arg(0).unwrap_or(", "))),
            other => other.clone(),
        },
        "lines" => match value {
            Value::Array(_) => Value::String(list_items(value).join("\n")),
            other => other.clone(),
        },
        "first" => match value {
            Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
            other => other.clone(),
        },
        "last" => match value {
            Value::Array(items) => items.last().cloned().unwrap_or(Value::Null),
            other => other.clone(),
        },
        "length" | "count" => match value {
            Value::Array(items) => Value::from(items.len()),
            Value::Object(map) => Value::from(map.len()),
            Value::String(s) => Value::from(s.chars().count()),
            Value::Null => Value::Null,
            other => Value::from(stringify(other).chars().count()),
        },
        "split" => {
            let sep = arg(0).unwrap_or(",");
            match text(value) {
                Some(s) => Value::Array(
                    s.split(sep)
                        .map(|p| Value::String(p.trim().to_string()))
                        .collect(),
                ),
                None => Value::Null,
            }
        }
        "replace" => {
            let from = arg(0).unwrap_or_default().to_string();
            let to = arg(1).unwrap_or_default().to_string();
            if from.is_empty() {
                value.clone()
            } else {
                map_text(value, |s| s.replace(&from, &to))
            }
        }
        "prefix" => {
            let p = arg(0).unwrap_or_default().to_string();
            map_text(value, |s| if s.is_empty() { s } else { format!("{p}{s}") })
        }
        "suffix" => {
            let p = arg(0).unwrap_or_default().to_string();
            map_text(value, |s| if s.is_empty() { s } else { format!("{s}{p}") })
        }
        "bullets" => {
            if value.is_null() {
                Value::Null
            } else {
                Value::String(
                    list_items(value)
                        .iter()
                        .map(|i| format!("- {i}"))
                        .collect::<Vec<_>>()
                        .join("\n"),
                )
            }
        }
        "numbered" => {
            if value.is_null() {
                Value::Null
            } else {
                Value::String(
                    list_items(value)
                        .iter()
                        .enumerate()
                        .map(|(n, i)| format!("{}. {i}", n + 1))
                        .collect::<Vec<_>>()
                        .join("\n"),
                )
            }
        }
        _ => return None,
    };
    Some(out)
}
