//! Layered context consumed by the resolver.
//!
//! The context is a JSON object whose top-level keys are *scopes*
//! (`pipeline`, `phase`, `action`, `globals`, …). Token paths address into it
//! with dot notation; a handful of aliases map shorthand scopes onto their
//! canonical location.

use serde_json::{Map, Value};

/// Scopes with a dedicated top-level slot. Anything else falls back to `custom`.
pub const KNOWN_SCOPES: &[&str] = &[
    "pipeline",
    "phase",
    "action",
    "globals",
    "team",
    "stores",
    "agent",
    "position",
    "st",
    "previousPhase",
    "previousAction",
    "rag",
    "constants",
    "context",
    "custom",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateContext {
    root: Map<String, Value>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(root: Map<String, Value>) -> Self {
        Self { root }
    }

    /// Builder-style variant of [`set_scope`](Self::set_scope).
    pub fn with_scope(mut self, scope: &str, value: Value) -> Self {
        self.set_scope(scope, value);
        self
    }

    pub fn set_scope(&mut self, scope: &str, value: Value) {
        let (name, _) = canonical_scope(scope);
        self.root.insert(name.to_string(), value);
    }

    pub fn scope(&self, scope: &str) -> Option<&Value> {
        let (name, _) = canonical_scope(scope);
        self.root.get(name)
    }

    /// Set `action.input`, creating the `action` scope if needed.
    pub fn set_input(&mut self, input: Value) {
        self.set_action_field("input", input);
    }

    /// Set `action.output`, creating the `action` scope if needed.
    pub fn set_output(&mut self, output: Value) {
        self.set_action_field("output", output);
    }

    /// Merge entries into the `custom` scope, overwriting existing keys.
    pub fn merge_custom(&mut self, entries: Map<String, Value>) {
        match self.root.get_mut("custom") {
            Some(Value::Object(map)) => map.extend(entries),
            _ => {
                self.root.insert("custom".into(), Value::Object(entries));
            }
        }
    }

    fn set_action_field(&mut self, key: &str, value: Value) {
        match self.root.get_mut("action") {
            Some(Value::Object(map)) => {
                map.insert(key.to_string(), value);
            }
            _ => {
                let mut map = Map::new();
                map.insert(key.to_string(), value);
                self.root.insert("action".into(), Value::Object(map));
            }
        }
    }

    /// Resolve a dot path such as `globals.flag` or `store.lore.title`.
    ///
    /// Returns `None` when any segment is missing or the value is `null`.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let path = path.trim();
        if path.is_empty() {
            return None;
        }
        let mut segments = path.split('.').map(str::trim);
        let first = segments.next()?;
        let rest: Vec<&str> = segments.collect();

        let (scope, prefix) = canonical_scope(first);
        let start = match self.root.get(scope) {
            Some(v) => {
                let mut cursor = v;
                for seg in prefix {
                    cursor = step(cursor, seg)?;
                }
                cursor
            }
            None if !KNOWN_SCOPES.contains(&scope) => self.root.get("custom")?.get(first)?,
            None => return None,
        };

        let mut cursor = start;
        for seg in rest {
            cursor = step(cursor, seg)?;
        }
        if cursor.is_null() {
            None
        } else {
            Some(cursor.clone())
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.root
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.root)
    }
}

fn step<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

/// Map a scope name (or alias) onto its storage slot plus any implied sub-path.
fn canonical_scope(name: &str) -> (&str, &'static [&'static str]) {
    match name {
        "global" | "globals" => ("globals", &[]),
        "input" => ("action", &["input"]),
        "output" => ("action", &["output"]),
        "store" | "stores" => ("stores", &[]),
        "constant" | "constants" => ("constants", &[]),
        "previousPhase" | "previous_phase" => ("previousPhase", &[]),
        "previousAction" | "previous_action" => ("previousAction", &[]),
        other => (other, &[]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> TemplateContext {
        let mut ctx = TemplateContext::new()
            .with_scope("globals", json!({"flag": true, "tone": "dry"}))
            .with_scope("stores", json!({"lore": {"title": "Dragons", "tags": ["a", "b"]}}))
            .with_scope("phase", json!({"id": "draft", "output": null}));
        ctx.set_input(json!("hi"));
        ctx.merge_custom(json!({"mood": "calm"}).as_object().unwrap().clone());
        ctx
    }

    #[test]
    fn lookup_global_alias() {
        let ctx = sample();
        assert_eq!(ctx.lookup("global.tone"), Some(json!("dry")));
        assert_eq!(ctx.lookup("globals.flag"), Some(json!(true)));
    }

    #[test]
    fn lookup_input_shorthand() {
        let ctx = sample();
        assert_eq!(ctx.lookup("input"), Some(json!("hi")));
        assert_eq!(ctx.lookup("action.input"), Some(json!("hi")));
    }

    #[test]
    fn lookup_store_path_and_array_index() {
        let ctx = sample();
        assert_eq!(ctx.lookup("store.lore.title"), Some(json!("Dragons")));
        assert_eq!(ctx.lookup("stores.lore.tags.1"), Some(json!("b")));
        assert_eq!(ctx.lookup("store.lore.tags.9"), None);
    }

    #[test]
    fn null_values_are_unresolved() {
        let ctx = sample();
        assert_eq!(ctx.lookup("phase.output"), None);
        assert_eq!(ctx.lookup("phase.id"), Some(json!("draft")));
    }

    #[test]
    fn unknown_scope_falls_back_to_custom() {
        let ctx = sample();
        assert_eq!(ctx.lookup("mood"), Some(json!("calm")));
        assert_eq!(ctx.lookup("missing"), None);
        // known scopes never fall back
        assert_eq!(ctx.lookup("rag.results"), None);
    }

    #[test]
    fn set_output_keeps_input() {
        let mut ctx = sample();
        ctx.set_output(json!("done"));
        assert_eq!(ctx.lookup("output"), Some(json!("done")));
        assert_eq!(ctx.lookup("input"), Some(json!("hi")));
    }
}
