//! Macro library: named, parameterized template snippets invoked as
//! `{{macro:id key="value"}}`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use council_types::{CouncilError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MacroParameter {
    pub name: String,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MacroDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub template: String,
    #[serde(default)]
    pub parameters: Vec<MacroParameter>,
}

impl MacroDefinition {
    pub fn new(id: impl Into<String>, template: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            template: template.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, default: Option<&str>) -> Self {
        self.parameters.push(MacroParameter {
            name: name.into(),
            default: default.map(String::from),
            required: default.is_none(),
            description: String::new(),
        });
        self
    }

    /// Substitute `{{param}}` placeholders in the body.
    ///
    /// Declared parameters take the supplied argument or their default;
    /// undeclared arguments are substituted as well. Returns the name of the
    /// first required parameter that has neither.
    pub fn expand(&self, args: &HashMap<String, String>) -> std::result::Result<String, String> {
        let mut values: HashMap<&str, &str> = HashMap::new();
        for param in &self.parameters {
            match args.get(&param.name).or(param.default.as_ref()) {
                Some(v) => {
                    values.insert(param.name.as_str(), v.as_str());
                }
                None if param.required => return Err(param.name.clone()),
                None => {
                    values.insert(param.name.as_str(), "");
                }
            }
        }
        for (k, v) in args {
            values.entry(k.as_str()).or_insert(v.as_str());
        }

        let mut body = self.template.clone();
        for (name, value) in values {
            body = body.replace(&format!("{{{{{name}}}}}"), value);
        }
        Ok(body)
    }
}

/// Registry of macros keyed by id.
#[derive(Debug, Clone, Default)]
pub struct MacroLibrary {
    macros: HashMap<String, MacroDefinition>,
}

impl MacroLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a macro.
    pub fn register(&mut self, definition: MacroDefinition) -> Result<()> {
        if definition.id.trim().is_empty() {
            return Err(CouncilError::ValidationError("macro id must not be empty".into()));
        }
        if !definition
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(CouncilError::ValidationError(format!(
                "invalid macro id '{}'",
                definition.id
            )));
        }
        tracing::debug!(id = %definition.id, "Registered macro");
        self.macros.insert(definition.id.clone(), definition);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&MacroDefinition> {
        self.macros.get(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<MacroDefinition> {
        self.macros.remove(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.macros.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.macros.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }
}

/// Parse `key="value" key2='v' key3=bare` into a map. Tokens without `=` are ignored.
pub fn parse_macro_args(input: &str) -> HashMap<String, String> {
    let mut args = HashMap::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        let key_start = i;
        while i < chars.len() && chars[i] != '=' && !chars[i].is_whitespace() {
            i += 1;
        }
        let key: String = chars[key_start..i].iter().collect();
        if i >= chars.len() || chars[i] != '=' {
            continue;
        }
        i += 1; // '='

        let value: String = if i < chars.len() && (chars[i] == '"' || chars[i] == '\'') {
            let quote = chars[i];
            i += 1;
            let start = i;
            while i < chars.len() && chars[i] != quote {
                i += 1;
            }
            let v = chars[start..i].iter().collect();
            i += 1; // closing quote
            v
        } else {
            let start = i;
            while i < chars.len() && !chars[i].is_whitespace() {
                i += 1;
            }
            chars[start..i].iter().collect()
        };

        if !key.is_empty() {
            args.insert(key, value);
        }
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_args_quoted_and_bare() {
        let args = parse_macro_args(r#" tone="very dry" count=3 name='Ada L' "#);
        assert_eq!(args.get("tone").map(String::as_str), Some("very dry"));
        assert_eq!(args.get("count").map(String::as_str), Some("3"));
        assert_eq!(args.get("name").map(String::as_str), Some("Ada L"));
    }

    #[test]
    fn parse_args_ignores_flags_without_value() {
        let args = parse_macro_args("loud tone=x");
        assert_eq!(args.len(), 1);
        assert_eq!(args.get("tone").map(String::as_str), Some("x"));
    }

    #[test]
    fn expand_uses_defaults_and_args() {
        let def = MacroDefinition::new("greet", "Hello {{who}}, be {{tone}}.")
            .with_parameter("who", None)
            .with_parameter("tone", Some("kind"));
        let mut args = HashMap::new();
        args.insert("who".to_string(), "Ada".to_string());
        assert_eq!(def.expand(&args).unwrap(), "Hello Ada, be kind.");
    }

    #[test]
    fn expand_reports_missing_required() {
        let def = MacroDefinition::new("greet", "Hello {{who}}").with_parameter("who", None);
        assert_eq!(def.expand(&HashMap::new()), Err("who".to_string()));
    }

    #[test]
    fn register_rejects_bad_ids() {
        let mut lib = MacroLibrary::new();
        assert!(lib.register(MacroDefinition::new("", "x")).is_err());
        assert!(lib.register(MacroDefinition::new("bad id", "x")).is_err());
        lib.register(MacroDefinition::new("ok-id", "x")).unwrap();
        assert_eq!(lib.ids(), vec!["ok-id"]);
        assert!(lib.get("ok-id").is_some());
    }
}
