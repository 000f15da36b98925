//! The template resolver.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use council_types::Result;

use crate::condition::{evaluate_condition, parse_condition};
use crate::context::TemplateContext;
use crate::format::stringify;
use crate::macros::{parse_macro_args, MacroDefinition, MacroLibrary};
use crate::transforms::{split_outside_quotes, TransformRegistry};

/// Macro names owned by the host chat application. Tokens whose name is in
/// this list are returned verbatim, never resolved or replaced.
pub const HOST_MACROS: &[&str] = &[
    "char",
    "user",
    "persona",
    "description",
    "personality",
    "scenario",
    "mesexamples",
    "mesexamplesraw",
    "charversion",
    "char_version",
    "charprompt",
    "charinstruction",
    "charjailbreak",
    "system",
    "original",
    "group",
    "groupnotmuted",
    "notchar",
    "model",
    "time",
    "time_utc",
    "date",
    "weekday",
    "isotime",
    "isodate",
    "datetimeformat",
    "idle_duration",
    "timediff",
    "lastmessage",
    "lastmessageid",
    "lastusermessage",
    "lastcharmessage",
    "firstincludedmessageid",
    "currentswipeid",
    "lastswipeid",
    "random",
    "pick",
    "roll",
    "setvar",
    "getvar",
    "addvar",
    "incvar",
    "decvar",
    "setglobalvar",
    "getglobalvar",
    "addglobalvar",
    "incglobalvar",
    "decglobalvar",
    "newline",
    "trim",
    "noop",
    "banned",
    "bias",
    "reverse",
    "maxprompt",
    "//",
];

/// What to do with a token that cannot be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum UnresolvedPolicy {
    /// Leave the original `{{...}}` text in place.
    #[default]
    Preserve,
    /// Replace the token with a fixed value.
    Placeholder {
        #[serde(default)]
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolverConfig {
    pub unresolved: UnresolvedPolicy,
    /// Maximum nesting of conditional blocks and macro expansions.
    pub max_depth: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            unresolved: UnresolvedPolicy::Preserve,
            max_depth: 8,
        }
    }
}

/// The name a token is known by: its text up to the first `:` or whitespace,
/// lowercased. `{{setvar::x::1}}` is named `setvar`.
fn token_name(inner: &str) -> String {
    inner
        .trim()
        .split(|c: char| c == ':' || c.is_whitespace())
        .next()
        .unwrap_or_default()
        .to_lowercase()
}

/// True if the token belongs to the host application's macro engine.
pub fn is_host_macro(token: &str) -> bool {
    let name = token_name(token);
    HOST_MACROS.contains(&name.as_str())
}

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^{}]*)\}\}").expect("token regex is valid"))
}

fn macro_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*macro:([A-Za-z0-9_-]+)([^{}]*)\}\}").expect("macro regex is valid")
    })
}

/// Resolves templates against a [`TemplateContext`].
#[derive(Debug, Clone, Default)]
pub struct TemplateResolver {
    config: ResolverConfig,
    macros: MacroLibrary,
    transforms: TransformRegistry,
}

impl TemplateResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn macros(&self) -> &MacroLibrary {
        &self.macros
    }

    pub fn register_macro(&mut self, definition: MacroDefinition) -> Result<()> {
        self.macros.register(definition)
    }

    pub fn register_transform(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&Value, &[String]) -> Value + Send + Sync + 'static,
    ) {
        self.transforms.register(name, f);
    }

    /// Resolve a template to text.
    pub fn resolve(&self, template: &str, ctx: &TemplateContext) -> String {
        self.resolve_at(template, ctx, 0)
    }

    /// Resolve every string inside a JSON value.
    ///
    /// A string that is exactly one plain token (`"{{globals.list}}"`) resolves
    /// to the token's raw value, so arrays and objects keep their shape.
    pub fn resolve_value(&self, value: &Value, ctx: &TemplateContext) -> Value {
        match value {
            Value::String(s) => {
                if let Some(raw) = self.single_token_value(s, ctx) {
                    return raw;
                }
                Value::String(self.resolve(s, ctx))
            }
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.resolve_value(v, ctx)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v, ctx)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Evaluate a condition expression (the text inside `{{#if ...}}`).
    pub fn evaluate(&self, condition: &str, ctx: &TemplateContext) -> bool {
        let expr = parse_condition(condition);
        evaluate_condition(&expr, &|path| self.lookup(path, ctx))
    }

    /// Look up a token path. Host macros never resolve.
    pub fn lookup(&self, path: &str, ctx: &TemplateContext) -> Option<Value> {
        if is_host_macro(path) {
            return None;
        }
        ctx.lookup(path)
    }

    fn single_token_value(&self, s: &str, ctx: &TemplateContext) -> Option<Value> {
        let caps = token_regex().captures(s.trim())?;
        let whole = caps.get(0)?;
        if whole.as_str().len() != s.trim().len() {
            return None;
        }
        let inner = caps.get(1)?.as_str().trim();
        if inner.starts_with(['#', '/']) || inner.contains('|') || inner.starts_with("macro:") {
            return None;
        }
        self.lookup(inner, ctx)
    }

    fn resolve_at(&self, template: &str, ctx: &TemplateContext, depth: usize) -> String {
        if !template.contains("{{") {
            return template.to_string();
        }
        if depth > self.config.max_depth {
            tracing::warn!(depth, "Template nesting too deep, leaving remainder unresolved");
            return template.to_string();
        }
        let text = self.resolve_conditionals(template, ctx, depth);
        let text = self.expand_macros(&text, ctx, depth);
        let text = self.resolve_pipelines(&text, ctx);
        self.resolve_tokens(&text, ctx)
    }

    fn unresolved(&self, original: &str) -> String {
        match &self.config.unresolved {
            UnresolvedPolicy::Preserve => original.to_string(),
            UnresolvedPolicy::Placeholder { value } => value.clone(),
        }
    }

    // -- stage 1: conditionals --------------------------------------------

    fn resolve_conditionals(&self, input: &str, ctx: &TemplateContext, depth: usize) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = find_block_open(rest) {
            out.push_str(&rest[..start]);
            let tail = &rest[start..];
            match parse_block(tail) {
                Some(block) => {
                    let holds = self.evaluate(block.condition, ctx) != block.negated;
                    let branch = if holds {
                        block.body
                    } else {
                        block.else_body.unwrap_or_default()
                    };
                    if depth >= self.config.max_depth {
                        out.push_str(branch);
                    } else {
                        out.push_str(&self.resolve_conditionals(branch, ctx, depth + 1));
                    }
                    rest = &tail[block.len..];
                }
                None => {
                    // Unterminated block: keep the text and move past the opener.
                    out.push_str(&tail[..3]);
                    rest = &tail[3..];
                }
            }
        }
        out.push_str(rest);
        out
    }

    // -- stage 2: macros ----------------------------------------------------

    fn expand_macros(&self, input: &str, ctx: &TemplateContext, depth: usize) -> String {
        if !input.contains("macro:") {
            return input.to_string();
        }
        macro_regex()
            .replace_all(input, |caps: &Captures| {
                let original = &caps[0];
                let id = &caps[1];
                let Some(definition) = self.macros.get(id) else {
                    tracing::debug!(id = %id, "Unknown macro");
                    return self.unresolved(original);
                };
                let args = parse_macro_args(&caps[2]);
                match definition.expand(&args) {
                    Ok(body) => self.resolve_at(&body, ctx, depth + 1),
                    Err(missing) => {
                        tracing::warn!(id = %id, parameter = %missing, "Macro missing required parameter");
                        self.unresolved(original)
                    }
                }
            })
            .into_owned()
    }

    // -- stage 3: transform pipelines ------------------------------------

    fn resolve_pipelines(&self, input: &str, ctx: &TemplateContext) -> String {
        if !input.contains('|') {
            return input.to_string();
        }
        token_regex()
            .replace_all(input, |caps: &Captures| {
                let original = &caps[0];
                let inner = &caps[1];
                let parts = split_outside_quotes(inner, '|');
                if parts.len() < 2 || is_structural(inner) {
                    return original.to_string();
                }
                let token = parts[0].trim();
                if is_host_macro(token) {
                    return original.to_string();
                }
                let mut value = self.lookup(token, ctx).unwrap_or(Value::Null);
                for spec in parts[1..].iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
                    value = self.transforms.apply_spec(spec, &value);
                }
                if value.is_null() {
                    self.unresolved(original)
                } else {
                    stringify(&value)
                }
            })
            .into_owned()
    }

    // -- stage 4: plain tokens -------------------------------------------

    fn resolve_tokens(&self, input: &str, ctx: &TemplateContext) -> String {
        token_regex()
            .replace_all(input, |caps: &Captures| {
                let original = &caps[0];
                let inner = caps[1].trim();
                if inner.is_empty() || is_structural(inner) || is_host_macro(inner) {
                    return original.to_string();
                }
                if inner.starts_with("macro:") {
                    return self.unresolved(original);
                }
                match self.lookup(inner, ctx) {
                    Some(value) => stringify(&value),
                    None => {
                        tracing::debug!(token = %inner, "Unresolved token");
                        self.unresolved(original)
                    }
                }
            })
            .into_owned()
    }
}

/// Block syntax left behind by malformed templates is never treated as a token.
fn is_structural(inner: &str) -> bool {
    let t = inner.trim();
    t.starts_with('#') || t.starts_with('/') || t == "else"
}

struct Block<'a> {
    condition: &'a str,
    negated: bool,
    body: &'a str,
    else_body: Option<&'a str>,
    /// Byte length of the whole block, opener through closer.
    len: usize,
}

const IF_OPEN: &str = "{{#if ";
const UNLESS_OPEN: &str = "{{#unless ";
const ELSE_TAG: &str = "{{else}}";
const IF_CLOSE: &str = "{{/if}}";
const UNLESS_CLOSE: &str = "{{/unless}}";

fn find_block_open(s: &str) -> Option<usize> {
    match (s.find(IF_OPEN), s.find(UNLESS_OPEN)) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Parse a block starting at the beginning of `s`, honoring nested blocks.
fn parse_block(s: &str) -> Option<Block<'_>> {
    let (negated, open_len) = if s.starts_with(IF_OPEN) {
        (false, IF_OPEN.len())
    } else if s.starts_with(UNLESS_OPEN) {
        (true, UNLESS_OPEN.len())
    } else {
        return None;
    };

    let header_end = open_len + s[open_len..].find("}}")?;
    let condition = s[open_len..header_end].trim();
    let body_start = header_end + 2;

    let bytes = s.as_bytes();
    let mut nesting = 0usize;
    let mut else_at: Option<usize> = None;
    let mut i = body_start;

    while i + 1 < bytes.len() {
        if bytes[i] != b'{' || bytes[i + 1] != b'{' {
            i += 1;
            continue;
        }
        let tail = &s[i..];
        if tail.starts_with(IF_OPEN) || tail.starts_with(UNLESS_OPEN) {
            nesting += 1;
            i += 2;
        } else if tail.starts_with(IF_CLOSE) || tail.starts_with(UNLESS_CLOSE) {
            let close_len = if tail.starts_with(IF_CLOSE) {
                IF_CLOSE.len()
            } else {
                UNLESS_CLOSE.len()
            };
            if nesting == 0 {
                let body_end = else_at.unwrap_or(i);
                return Some(Block {
                    condition,
                    negated,
                    body: &s[body_start..body_end],
                    else_body: else_at.map(|e| &s[e + ELSE_TAG.len()..i]),
                    len: i + close_len,
                });
            }
            nesting -= 1;
            i += close_len;
        } else if tail.starts_with(ELSE_TAG) {
            if nesting == 0 && else_at.is_none() {
                else_at = Some(i);
            }
            i += ELSE_TAG.len();
        } else {
            i += 2;
        }
    }
    None
}
