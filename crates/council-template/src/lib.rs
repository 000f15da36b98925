//! Token and template resolution for Council pipelines.
//!
//! A template is resolved in four stages, each re-entrant:
//! 1. conditional blocks (`{{#if cond}}…{{else}}…{{/if}}`, `{{#unless}}`)
//! 2. macro expansion (`{{macro:id key="value"}}`)
//! 3. transform pipelines (`{{token | upper | truncate:40}}`)
//! 4. plain token substitution (`{{scope.path}}`)
//!
//! Host-application macros such as `{{char}}` or `{{user}}` are never consumed;
//! they are returned verbatim so the host's own macro engine can process them.

pub mod condition;
pub mod context;
pub mod format;
pub mod macros;
pub mod resolver;
pub mod transforms;

pub use condition::{evaluate_condition, is_truthy, loose_eq, parse_condition, ConditionExpr, Operand, Operator};
pub use context::TemplateContext;
pub use format::{humanize_key, stringify};
pub use macros::{parse_macro_args, MacroDefinition, MacroLibrary, MacroParameter};
pub use resolver::{is_host_macro, ResolverConfig, TemplateResolver, UnresolvedPolicy, HOST_MACROS};
pub use transforms::{parse_transform, TransformFn, TransformRegistry};
