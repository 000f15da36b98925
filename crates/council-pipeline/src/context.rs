//! Context assembly: builds the layered [`TemplateContext`] for a phase or
//! action from the pipeline definition, the run state and the stores.

use serde_json::{json, Map, Value};

use council_template::{humanize_key, stringify, TemplateContext};
use council_types::Run;

use crate::collaborators::Collaborators;
use crate::definition::{Action, ContextOverrides, Phase, Pipeline};

/// Sections rendered into the `context` scope, in default order.
pub const CONTEXT_SECTIONS: &[&str] = &[
    "instructions",
    "styleGuide",
    "outputFormat",
    "previousPhase",
    "team",
    "stores",
    "static",
];

/// Read every store the phase asks for. Failures are logged and the store is
/// left out.
pub async fn read_stores(phase: &Phase, collaborators: &Collaborators) -> Map<String, Value> {
    let mut stores = Map::new();
    if phase.context.stores.is_empty() {
        return stores;
    }
    let curation = match collaborators.curation() {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(phase = %phase.id, error = %e, "Skipping store context");
            return stores;
        }
    };
    for store_id in &phase.context.stores {
        match curation.read(store_id, None).await {
            Ok(data) => {
                stores.insert(store_id.clone(), data);
            }
            Err(e) => {
                tracing::warn!(phase = %phase.id, store = %store_id, error = %e, "Store read failed");
            }
        }
    }
    stores
}

/// Builds template contexts over one run snapshot.
pub struct ContextAssembler<'a> {
    pipeline: &'a Pipeline,
    phase: &'a Phase,
    run: &'a Run,
    host: &'a Map<String, Value>,
    stores: Map<String, Value>,
}

impl<'a> ContextAssembler<'a> {
    pub fn new(
        pipeline: &'a Pipeline,
        phase: &'a Phase,
        run: &'a Run,
        host: &'a Map<String, Value>,
    ) -> Self {
        Self {
            pipeline,
            phase,
            run,
            host,
            stores: Map::new(),
        }
    }

    pub fn with_stores(mut self, stores: Map<String, Value>) -> Self {
        self.stores = stores;
        self
    }

    /// Build the context, with the `action` scopes filled when `action` is given.
    ///
    /// `input` overrides the action's recorded input (it is resolved before the
    /// action state is updated).
    pub fn build(&self, action: Option<&Action>, input: Option<&Value>) -> TemplateContext {
        let phase_state = self.run.phase(&self.phase.id);
        let mut ctx = TemplateContext::new()
            .with_scope(
                "pipeline",
                json!({
                    "id": self.pipeline.id,
                    "name": self.pipeline.name,
                    "description": self.pipeline.description,
                    "version": self.pipeline.version,
                }),
            )
            .with_scope("constants", Value::Object(self.pipeline.constants.clone()))
            .with_scope("st", Value::Object(self.static_context()))
            .with_scope("globals", Value::Object(self.globals()))
            .with_scope("stores", Value::Object(self.stores.clone()));

        let mut phase_scope = json!({
            "id": self.phase.id,
            "name": self.phase.name,
            "description": self.phase.description,
            "input": Value::Null,
            "output": Value::Null,
            "variables": Value::Object(self.phase.variables.clone()),
            "teamOutputs": {},
        });
        if let Some(state) = phase_state {
            phase_scope["input"] = state.input.clone();
            phase_scope["output"] = state.output.clone();
            phase_scope["variables"] = Value::Object(state.variables.clone());
            phase_scope["teamOutputs"] = Value::Object(state.team_outputs.clone());
            if self.phase.context.teams {
                ctx.set_scope("team", Value::Object(state.team_outputs.clone()));
            }
        }
        ctx.set_scope("phase", phase_scope);

        if let Some(prev) = self.previous_phase() {
            ctx.set_scope("previousPhase", prev);
        }

        let mut custom = match self.run.globals.get("custom") {
            Some(Value::Object(map)) => map.clone(),
            _ => self.pipeline.globals.custom.clone(),
        };
        let variables = phase_state
            .map(|s| s.variables.clone())
            .unwrap_or_else(|| self.phase.variables.clone());
        custom.extend(variables);
        ctx.merge_custom(custom);

        if let Some(action) = action {
            let state = self.run.action(&self.phase.id, &action.id);
            let input = input
                .cloned()
                .or_else(|| state.map(|s| s.input.clone()))
                .unwrap_or(Value::Null);
            ctx.set_scope(
                "action",
                json!({
                    "id": action.id,
                    "name": action.name,
                    "type": action.action_type.as_str(),
                    "input": input,
                    "output": state.map(|s| s.output.clone()).unwrap_or(Value::Null),
                }),
            );
            if let Some(prev) = self.previous_action(action) {
                ctx.set_scope("previousAction", prev);
            }
            let rendered = render_sections(&ctx, &action.context);
            ctx.set_scope("context", Value::String(rendered));
        } else {
            let rendered = render_sections(&ctx, &ContextOverrides::default());
            ctx.set_scope("context", Value::String(rendered));
        }
        ctx
    }

    /// Host context filtered by the pipeline's static flags and the phase's key list.
    fn static_context(&self) -> Map<String, Value> {
        let flags = &self.pipeline.static_context;
        let keys = &self.phase.context.static_keys;
        self.host
            .iter()
            .filter(|(k, _)| flags.is_empty() || flags.get(*k).copied().unwrap_or(false))
            .filter(|(k, _)| keys.is_empty() || keys.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn globals(&self) -> Map<String, Value> {
        let keys = &self.phase.context.globals;
        self.run
            .globals
            .iter()
            .filter(|(k, _)| keys.is_empty() || keys.contains(k) || *k == "custom")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn previous_phase(&self) -> Option<Value> {
        if !self.phase.context.include_previous_phase {
            return None;
        }
        let idx = self.pipeline.phases.iter().position(|p| p.id == self.phase.id)?;
        let prev = self.pipeline.phases.get(idx.checked_sub(1)?)?;
        let state = self.run.phase(&prev.id)?;
        Some(json!({
            "id": prev.id,
            "name": prev.name,
            "input": state.input,
            "output": state.output,
        }))
    }

    fn previous_action(&self, action: &Action) -> Option<Value> {
        let idx = self.phase.actions.iter().position(|a| a.id == action.id)?;
        let prev = self.phase.actions.get(idx.checked_sub(1)?)?;
        let state = self.run.action(&self.phase.id, &prev.id)?;
        Some(json!({
            "id": prev.id,
            "name": prev.name,
            "input": state.input,
            "output": state.output,
        }))
    }
}

fn section_content(ctx: &TemplateContext, key: &str) -> String {
    let value = match key {
        "instructions" | "styleGuide" | "outputFormat" => ctx.lookup(&format!("globals.{key}")),
        "previousPhase" => ctx.lookup("previousPhase.output"),
        "team" => ctx.scope("team").cloned(),
        "stores" => ctx.scope("stores").cloned(),
        "static" => ctx.scope("st").cloned(),
        _ => None,
    };
    match value {
        Some(Value::Object(map)) if map.is_empty() => String::new(),
        Some(v) => stringify(&v).trim().to_string(),
        None => String::new(),
    }
}

/// Render the context sections as `### Title` blocks.
///
/// `include` (when non-empty) limits the sections, `exclude` removes some, and
/// `priority` moves the named sections to the front in the listed order.
pub fn render_sections(ctx: &TemplateContext, overrides: &ContextOverrides) -> String {
    let mut order: Vec<&str> = overrides
        .priority
        .iter()
        .map(String::as_str)
        .filter(|k| CONTEXT_SECTIONS.contains(k))
        .collect();
    for key in CONTEXT_SECTIONS {
        if !order.contains(key) {
            order.push(key);
        }
    }

    order
        .into_iter()
        .filter(|k| overrides.include.is_empty() || overrides.include.iter().any(|i| i == k))
        .filter(|k| !overrides.exclude.iter().any(|e| e == k))
        .filter_map(|key| {
            let content = section_content(ctx, key);
            if content.is_empty() {
                None
            } else {
                Some(format!("### {}\n{}", humanize_key(key), content))
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
