//! Pipeline validation: lint rules and diagnostics.
//!
//! Provides built-in rules that check structural and semantic correctness of
//! a [`Pipeline`] document before it is registered. Call [`validate`] for
//! advisory diagnostics or [`validate_or_raise`] to fail on any
//! `Error`-severity issue.

use std::collections::HashSet;

use council_types::{CouncilError, Result};

use crate::definition::{
    is_valid_id, Action, ActionType, Consolidation, CrudOperation, ExecutionMode, Phase, Pipeline,
};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub phase_id: Option<String>,
    pub action_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        write!(f, "{level}[{}]", self.rule)?;
        match (&self.phase_id, &self.action_id) {
            (Some(p), Some(a)) => write!(f, " {p}/{a}")?,
            (Some(p), None) => write!(f, " {p}")?,
            _ => {}
        }
        write!(f, ": {}", self.message)
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic>;
}

fn diag(
    rule: &dyn LintRule,
    severity: Severity,
    message: String,
    phase: Option<&Phase>,
    action: Option<&Action>,
) -> Diagnostic {
    Diagnostic {
        rule: rule.name().into(),
        severity,
        message,
        phase_id: phase.map(|p| p.id.trim().to_string()),
        action_id: action.map(|a| a.id.trim().to_string()),
    }
}

fn actions(pipeline: &Pipeline) -> impl Iterator<Item = (&Phase, &Action)> {
    pipeline
        .phases
        .iter()
        .flat_map(|p| p.actions.iter().map(move |a| (p, a)))
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct PipelineIdRule;
impl LintRule for PipelineIdRule {
    fn name(&self) -> &str { "pipeline_id" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let id = pipeline.id.trim();
        if is_valid_id(id) {
            return vec![];
        }
        let message = if id.is_empty() {
            "Pipeline id is missing".to_string()
        } else {
            format!("Pipeline id '{id}' may only contain letters, digits, '_' or '-'")
        };
        vec![diag(self, Severity::Error, message, None, None)]
    }
}

struct PhaseIdsRule;
impl LintRule for PhaseIdsRule {
    fn name(&self) -> &str { "phase_ids" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for phase in &pipeline.phases {
            let id = phase.id.trim();
            if !is_valid_id(id) {
                out.push(diag(
                    self,
                    Severity::Error,
                    format!("Phase id '{id}' is missing or contains invalid characters"),
                    Some(phase),
                    None,
                ));
            } else if !seen.insert(id) {
                out.push(diag(
                    self,
                    Severity::Error,
                    format!("Duplicate phase id '{id}'"),
                    Some(phase),
                    None,
                ));
            }
        }
        out
    }
}

struct ActionIdsRule;
impl LintRule for ActionIdsRule {
    fn name(&self) -> &str { "action_ids" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for phase in &pipeline.phases {
            let mut seen = HashSet::new();
            for action in &phase.actions {
                let id = action.id.trim();
                if !is_valid_id(id) {
                    out.push(diag(
                        self,
                        Severity::Error,
                        format!("Action id '{id}' is missing or contains invalid characters"),
                        Some(phase),
                        Some(action),
                    ));
                } else if !seen.insert(id) {
                    out.push(diag(
                        self,
                        Severity::Error,
                        format!("Duplicate action id '{id}' in phase '{}'", phase.id.trim()),
                        Some(phase),
                        Some(action),
                    ));
                }
            }
        }
        out
    }
}

struct EmptyPipelineRule;
impl LintRule for EmptyPipelineRule {
    fn name(&self) -> &str { "empty_pipeline" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        if pipeline.phases.is_empty() {
            return vec![diag(
                self,
                Severity::Warning,
                "Pipeline has no phases; a run completes immediately with no output".into(),
                None,
                None,
            )];
        }
        pipeline
            .phases
            .iter()
            .filter(|p| p.actions.is_empty())
            .map(|p| {
                diag(
                    self,
                    Severity::Warning,
                    format!("Phase '{}' has no actions", p.id.trim()),
                    Some(p),
                    None,
                )
            })
            .collect()
    }
}

/// A type-specific block on an action of another type is ignored and dropped.
struct TypeConfigRule;
impl LintRule for TypeConfigRule {
    fn name(&self) -> &str { "type_config" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        actions(pipeline)
            .flat_map(|(phase, action)| {
                action
                    .type_blocks()
                    .into_iter()
                    .filter(|block| *block != action.action_type)
                    .map(move |block| {
                        diag(
                            self,
                            Severity::Warning,
                            format!(
                                "Configuration for '{block}' is ignored on a '{}' action",
                                action.action_type
                            ),
                            Some(phase),
                            Some(action),
                        )
                    })
            })
            .collect()
    }
}

struct TriggerTargetRule;
impl LintRule for TriggerTargetRule {
    fn name(&self) -> &str { "trigger_target" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for (phase, action) in actions(pipeline) {
            let trigger = &action.execution.trigger;
            if !trigger.kind.waits() {
                continue;
            }
            if action.execution.mode != ExecutionMode::Async {
                out.push(diag(
                    self,
                    Severity::Info,
                    "Trigger is only consulted for async actions and will be ignored".into(),
                    Some(phase),
                    Some(action),
                ));
                continue;
            }
            match trigger.target_action_id.as_deref().map(str::trim) {
                None | Some("") => out.push(diag(
                    self,
                    Severity::Error,
                    "Await/on trigger needs a targetActionId".into(),
                    Some(phase),
                    Some(action),
                )),
                Some(target) if target == action.id.trim() => out.push(diag(
                    self,
                    Severity::Error,
                    "Action cannot wait on itself".into(),
                    Some(phase),
                    Some(action),
                )),
                Some(target) if !phase.actions.iter().any(|a| a.id.trim() == target) => {
                    out.push(diag(
                        self,
                        Severity::Error,
                        format!("Trigger target '{target}' is not an action of this phase"),
                        Some(phase),
                        Some(action),
                    ))
                }
                Some(_) => {}
            }
        }
        out
    }
}

struct DesignatedOutputRule;
impl LintRule for DesignatedOutputRule {
    fn name(&self) -> &str { "designated_output" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for phase in &pipeline.phases {
            if phase.output.consolidation != Consolidation::Designated {
                continue;
            }
            match phase.output.action_id.as_deref().map(str::trim) {
                None | Some("") => out.push(diag(
                    self,
                    Severity::Error,
                    "Designated consolidation needs output.actionId".into(),
                    Some(phase),
                    None,
                )),
                Some(id) if !phase.actions.iter().any(|a| a.id.trim() == id) => {
                    out.push(diag(
                        self,
                        Severity::Error,
                        format!("Designated action '{id}' does not exist in this phase"),
                        Some(phase),
                        None,
                    ))
                }
                Some(_) => {}
            }
        }
        out
    }
}

struct OrchestrationRoundsRule;
impl LintRule for OrchestrationRoundsRule {
    fn name(&self) -> &str { "orchestration_rounds" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        actions(pipeline)
            .filter(|(_, a)| {
                a.action_type == ActionType::Standard
                    && a.participants.orchestration.is_multi_round()
                    && a.participants.max_rounds == 0
            })
            .map(|(phase, action)| {
                diag(
                    self,
                    Severity::Warning,
                    format!(
                        "maxRounds is 0 for {} orchestration; one round will run",
                        action.participants.orchestration.as_str()
                    ),
                    Some(phase),
                    Some(action),
                )
            })
            .collect()
    }
}

struct CrudTargetRule;
impl LintRule for CrudTargetRule {
    fn name(&self) -> &str { "crud_target" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for (phase, action) in actions(pipeline) {
            if action.action_type != ActionType::CrudPipeline {
                continue;
            }
            let Some(cfg) = &action.crud_config else {
                out.push(diag(
                    self,
                    Severity::Error,
                    "crud_pipeline action has no crudConfig".into(),
                    Some(phase),
                    Some(action),
                ));
                continue;
            };
            let named = cfg.crud_pipeline_id.as_deref().is_some_and(|s| !s.trim().is_empty());
            if cfg.store_id.trim().is_empty() && !named {
                out.push(diag(
                    self,
                    Severity::Error,
                    "crudConfig needs a storeId or a crudPipelineId".into(),
                    Some(phase),
                    Some(action),
                ));
            }
            if !named
                && matches!(cfg.operation, CrudOperation::Update | CrudOperation::Delete)
                && cfg.entry_id.trim().is_empty()
            {
                out.push(diag(
                    self,
                    Severity::Warning,
                    "update/delete without entryId will use the input's 'id' field".into(),
                    Some(phase),
                    Some(action),
                ));
            }
        }
        out
    }
}

struct RagTargetRule;
impl LintRule for RagTargetRule {
    fn name(&self) -> &str { "rag_target" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for (phase, action) in actions(pipeline) {
            let missing = match action.action_type {
                ActionType::RagPipeline => action
                    .rag_config
                    .as_ref()
                    .map_or(true, |c| c.pipeline_id.trim().is_empty()),
                ActionType::Standard => {
                    action.rag.enabled && action.rag.pipeline_id.trim().is_empty()
                }
                _ => false,
            };
            if missing {
                out.push(diag(
                    self,
                    Severity::Warning,
                    "Retrieval is configured without a pipelineId; the query will run against every store"
                        .into(),
                    Some(phase),
                    Some(action),
                ));
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(pipeline: &Pipeline) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(PipelineIdRule),
        Box::new(PhaseIdsRule),
        Box::new(ActionIdsRule),
        Box::new(EmptyPipelineRule),
        Box::new(TypeConfigRule),
        Box::new(TriggerTargetRule),
        Box::new(DesignatedOutputRule),
        Box::new(OrchestrationRoundsRule),
        Box::new(CrudTargetRule),
        Box::new(RagTargetRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(pipeline));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(pipeline: &Pipeline) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(pipeline);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.clone())
        .collect();
    if !errors.is_empty() {
        return Err(CouncilError::ValidationError(errors.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn load(value: serde_json::Value) -> Pipeline {
        Pipeline::from_json(value).unwrap()
    }

    fn rules_hit(diags: &[Diagnostic]) -> Vec<&str> {
        diags.iter().map(|d| d.rule.as_str()).collect()
    }

    #[test]
    fn valid_pipeline_passes() {
        let p = load(json!({
            "id": "ok",
            "phases": [{"id": "one", "actions": [{"id": "a", "actionType": "system"}]}]
        }));
        assert!(validate(&p).is_empty());
        assert!(validate_or_raise(&p).is_ok());
    }

    #[test]
    fn bad_pipeline_id_is_error() {
        let p = load(json!({"id": "bad id", "phases": []}));
        let diags = validate(&p);
        assert!(diags
            .iter()
            .any(|d| d.rule == "pipeline_id" && d.severity == Severity::Error));
        assert!(validate_or_raise(&p).is_err());
    }

    #[test]
    fn duplicate_phase_and_action_ids() {
        let p = load(json!({
            "id": "dups",
            "phases": [
                {"id": "a", "actions": [{"id": "x"}, {"id": "x"}]},
                {"id": "a", "actions": [{"id": "x"}]}
            ]
        }));
        let diags = validate(&p);
        let hit = rules_hit(&diags);
        assert!(hit.contains(&"phase_ids"));
        assert!(hit.contains(&"action_ids"));
        // same action id in different phases is fine
        assert_eq!(diags.iter().filter(|d| d.rule == "action_ids").count(), 1);

        let err = validate_or_raise(&p).unwrap_err().to_string();
        assert!(err.contains("Duplicate phase id 'a'"));
    }

    #[test]
    fn empty_pipeline_is_only_a_warning() {
        let p = load(json!({"id": "empty"}));
        let diags = validate_or_raise(&p).unwrap();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].severity, Severity::Warning);
    }

    #[test]
    fn mismatched_type_block_warns() {
        let p = load(json!({
            "id": "p",
            "phases": [{"id": "ph", "actions": [
                {"id": "a", "actionType": "system", "crudConfig": {"storeId": "s"}}
            ]}]
        }));
        let diags = validate(&p);
        assert_eq!(rules_hit(&diags), vec!["type_config"]);
        assert_eq!(diags[0].action_id.as_deref(), Some("a"));
        assert!(diags[0].message.contains("crud_pipeline"));
    }

    #[test]
    fn trigger_target_must_exist() {
        let p = load(json!({
            "id": "p",
            "phases": [{"id": "ph", "actions": [
                {"id": "a", "execution": {"mode": "async", "trigger": {"type": "await", "targetActionId": "ghost"}}},
                {"id": "b", "execution": {"mode": "async", "trigger": {"type": "on"}}}
            ]}]
        }));
        let diags = validate(&p);
        assert_eq!(
            diags.iter().filter(|d| d.rule == "trigger_target").count(),
            2
        );
    }

    #[test]
    fn designated_output_must_name_an_action() {
        let p = load(json!({
            "id": "p",
            "phases": [{"id": "ph", "output": {"consolidation": "designated", "actionId": "nope"},
                        "actions": [{"id": "a"}]}]
        }));
        assert!(rules_hit(&validate(&p)).contains(&"designated_output"));
    }

    #[test]
    fn crud_needs_a_store() {
        let p = load(json!({
            "id": "p",
            "phases": [{"id": "ph", "actions": [
                {"id": "a", "actionType": "crud_pipeline", "crudConfig": {"operation": "read"}}
            ]}]
        }));
        let diags = validate(&p);
        assert!(diags
            .iter()
            .any(|d| d.rule == "crud_target" && d.severity == Severity::Error));
    }

    #[test]
    fn diagnostic_display() {
        let d = Diagnostic {
            rule: "action_ids".into(),
            severity: Severity::Error,
            message: "Duplicate action id 'x'".into(),
            phase_id: Some("draft".into()),
            action_id: Some("x".into()),
        };
        assert_eq!(d.to_string(), "error[action_ids] draft/x: Duplicate action id 'x'");
    }
}
