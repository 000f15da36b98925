//! Run state tree: one `Run` owns its `PhaseState`s, which own their `ActionState`s.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Lifecycles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Error,
}

/// Position of a phase in its lifecycle.
///
/// `Respond` is only visited when the phase's gavel is enabled; it sits between
/// `AfterActions` and `End`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseLifecycle {
    Start,
    BeforeActions,
    InProgress,
    AfterActions,
    Respond,
    End,
}

/// Position of an action in its lifecycle.
///
/// The declaration order is the total order used by trigger waits:
/// `called < start < in_progress < complete < respond`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ActionLifecycle {
    #[default]
    Called,
    Start,
    InProgress,
    Complete,
    Respond,
}

impl PhaseLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseLifecycle::Start => "start",
            PhaseLifecycle::BeforeActions => "before_actions",
            PhaseLifecycle::InProgress => "in_progress",
            PhaseLifecycle::AfterActions => "after_actions",
            PhaseLifecycle::Respond => "respond",
            PhaseLifecycle::End => "end",
        }
    }
}

impl ActionLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionLifecycle::Called => "called",
            ActionLifecycle::Start => "start",
            ActionLifecycle::InProgress => "in_progress",
            ActionLifecycle::Complete => "complete",
            ActionLifecycle::Respond => "respond",
        }
    }
}

impl fmt::Display for PhaseLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ActionLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ParticipantResponse
// ---------------------------------------------------------------------------

/// One participant's contribution to a standard (or workshop/deliberative) action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantResponse {
    pub position_id: String,
    pub agent_id: Option<String>,
    pub name: String,
    pub role: String,
    pub round: u32,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ParticipantResponse {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

// ---------------------------------------------------------------------------
// ActionState / PhaseState / Run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionState {
    pub lifecycle: ActionLifecycle,
    pub input: Value,
    pub output: Value,
    pub responses: Vec<ParticipantResponse>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseState {
    pub lifecycle: PhaseLifecycle,
    pub input: Value,
    pub output: Value,
    pub actions: HashMap<String, ActionState>,
    pub team_outputs: Map<String, Value>,
    pub variables: Map<String, Value>,
    /// Value routed to the next action by an action whose output target is `nextAction`.
    pub next_action_input: Option<Value>,
    pub thread_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl PhaseState {
    pub fn new(input: Value, variables: Map<String, Value>) -> Self {
        Self {
            lifecycle: PhaseLifecycle::Start,
            input,
            output: Value::Null,
            actions: HashMap::new(),
            team_outputs: Map::new(),
            variables,
            next_action_input: None,
            thread_id: None,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        }
    }
}

/// The ephemeral state of one pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub pipeline_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub user_input: Value,
    pub globals: Map<String, Value>,
    pub phases: HashMap<String, PhaseState>,
    pub current_phase_id: Option<String>,
    pub current_phase_index: Option<usize>,
    pub current_action_id: Option<String>,
    pub current_action_index: Option<usize>,
    pub final_output: Value,
    pub error: Option<String>,
}

impl Run {
    /// Create a fresh running `Run` with a random id.
    pub fn new(pipeline_id: impl Into<String>, user_input: Value, globals: Map<String, Value>) -> Self {
        Self {
            id: format!("run-{}", uuid::Uuid::new_v4()),
            pipeline_id: pipeline_id.into(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            user_input,
            globals,
            phases: HashMap::new(),
            current_phase_id: None,
            current_phase_index: None,
            current_action_id: None,
            current_action_index: None,
            final_output: Value::Null,
            error: None,
        }
    }

    pub fn phase(&self, phase_id: &str) -> Option<&PhaseState> {
        self.phases.get(phase_id)
    }

    pub fn phase_mut(&mut self, phase_id: &str) -> Option<&mut PhaseState> {
        self.phases.get_mut(phase_id)
    }

    pub fn action(&self, phase_id: &str, action_id: &str) -> Option<&ActionState> {
        self.phases.get(phase_id)?.actions.get(action_id)
    }

    pub fn action_mut(&mut self, phase_id: &str, action_id: &str) -> Option<&mut ActionState> {
        self.phases.get_mut(phase_id)?.actions.get_mut(action_id)
    }

    /// Wall-clock duration of the run so far (or in total, once ended).
    pub fn duration_ms(&self) -> u64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RunStatus::Completed | RunStatus::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_lifecycle_total_order() {
        assert!(ActionLifecycle::Called < ActionLifecycle::Start);
        assert!(ActionLifecycle::Start < ActionLifecycle::InProgress);
        assert!(ActionLifecycle::InProgress < ActionLifecycle::Complete);
        assert!(ActionLifecycle::Complete < ActionLifecycle::Respond);
    }

    #[test]
    fn lifecycle_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&PhaseLifecycle::BeforeActions).unwrap(),
            "\"before_actions\""
        );
        assert_eq!(
            serde_json::to_string(&ActionLifecycle::InProgress).unwrap(),
            "\"in_progress\""
        );
        let status: RunStatus = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(status, RunStatus::Completed);
    }

    #[test]
    fn lifecycle_display_matches_serde_names() {
        assert_eq!(PhaseLifecycle::AfterActions.to_string(), "after_actions");
        assert_eq!(ActionLifecycle::Complete.to_string(), "complete");
        assert_eq!(RunStatus::Error.to_string(), "error");
    }

    #[test]
    fn new_run_is_running_with_prefixed_id() {
        let run = Run::new("p1", json!("hello"), Map::new());
        assert!(run.id.starts_with("run-"));
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.user_input, json!("hello"));
        assert!(run.phases.is_empty());
        assert!(!run.is_terminal());
    }

    #[test]
    fn run_action_accessors() {
        let mut run = Run::new("p1", Value::Null, Map::new());
        let mut phase = PhaseState::new(json!("in"), Map::new());
        phase.actions.insert("a1".into(), ActionState::default());
        run.phases.insert("ph".into(), phase);

        run.action_mut("ph", "a1").unwrap().lifecycle = ActionLifecycle::Complete;
        assert_eq!(
            run.action("ph", "a1").unwrap().lifecycle,
            ActionLifecycle::Complete
        );
        assert!(run.action("ph", "missing").is_none());
        assert!(run.action("nope", "a1").is_none());
    }

    #[test]
    fn run_serializes_camel_case_fields() {
        let run = Run::new("p1", json!("x"), Map::new());
        let v = serde_json::to_value(&run).unwrap();
        assert_eq!(v["pipelineId"], "p1");
        assert_eq!(v["status"], "running");
        assert!(v.get("finalOutput").is_some());
    }
}
