//! Action handlers: one per action type, dispatched by an exhaustive match.

pub mod crud;
pub mod deliberative;
pub mod rag;
pub mod standard;
pub mod system;
pub mod user_gavel;
pub mod workshop;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use council_llm::{ChatRequest, LlmClient, Message};
use council_template::{stringify, TemplateContext, TemplateResolver};
use council_types::{CouncilError, ParticipantResponse, Result};

use crate::collaborators::{Agent, Collaborators};
use crate::definition::{Action, ActionType, Phase, Pipeline};
use crate::events::{EventBus, PipelineEvent};
use crate::gavel::GavelBoard;
use crate::participants::{ParticipantSource, ResolvedParticipant};

pub use crud::CrudHandler;
pub use deliberative::DeliberativeHandler;
pub use rag::{format_rag_results, RagHandler, NO_RESULTS};
pub use standard::StandardHandler;
pub use system::SystemHandler;
pub use user_gavel::UserGavelHandler;
pub use workshop::WorkshopHandler;

// ---------------------------------------------------------------------------
// ActionContext / ActionOutcome
// ---------------------------------------------------------------------------

/// Everything a handler may touch while executing one attempt of an action.
pub struct ActionContext<'a> {
    pub run_id: &'a str,
    pub pipeline: &'a Pipeline,
    pub phase: &'a Phase,
    pub action: &'a Action,
    /// The resolved (and transformed) action input.
    pub input: Value,
    /// Template context with the `action` scopes filled for this attempt.
    pub template: TemplateContext,
    pub resolver: &'a TemplateResolver,
    pub collaborators: &'a Collaborators,
    pub gavels: &'a GavelBoard,
    pub events: &'a EventBus,
    pub cancel: &'a CancellationToken,
    /// Thread created for the phase, if any.
    pub phase_thread: Option<&'a str>,
    /// Per-call timeout for collaborator calls made by the handler.
    pub timeout_ms: u64,
    /// Moves the action into its `respond` stage.
    pub on_respond: &'a (dyn Fn() + Send + Sync),
}

impl ActionContext<'_> {
    pub fn resolve(&self, template: &str) -> String {
        self.resolver.resolve(template, &self.template)
    }

    /// The action's prompt template resolved, or the stringified input when
    /// the template is empty.
    pub fn task(&self) -> String {
        if self.action.prompt_template.trim().is_empty() {
            stringify(&self.input)
        } else {
            self.resolve(&self.action.prompt_template)
        }
    }

    pub fn llm(&self) -> Result<&Arc<dyn LlmClient>> {
        self.collaborators.llm()
    }

    pub fn emit(&self, event: PipelineEvent) {
        self.events.emit(event);
    }

    fn responded(&self, response: &ParticipantResponse) {
        self.emit(PipelineEvent::ParticipantResponded {
            run_id: self.run_id.to_string(),
            action_id: self.action.id.clone(),
            position_id: response.position_id.clone(),
            round: response.round,
            success: response.is_success(),
        });
    }

    /// One chat call on behalf of a participant. Failures propagate.
    pub async fn ask(
        &self,
        participant: &ResolvedParticipant,
        prompt: &str,
        round: u32,
    ) -> Result<ParticipantResponse> {
        if self.cancel.is_cancelled() {
            return Err(CouncilError::Aborted);
        }
        let llm = self.llm()?;
        let mut messages = Vec::with_capacity(2);
        if !participant.agent.system_prompt.trim().is_empty() {
            messages.push(Message::system(participant.agent.system_prompt.clone()));
        }
        messages.push(Message::user(prompt));
        let request = ChatRequest::new(messages)
            .with_config(participant.agent.api_config.clone())
            .with_timeout_ms(self.timeout_ms);

        let reply = llm.chat(&request).await;
        let response = ParticipantResponse {
            position_id: participant.position_id.clone(),
            agent_id: Some(participant.agent.id.clone()).filter(|id| !id.is_empty()),
            name: participant.agent.name.clone(),
            role: participant.role.clone(),
            round,
            content: reply.as_ref().map(|r| r.content.clone()).unwrap_or_default(),
            error: reply.as_ref().err().map(|e| e.to_string()),
        };
        self.responded(&response);
        reply?;
        Ok(response)
    }
}

/// What a handler produces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutcome {
    pub output: Value,
    pub responses: Vec<ParticipantResponse>,
}

impl ActionOutcome {
    pub fn output(output: Value) -> Self {
        Self {
            output,
            responses: Vec::new(),
        }
    }

    pub fn with_responses(output: Value, responses: Vec<ParticipantResponse>) -> Self {
        Self { output, responses }
    }
}

// ---------------------------------------------------------------------------
// ActionHandler trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn action_type(&self) -> ActionType;

    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome>;
}

/// The handler for an action type.
pub fn handler_for(action_type: ActionType) -> &'static dyn ActionHandler {
    match action_type {
        ActionType::Standard => &StandardHandler,
        ActionType::CrudPipeline => &CrudHandler,
        ActionType::RagPipeline => &RagHandler,
        ActionType::DeliberativeRag => &DeliberativeHandler,
        ActionType::UserGavel => &UserGavelHandler,
        ActionType::System => &SystemHandler,
        ActionType::CharacterWorkshop => &WorkshopHandler,
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Seat a character agent as a participant.
pub fn character_seat(agent: Agent) -> ResolvedParticipant {
    let key = agent.character_id.clone().unwrap_or_else(|| agent.id.clone());
    ResolvedParticipant {
        position_id: format!("character:{key}"),
        role: agent.name.clone(),
        agent,
        position: None,
        source: ParticipantSource::Character,
    }
}

/// Render responses as `**Role**: content` blocks.
pub fn transcript(responses: &[ParticipantResponse]) -> String {
    responses
        .iter()
        .filter(|r| r.is_success())
        .map(|r| format!("**{}**: {}", r.role, r.content.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
pub(crate) mod testing {
    //! A minimal action context for handler tests.

    use super::*;
    use crate::definition::normalize_action;
    use serde_json::Map;

    fn noop() {}

    pub struct Harness {
        pub pipeline: Pipeline,
        pub phase: Phase,
        pub action: Action,
        pub resolver: TemplateResolver,
        pub collaborators: Collaborators,
        pub gavels: GavelBoard,
        pub events: EventBus,
        pub cancel: CancellationToken,
    }

    impl Harness {
        pub fn new(action: Action, collaborators: Collaborators) -> Self {
            let action = normalize_action(action, 5_000);
            let phase = Phase {
                id: "p".into(),
                name: "Phase".into(),
                actions: vec![action.clone()],
                ..Phase::default()
            };
            Self {
                pipeline: Pipeline {
                    id: "pipe".into(),
                    phases: vec![phase.clone()],
                    ..Pipeline::default()
                },
                phase,
                action,
                resolver: TemplateResolver::default(),
                collaborators,
                gavels: GavelBoard::new(),
                events: EventBus::default(),
                cancel: CancellationToken::new(),
            }
        }

        pub fn context(&self, input: Value) -> ActionContext<'_> {
            let mut template = TemplateContext::from_map(Map::new());
            template.set_scope(
                "phase",
                serde_json::json!({"id": "p", "input": input.clone()}),
            );
            template.set_input(input.clone());
            ActionContext {
                run_id: "run-test",
                pipeline: &self.pipeline,
                phase: &self.phase,
                action: &self.action,
                input,
                template,
                resolver: &self.resolver,
                collaborators: &self.collaborators,
                gavels: &self.gavels,
                events: &self.events,
                cancel: &self.cancel,
                phase_thread: None,
                timeout_ms: 5_000,
                on_respond: &noop,
            }
        }

        pub async fn execute(&self, input: Value) -> Result<ActionOutcome> {
            let ctx = self.context(input);
            handler_for(self.action.action_type).execute(&ctx).await
        }
    }
}
