//! Pipeline execution engine, action handlers, participant resolution and routing.
//!
//! This crate implements the Council pipeline runner: phase and action
//! lifecycles, retry and timeout supervision, participant resolution and
//! orchestration, output routing and phase consolidation, human gavels,
//! context assembly and the built-in lint rules.

pub mod collaborators;
pub mod context;
pub mod definition;
pub mod engine;
pub mod events;
pub mod gavel;
pub mod handlers;
pub mod memory;
pub mod orchestration;
pub mod participants;
pub mod retry;
pub mod routing;
pub mod validation;

pub use collaborators::{
    Agent, AgentDirectory, CharacterDirectory, Collaborators, CrudPipelineDef, CurationStore,
    Position, RagHit, RagQuery, RagResponse, Team, ThreadLog, ThreadMessage,
};
pub use context::{read_stores, render_sections, ContextAssembler, CONTEXT_SECTIONS};
pub use definition::{
    normalize_action, normalize_phase, normalize_pipeline, Action, ActionType, Consolidation,
    ExecutionMode, InputSource, Orchestration, OutputTarget, Phase, Pipeline, TriggerKind,
    DEFAULT_ACTION_TIMEOUT_MS,
};
pub use engine::{EngineConfig, PipelineEngine, RunOptions};
pub use events::{EventBus, EventListener, PipelineEvent};
pub use gavel::{GavelBoard, GavelKey, GavelOutcome, PendingGavel};
pub use handlers::{handler_for, ActionContext, ActionHandler, ActionOutcome};
pub use memory::{
    DirectoryFixtures, InMemoryAgentDirectory, InMemoryCharacterDirectory, InMemoryCurationStore,
    InMemoryThreadLog, StoreData,
};
pub use orchestration::{final_output, lengths_agree, Orchestrator};
pub use participants::{ParticipantResolver, ParticipantSource, ResolvedParticipant};
pub use retry::{execute_with_retry, BackoffPolicy};
pub use routing::{consolidate, get_path, set_path, Destination};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
