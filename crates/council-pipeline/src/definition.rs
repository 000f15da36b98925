//! Pipeline documents: pipelines, phases, actions, and their configuration
//! blocks, plus normalization.
//!
//! Every struct deserializes with all fields defaulted so partial JSON
//! documents load; [`normalize_pipeline`] then fills the remaining derived
//! defaults so the engine never has to ask whether a field was present.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use council_types::{ActionLifecycle, CouncilError, Result};

/// Default execution timeout applied when an action leaves `timeoutMs` unset.
pub const DEFAULT_ACTION_TIMEOUT_MS: u64 = 300_000;

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Pipeline {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    /// Host-context keys (`st.*`) this pipeline may see. Empty exposes all.
    pub static_context: BTreeMap<String, bool>,
    pub globals: Globals,
    pub constants: Map<String, Value>,
    pub phases: Vec<Phase>,
}

impl Pipeline {
    pub fn from_json(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn phase(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }

    pub fn action_count(&self) -> usize {
        self.phases.iter().map(|p| p.actions.len()).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Globals {
    pub instructions: String,
    pub output_format: String,
    pub style_guide: String,
    pub custom: Map<String, Value>,
}

impl Globals {
    /// The run-time globals map a new run starts from.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("instructions".into(), Value::String(self.instructions.clone()));
        map.insert("outputFormat".into(), Value::String(self.output_format.clone()));
        map.insert("styleGuide".into(), Value::String(self.style_guide.clone()));
        map.insert("custom".into(), Value::Object(self.custom.clone()));
        map
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Phase {
    pub id: String,
    pub name: String,
    pub description: String,
    pub teams: Vec<String>,
    pub thread: ThreadConfig,
    pub context: PhaseContextConfig,
    pub actions: Vec<Action>,
    pub output: PhaseOutputConfig,
    pub gavel: PhaseGavelConfig,
    pub variables: Map<String, Value>,
}

impl Phase {
    pub fn action(&self, id: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.id == id)
    }

    /// Whether the phase visits the `respond` lifecycle stage.
    pub fn needs_review(&self) -> bool {
        self.gavel.enabled || self.output.consolidation == Consolidation::UserGavel
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThreadConfig {
    pub enabled: bool,
    /// Thread name template; defaults to the phase name.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PhaseContextConfig {
    /// Host-context keys to expose; empty means every key the pipeline allows.
    #[serde(rename = "static")]
    pub static_keys: Vec<String>,
    /// Global keys to expose; empty means all.
    pub globals: Vec<String>,
    pub include_previous_phase: bool,
    pub teams: bool,
    /// Curation stores read into the `stores` scope.
    pub stores: Vec<String>,
}

impl Default for PhaseContextConfig {
    fn default() -> Self {
        Self {
            static_keys: Vec::new(),
            globals: Vec::new(),
            include_previous_phase: true,
            teams: true,
            stores: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consolidation {
    #[default]
    Last,
    First,
    Merge,
    Designated,
    Synthesize,
    UserGavel,
}

impl Consolidation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Consolidation::Last => "last",
            Consolidation::First => "first",
            Consolidation::Merge => "merge",
            Consolidation::Designated => "designated",
            Consolidation::Synthesize => "synthesize",
            Consolidation::UserGavel => "user_gavel",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PhaseOutputConfig {
    pub consolidation: Consolidation,
    /// Action whose output is used verbatim under `designated`.
    pub action_id: Option<String>,
    pub synthesis_prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PhaseGavelConfig {
    pub enabled: bool,
    pub prompt: String,
    pub timeout_ms: Option<u64>,
    pub can_skip: bool,
}

impl Default for PhaseGavelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prompt: String::new(),
            timeout_ms: None,
            can_skip: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    #[default]
    Standard,
    CrudPipeline,
    RagPipeline,
    DeliberativeRag,
    UserGavel,
    System,
    CharacterWorkshop,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Standard => "standard",
            ActionType::CrudPipeline => "crud_pipeline",
            ActionType::RagPipeline => "rag_pipeline",
            ActionType::DeliberativeRag => "deliberative_rag",
            ActionType::UserGavel => "user_gavel",
            ActionType::System => "system",
            ActionType::CharacterWorkshop => "character_workshop",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Action {
    pub id: String,
    pub name: String,
    pub description: String,
    pub action_type: ActionType,
    pub execution: ExecutionConfig,
    pub participants: ParticipantsConfig,
    pub input: InputConfig,
    pub output: OutputConfig,
    pub context: ContextOverrides,
    pub rag: RagPrefetch,
    pub prompt_template: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crud_config: Option<CrudConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rag_config: Option<RagConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deliberative_config: Option<DeliberativeConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gavel_config: Option<GavelConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_workshop_config: Option<WorkshopConfig>,
}

impl Action {
    pub fn new(id: impl Into<String>, action_type: ActionType) -> Self {
        Self {
            id: id.into(),
            action_type,
            ..Self::default()
        }
    }

    /// Names of the type-specific blocks present on this action.
    pub fn type_blocks(&self) -> Vec<ActionType> {
        let mut blocks = Vec::new();
        if self.crud_config.is_some() {
            blocks.push(ActionType::CrudPipeline);
        }
        if self.rag_config.is_some() {
            blocks.push(ActionType::RagPipeline);
        }
        if self.deliberative_config.is_some() {
            blocks.push(ActionType::DeliberativeRag);
        }
        if self.gavel_config.is_some() {
            blocks.push(ActionType::UserGavel);
        }
        if self.character_workshop_config.is_some() {
            blocks.push(ActionType::CharacterWorkshop);
        }
        blocks
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sync,
    Async,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionConfig {
    pub mode: ExecutionMode,
    pub trigger: Trigger,
    /// Zero until normalization applies the engine default.
    pub timeout_ms: u64,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    #[default]
    Sequential,
    Await,
    On,
    Immediate,
}

impl TriggerKind {
    pub fn waits(&self) -> bool {
        matches!(self, TriggerKind::Await | TriggerKind::On)
    }
}

fn complete() -> ActionLifecycle {
    ActionLifecycle::Complete
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    #[serde(rename = "type", default)]
    pub kind: TriggerKind,
    #[serde(default)]
    pub target_action_id: Option<String>,
    #[serde(default = "complete")]
    pub target_state: ActionLifecycle,
}

impl Default for Trigger {
    fn default() -> Self {
        Self {
            kind: TriggerKind::Sequential,
            target_action_id: None,
            target_state: ActionLifecycle::Complete,
        }
    }
}

// ---------------------------------------------------------------------------
// Participants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orchestration {
    #[default]
    Sequential,
    Parallel,
    RoundRobin,
    Consensus,
}

impl Orchestration {
    pub fn as_str(&self) -> &'static str {
        match self {
            Orchestration::Sequential => "sequential",
            Orchestration::Parallel => "parallel",
            Orchestration::RoundRobin => "round_robin",
            Orchestration::Consensus => "consensus",
        }
    }

    pub fn is_multi_round(&self) -> bool {
        matches!(self, Orchestration::RoundRobin | Orchestration::Consensus)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParticipantsConfig {
    pub position_ids: Vec<String>,
    pub team_ids: Vec<String>,
    pub orchestration: Orchestration,
    pub max_rounds: u32,
    pub dynamic_experts: DynamicExpertsConfig,
    pub characters: CharacterParticipation,
}

impl Default for ParticipantsConfig {
    fn default() -> Self {
        Self {
            position_ids: Vec::new(),
            team_ids: Vec::new(),
            orchestration: Orchestration::Sequential,
            max_rounds: 3,
            dynamic_experts: DynamicExpertsConfig::default(),
            characters: CharacterParticipation::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExpertSource {
    #[default]
    Input,
    Prompt,
    PhaseInput,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DynamicExpertsConfig {
    pub enabled: bool,
    pub source: ExpertSource,
    pub custom_text: String,
    pub max_smes: usize,
    pub default_position_id: Option<String>,
}

impl Default for DynamicExpertsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            source: ExpertSource::Input,
            custom_text: String::new(),
            max_smes: 2,
            default_position_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacterMode {
    #[default]
    Explicit,
    Spawned,
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CharacterParticipation {
    pub enabled: bool,
    pub mode: CharacterMode,
    pub character_ids: Vec<String>,
    pub agent_type: Option<String>,
    pub max_characters: usize,
    pub selection_prompt: String,
}

impl Default for CharacterParticipation {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: CharacterMode::Explicit,
            character_ids: Vec::new(),
            agent_type: None,
            max_characters: 3,
            selection_prompt: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Input / output / context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InputSource {
    #[default]
    PhaseInput,
    PreviousAction,
    Global,
    Store,
    Custom,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InputConfig {
    pub source: InputSource,
    /// Action id (`previousAction`), dot path (`global`) or `store[.entry]` (`store`).
    pub key: String,
    /// Literal or templated value for the `custom` source.
    pub value: Value,
    /// Template applied to the sourced input; `{{input}}` is the sourced value.
    pub transform: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutputTarget {
    #[default]
    PhaseOutput,
    TeamOutput,
    Global,
    Store,
    NextAction,
    Thread,
}

impl OutputTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputTarget::PhaseOutput => "phaseOutput",
            OutputTarget::TeamOutput => "teamOutput",
            OutputTarget::Global => "global",
            OutputTarget::Store => "store",
            OutputTarget::NextAction => "nextAction",
            OutputTarget::Thread => "thread",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputConfig {
    pub target: OutputTarget,
    /// Team id, global dot path, `store[.entry]`, or thread id depending on `target`.
    pub target_key: String,
    pub append: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextOverrides {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub priority: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RagPrefetch {
    pub enabled: bool,
    pub pipeline_id: String,
    pub query_template: String,
    pub limit: usize,
    pub inject: bool,
}

impl Default for RagPrefetch {
    fn default() -> Self {
        Self {
            enabled: false,
            pipeline_id: String::new(),
            query_template: String::new(),
            limit: 5,
            inject: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Type-specific blocks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrudOperation {
    Create,
    #[default]
    Read,
    Update,
    Delete,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrudConfig {
    /// Named CRUD pipeline registered with the curation store; its settings
    /// fill any field left empty here.
    pub crud_pipeline_id: Option<String>,
    pub store_id: String,
    pub operation: CrudOperation,
    /// Entry id template for read/update/delete.
    pub entry_id: String,
    /// Target field -> source path (or template) over the action input.
    pub input_mapping: BTreeMap<String, String>,
    /// Target field -> source path over the store result.
    pub output_mapping: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RagConfig {
    pub pipeline_id: String,
    pub query_template: String,
    pub limit: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            pipeline_id: String::new(),
            query_template: String::new(),
            limit: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliberativeConfig {
    pub query_position_ids: Vec<String>,
    pub curation_position_ids: Vec<String>,
    pub max_rounds: u32,
    pub rag_pipeline_id: String,
    /// Retrieval hits fetched per question.
    pub limit: usize,
    pub log_to_thread: bool,
    pub thread_name: String,
    pub synthesize: bool,
    pub synthesis_prompt: String,
}

impl Default for DeliberativeConfig {
    fn default() -> Self {
        Self {
            query_position_ids: Vec::new(),
            curation_position_ids: Vec::new(),
            max_rounds: 3,
            rag_pipeline_id: String::new(),
            limit: 5,
            log_to_thread: false,
            thread_name: String::new(),
            synthesize: true,
            synthesis_prompt: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GavelConfig {
    pub prompt: String,
    pub timeout_ms: Option<u64>,
    pub can_skip: bool,
}

impl Default for GavelConfig {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            timeout_ms: None,
            can_skip: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkshopMode {
    #[default]
    Refinement,
    Consistency,
    Collaboration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkshopConfig {
    pub mode: WorkshopMode,
    /// Characters taking part; empty means every character agent.
    pub character_ids: Vec<String>,
    pub topic_template: String,
    pub rounds: u32,
    pub synthesize: bool,
}

impl Default for WorkshopConfig {
    fn default() -> Self {
        Self {
            mode: WorkshopMode::Refinement,
            character_ids: Vec::new(),
            topic_template: String::new(),
            rounds: 2,
            synthesize: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Fill derived defaults. Normalizing an already-normalized pipeline is a no-op.
pub fn normalize_pipeline(mut pipeline: Pipeline, default_timeout_ms: u64) -> Pipeline {
    pipeline.id = pipeline.id.trim().to_string();
    if pipeline.name.trim().is_empty() {
        pipeline.name = pipeline.id.clone();
    }
    if pipeline.version.trim().is_empty() {
        pipeline.version = "1.0.0".into();
    }
    pipeline.phases = pipeline
        .phases
        .into_iter()
        .map(|p| normalize_phase(p, default_timeout_ms))
        .collect();
    pipeline
}

pub fn normalize_phase(mut phase: Phase, default_timeout_ms: u64) -> Phase {
    phase.id = phase.id.trim().to_string();
    if phase.name.trim().is_empty() {
        phase.name = phase.id.clone();
    }
    if phase.thread.kind.trim().is_empty() {
        phase.thread.kind = "phase".into();
    }
    phase.actions = phase
        .actions
        .into_iter()
        .map(|a| normalize_action(a, default_timeout_ms))
        .collect();
    phase
}

pub fn normalize_action(mut action: Action, default_timeout_ms: u64) -> Action {
    action.id = action.id.trim().to_string();
    if action.name.trim().is_empty() {
        action.name = action.id.clone();
    }
    if action.execution.timeout_ms == 0 {
        action.execution.timeout_ms = default_timeout_ms;
    }
    action.participants.max_rounds = action.participants.max_rounds.max(1);

    let kind = action.action_type;
    let keep = |t: ActionType| t == kind;
    if !keep(ActionType::CrudPipeline) {
        action.crud_config = None;
    } else {
        action.crud_config.get_or_insert_with(CrudConfig::default);
    }
    if !keep(ActionType::RagPipeline) {
        action.rag_config = None;
    } else {
        action.rag_config.get_or_insert_with(RagConfig::default);
    }
    if !keep(ActionType::DeliberativeRag) {
        action.deliberative_config = None;
    } else {
        let cfg = action
            .deliberative_config
            .get_or_insert_with(DeliberativeConfig::default);
        cfg.max_rounds = cfg.max_rounds.max(1);
    }
    if !keep(ActionType::UserGavel) {
        action.gavel_config = None;
    } else {
        action.gavel_config.get_or_insert_with(GavelConfig::default);
    }
    if !keep(ActionType::CharacterWorkshop) {
        action.character_workshop_config = None;
    } else {
        let cfg = action
            .character_workshop_config
            .get_or_insert_with(WorkshopConfig::default);
        cfg.rounds = cfg.rounds.max(1);
    }
    action
}

/// Ids may only contain ASCII letters, digits, `_` and `-`.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

pub(crate) fn require_valid_id(kind: &str, id: &str) -> Result<()> {
    if is_valid_id(id) {
        Ok(())
    } else {
        Err(CouncilError::ValidationError(format!(
            "{kind} id '{id}' must be non-empty and contain only letters, digits, '_' or '-'"
        )))
    }
}
