//! Capability interfaces the engine calls out to, and the records they return.
//!
//! The engine never owns agents, characters, stores or threads; it reaches
//! them through these traits. [`Collaborators`] bundles the optional
//! implementations handed to the engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use council_llm::{LlmClient, ModelConfig};
use council_types::{CouncilError, Result};

use crate::definition::CrudOperation;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A seat at the table: a role with its own prompt and, for subject matter
/// experts, a keyword set used by dynamic expert matching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Position {
    pub id: String,
    pub name: String,
    pub team_id: Option<String>,
    pub system_prompt: String,
    pub prompt_prefix: String,
    pub prompt_suffix: String,
    pub is_sme: bool,
    pub sme_keywords: Vec<String>,
    pub api_config: ModelConfig,
}

impl Position {
    pub fn is_expert(&self) -> bool {
        self.is_sme || !self.sme_keywords.is_empty()
    }
}

/// An LLM-backed agent, either seated at a position or standing in for a character.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub prompt_prefix: String,
    pub prompt_suffix: String,
    pub api_config: ModelConfig,
    pub character_id: Option<String>,
    pub agent_type: Option<String>,
}

impl Agent {
    /// An agent synthesized from a position that has no agent assigned.
    pub fn from_position(position: &Position) -> Self {
        Self {
            id: position.id.clone(),
            name: position.name.clone(),
            description: String::new(),
            system_prompt: position.system_prompt.clone(),
            prompt_prefix: position.prompt_prefix.clone(),
            prompt_suffix: position.prompt_suffix.clone(),
            api_config: position.api_config.clone(),
            character_id: None,
            agent_type: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub leader_position_id: Option<String>,
    pub member_position_ids: Vec<String>,
}

impl Team {
    /// Leader first, then members, without repeats.
    pub fn position_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.leader_position_id.iter().cloned().collect();
        for id in &self.member_position_ids {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagQuery {
    pub query: String,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RagHit {
    pub store_name: String,
    pub entry: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RagResponse {
    pub results: Vec<RagHit>,
    pub count: usize,
}

/// A CRUD pipeline registered with the curation store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrudPipelineDef {
    pub id: String,
    pub store_id: String,
    pub operation: CrudOperation,
    pub input_mapping: BTreeMap<String, String>,
    pub output_mapping: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn get_position(&self, id: &str) -> Option<Position>;
    async fn get_agent_for_position(&self, position_id: &str) -> Option<Agent>;
    async fn get_team(&self, id: &str) -> Option<Team>;
    async fn all_positions(&self) -> Vec<Position>;
}

#[async_trait]
pub trait CharacterDirectory: Send + Sync {
    async fn agent_by_character_id(&self, character_id: &str) -> Option<Agent>;
    async fn spawned_agents(&self) -> Vec<Agent>;
    async fn agents_by_type(&self, agent_type: &str) -> Vec<Agent>;
    async fn character_director(&self) -> Option<Agent>;
    async fn generate_system_prompt(&self, agent: &Agent) -> String;
    async fn resolve_position_agent(&self, position_id: &str) -> Option<Agent>;
    async fn all_character_agents(&self) -> Vec<Agent>;
}

#[async_trait]
pub trait CurationStore: Send + Sync {
    /// Read one entry, or every entry of the store when `entry_id` is `None`.
    async fn read(&self, store_id: &str, entry_id: Option<&str>) -> Result<Value>;
    async fn create(&self, store_id: &str, data: Value) -> Result<Value>;
    async fn update(&self, store_id: &str, entry_id: &str, data: Value) -> Result<Value>;
    async fn delete(&self, store_id: &str, entry_id: &str) -> Result<bool>;
    async fn execute_rag(&self, pipeline_id: &str, query: &RagQuery) -> Result<RagResponse>;
    async fn crud_pipeline(&self, id: &str) -> Option<CrudPipelineDef>;
}

#[async_trait]
pub trait ThreadLog: Send + Sync {
    async fn create_thread(&self, name: &str, kind: &str) -> Result<String>;
    async fn add_message(&self, thread_id: &str, message: ThreadMessage) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// The external systems available to one engine. Every slot is optional; an
/// action that needs a missing collaborator fails with a configuration error.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub llm: Option<Arc<dyn LlmClient>>,
    pub agents: Option<Arc<dyn AgentDirectory>>,
    pub characters: Option<Arc<dyn CharacterDirectory>>,
    pub curation: Option<Arc<dyn CurationStore>>,
    pub threads: Option<Arc<dyn ThreadLog>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("llm", &self.llm.as_ref().map(|l| l.name().to_string()))
            .field("agents", &self.agents.is_some())
            .field("characters", &self.characters.is_some())
            .field("curation", &self.curation.is_some())
            .field("threads", &self.threads.is_some())
            .finish()
    }
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_agents(mut self, agents: Arc<dyn AgentDirectory>) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn with_characters(mut self, characters: Arc<dyn CharacterDirectory>) -> Self {
        self.characters = Some(characters);
        self
    }

    pub fn with_curation(mut self, curation: Arc<dyn CurationStore>) -> Self {
        self.curation = Some(curation);
        self
    }

    pub fn with_threads(mut self, threads: Arc<dyn ThreadLog>) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn llm(&self) -> Result<&Arc<dyn LlmClient>> {
        self.llm
            .as_ref()
            .ok_or_else(|| CouncilError::MissingCollaborator("LLM client".into()))
    }

    pub fn curation(&self) -> Result<&Arc<dyn CurationStore>> {
        self.curation
            .as_ref()
            .ok_or_else(|| CouncilError::MissingCollaborator("curation store".into()))
    }

    pub fn characters(&self) -> Result<&Arc<dyn CharacterDirectory>> {
        self.characters
            .as_ref()
            .ok_or_else(|| CouncilError::MissingCollaborator("character directory".into()))
    }

    pub fn agents(&self) -> Result<&Arc<dyn AgentDirectory>> {
        self.agents
            .as_ref()
            .ok_or_else(|| CouncilError::MissingCollaborator("agent directory".into()))
    }

    pub fn threads(&self) -> Result<&Arc<dyn ThreadLog>> {
        self.threads
            .as_ref()
            .ok_or_else(|| CouncilError::MissingCollaborator("thread log".into()))
    }
}
