//! In-memory collaborator implementations for development, dry runs and testing.
//!
//! [`DirectoryFixtures`] loads all of them from one JSON document so the CLI
//! can run pipelines without external systems.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use council_types::{CouncilError, Result};

use crate::collaborators::{
    Agent, AgentDirectory, CharacterDirectory, Collaborators, CrudPipelineDef, CurationStore,
    Position, RagHit, RagQuery, RagResponse, Team, ThreadLog, ThreadMessage,
};
use crate::participants::extract_keywords;

fn store_err(e: impl ToString) -> CouncilError {
    CouncilError::collaborator("curation store", e)
}

// ---------------------------------------------------------------------------
// InMemoryAgentDirectory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryAgentDirectory {
    positions: RwLock<Vec<Position>>,
    agents: RwLock<HashMap<String, Agent>>,
    teams: RwLock<HashMap<String, Team>>,
}

impl InMemoryAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a position; registration order is preserved.
    pub fn add_position(&self, position: Position) {
        let mut positions = self.positions.write().unwrap_or_else(|e| e.into_inner());
        match positions.iter_mut().find(|p| p.id == position.id) {
            Some(slot) => *slot = position,
            None => positions.push(position),
        }
    }

    pub fn assign_agent(&self, position_id: impl Into<String>, agent: Agent) {
        self.agents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(position_id.into(), agent);
    }

    pub fn add_team(&self, team: Team) {
        self.teams
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(team.id.clone(), team);
    }
}

#[async_trait]
impl AgentDirectory for InMemoryAgentDirectory {
    async fn get_position(&self, id: &str) -> Option<Position> {
        let positions = self.positions.read().unwrap_or_else(|e| e.into_inner());
        positions.iter().find(|p| p.id == id).cloned()
    }

    async fn get_agent_for_position(&self, position_id: &str) -> Option<Agent> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        agents.get(position_id).cloned()
    }

    async fn get_team(&self, id: &str) -> Option<Team> {
        let teams = self.teams.read().unwrap_or_else(|e| e.into_inner());
        teams.get(id).cloned()
    }

    async fn all_positions(&self) -> Vec<Position> {
        self.positions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

// ---------------------------------------------------------------------------
// InMemoryCharacterDirectory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryCharacterDirectory {
    characters: RwLock<Vec<Agent>>,
    spawned: RwLock<Vec<Agent>>,
    director: RwLock<Option<Agent>>,
    position_agents: RwLock<HashMap<String, Agent>>,
}

impl InMemoryCharacterDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a character agent. Its `character_id` falls back to its `id`.
    pub fn add_character(&self, mut agent: Agent) {
        if agent.character_id.is_none() {
            agent.character_id = Some(agent.id.clone());
        }
        self.characters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(agent);
    }

    pub fn add_spawned(&self, agent: Agent) {
        self.spawned
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(agent);
    }

    pub fn set_director(&self, agent: Agent) {
        *self.director.write().unwrap_or_else(|e| e.into_inner()) = Some(agent);
    }

    pub fn assign_position(&self, position_id: impl Into<String>, agent: Agent) {
        self.position_agents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(position_id.into(), agent);
    }
}

#[async_trait]
impl CharacterDirectory for InMemoryCharacterDirectory {
    async fn agent_by_character_id(&self, character_id: &str) -> Option<Agent> {
        let characters = self.characters.read().unwrap_or_else(|e| e.into_inner());
        characters
            .iter()
            .find(|a| a.character_id.as_deref() == Some(character_id))
            .cloned()
    }

    async fn spawned_agents(&self) -> Vec<Agent> {
        self.spawned
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn agents_by_type(&self, agent_type: &str) -> Vec<Agent> {
        let characters = self.characters.read().unwrap_or_else(|e| e.into_inner());
        let spawned = self.spawned.read().unwrap_or_else(|e| e.into_inner());
        characters
            .iter()
            .chain(spawned.iter())
            .filter(|a| a.agent_type.as_deref() == Some(agent_type))
            .cloned()
            .collect()
    }

    async fn character_director(&self) -> Option<Agent> {
        self.director
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn generate_system_prompt(&self, agent: &Agent) -> String {
        if !agent.system_prompt.trim().is_empty() {
            return agent.system_prompt.clone();
        }
        if agent.description.trim().is_empty() {
            format!("You are {}. Stay in character.", agent.name)
        } else {
            format!("You are {}. {} Stay in character.", agent.name, agent.description.trim())
        }
    }

    async fn resolve_position_agent(&self, position_id: &str) -> Option<Agent> {
        let agents = self.position_agents.read().unwrap_or_else(|e| e.into_inner());
        agents.get(position_id).cloned()
    }

    async fn all_character_agents(&self) -> Vec<Agent> {
        self.characters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

// ---------------------------------------------------------------------------
// InMemoryCurationStore
// ---------------------------------------------------------------------------

/// One store: a display name plus entries, each an object with an `id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreData {
    pub name: String,
    pub entries: Vec<Value>,
}

#[derive(Debug, Default)]
pub struct InMemoryCurationStore {
    stores: RwLock<BTreeMap<String, StoreData>>,
    rag_pipelines: RwLock<HashMap<String, Vec<String>>>,
    crud_pipelines: RwLock<HashMap<String, CrudPipelineDef>>,
    next_id: Mutex<u64>,
}

impl InMemoryCurationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_store(&self, id: impl Into<String>, data: StoreData) {
        let id = id.into();
        let mut data = data;
        if data.name.is_empty() {
            data.name = id.clone();
        }
        self.stores
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, data);
    }

    /// Register a retrieval pipeline that searches the given stores.
    pub fn add_rag_pipeline(&self, id: impl Into<String>, store_ids: Vec<String>) {
        self.rag_pipelines
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.into(), store_ids);
    }

    pub fn add_crud_pipeline(&self, def: CrudPipelineDef) {
        self.crud_pipelines
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(def.id.clone(), def);
    }

    /// Snapshot of one store's entries.
    pub fn entries(&self, store_id: &str) -> Vec<Value> {
        let stores = self.stores.read().unwrap_or_else(|e| e.into_inner());
        stores
            .get(store_id)
            .map(|s| s.entries.clone())
            .unwrap_or_default()
    }

    fn fresh_id(&self) -> String {
        let mut next = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
        *next += 1;
        format!("entry-{}", *next)
    }

    fn stores_for(&self, pipeline_id: &str) -> Result<Vec<String>> {
        if pipeline_id.is_empty() {
            let stores = self.stores.read().map_err(store_err)?;
            return Ok(stores.keys().cloned().collect());
        }
        let pipelines = self.rag_pipelines.read().map_err(store_err)?;
        if let Some(ids) = pipelines.get(pipeline_id) {
            return Ok(ids.clone());
        }
        let stores = self.stores.read().map_err(store_err)?;
        if stores.contains_key(pipeline_id) {
            return Ok(vec![pipeline_id.to_string()]);
        }
        Err(store_err(format!("unknown RAG pipeline '{pipeline_id}'")))
    }
}

fn entry_id(entry: &Value) -> Option<String> {
    match entry.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl CurationStore for InMemoryCurationStore {
    async fn read(&self, store_id: &str, entry: Option<&str>) -> Result<Value> {
        let stores = self.stores.read().map_err(store_err)?;
        let store = stores
            .get(store_id)
            .ok_or_else(|| store_err(format!("unknown store '{store_id}'")))?;
        match entry {
            None => Ok(Value::Array(store.entries.clone())),
            Some(id) => store
                .entries
                .iter()
                .find(|e| entry_id(e).as_deref() == Some(id))
                .cloned()
                .ok_or_else(|| store_err(format!("entry '{id}' not found in '{store_id}'"))),
        }
    }

    async fn create(&self, store_id: &str, data: Value) -> Result<Value> {
        let mut entry = match data {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        if !entry.contains_key("id") {
            entry.insert("id".into(), Value::String(self.fresh_id()));
        }
        let entry = Value::Object(entry);
        let mut stores = self.stores.write().map_err(store_err)?;
        stores
            .entry(store_id.to_string())
            .or_insert_with(|| StoreData {
                name: store_id.to_string(),
                entries: Vec::new(),
            })
            .entries
            .push(entry.clone());
        Ok(entry)
    }

    async fn update(&self, store_id: &str, id: &str, data: Value) -> Result<Value> {
        let mut stores = self.stores.write().map_err(store_err)?;
        let store = stores
            .get_mut(store_id)
            .ok_or_else(|| store_err(format!("unknown store '{store_id}'")))?;
        let idx = store
            .entries
            .iter()
            .position(|e| entry_id(e).as_deref() == Some(id))
            .ok_or_else(|| store_err(format!("entry '{id}' not found in '{store_id}'")))?;
        match (&mut store.entries[idx], data) {
            (Value::Object(target), Value::Object(patch)) => {
                for (k, v) in patch {
                    target.insert(k, v);
                }
            }
            (Value::Object(target), other) => {
                target.insert("value".into(), other);
            }
            (slot, other) => *slot = other,
        }
        Ok(store.entries[idx].clone())
    }

    async fn delete(&self, store_id: &str, id: &str) -> Result<bool> {
        let mut stores = self.stores.write().map_err(store_err)?;
        let Some(store) = stores.get_mut(store_id) else {
            return Ok(false);
        };
        let before = store.entries.len();
        store.entries.retain(|e| entry_id(e).as_deref() != Some(id));
        Ok(store.entries.len() < before)
    }

    /// Keyword match: entries are ranked by how many query keywords occur in
    /// their JSON text; entries with no match are left out.
    async fn execute_rag(&self, pipeline_id: &str, query: &RagQuery) -> Result<RagResponse> {
        let store_ids = self.stores_for(pipeline_id)?;
        let keywords = extract_keywords(&query.query);
        let stores = self.stores.read().map_err(store_err)?;

        let mut scored: Vec<(usize, RagHit)> = Vec::new();
        for id in &store_ids {
            let Some(store) = stores.get(id) else {
                continue;
            };
            for entry in &store.entries {
                let text = entry.to_string().to_lowercase();
                let score = keywords.iter().filter(|k| text.contains(k.as_str())).count();
                if score > 0 {
                    scored.push((
                        score,
                        RagHit {
                            store_name: store.name.clone(),
                            entry: entry.clone(),
                        },
                    ));
                }
            }
        }
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        let results: Vec<RagHit> = scored
            .into_iter()
            .take(query.limit.max(1))
            .map(|(_, hit)| hit)
            .collect();
        tracing::debug!(pipeline = %pipeline_id, hits = results.len(), "RAG query");
        Ok(RagResponse {
            count: results.len(),
            results,
        })
    }

    async fn crud_pipeline(&self, id: &str) -> Option<CrudPipelineDef> {
        let pipelines = self.crud_pipelines.read().ok()?;
        pipelines.get(id).cloned()
    }
}

// ---------------------------------------------------------------------------
// InMemoryThreadLog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedThread {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub messages: Vec<ThreadMessage>,
}

#[derive(Debug, Default)]
pub struct InMemoryThreadLog {
    threads: Mutex<Vec<LoggedThread>>,
}

impl InMemoryThreadLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threads(&self) -> Vec<LoggedThread> {
        self.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn messages(&self, thread_id: &str) -> Vec<ThreadMessage> {
        let threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        threads
            .iter()
            .find(|t| t.id == thread_id)
            .map(|t| t.messages.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ThreadLog for InMemoryThreadLog {
    async fn create_thread(&self, name: &str, kind: &str) -> Result<String> {
        let mut threads = self
            .threads
            .lock()
            .map_err(|e| CouncilError::collaborator("thread log", e))?;
        let id = format!("thread-{}", threads.len() + 1);
        threads.push(LoggedThread {
            id: id.clone(),
            name: name.to_string(),
            kind: kind.to_string(),
            messages: Vec::new(),
        });
        Ok(id)
    }

    async fn add_message(&self, thread_id: &str, message: ThreadMessage) -> Result<()> {
        let mut threads = self
            .threads
            .lock()
            .map_err(|e| CouncilError::collaborator("thread log", e))?;
        let thread = threads
            .iter_mut()
            .find(|t| t.id == thread_id)
            .ok_or_else(|| {
                CouncilError::collaborator("thread log", format!("unknown thread '{thread_id}'"))
            })?;
        thread.messages.push(message);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DirectoryFixtures
// ---------------------------------------------------------------------------

/// A JSON document describing positions, teams, characters and stores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DirectoryFixtures {
    pub positions: Vec<Position>,
    /// Position id -> agent seated there.
    pub agents: BTreeMap<String, Agent>,
    pub teams: Vec<Team>,
    pub characters: Vec<Agent>,
    pub spawned: Vec<Agent>,
    pub director: Option<Agent>,
    pub stores: BTreeMap<String, StoreData>,
    /// RAG pipeline id -> store ids it searches.
    pub rag_pipelines: BTreeMap<String, Vec<String>>,
    pub crud_pipelines: Vec<CrudPipelineDef>,
}

impl DirectoryFixtures {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Build in-memory collaborators (everything but the LLM client).
    pub fn into_collaborators(self) -> Collaborators {
        let agents = InMemoryAgentDirectory::new();
        for position in self.positions {
            agents.add_position(position);
        }
        for (position_id, agent) in self.agents {
            agents.assign_agent(position_id, agent);
        }
        for team in self.teams {
            agents.add_team(team);
        }

        let characters = InMemoryCharacterDirectory::new();
        for agent in self.characters {
            characters.add_character(agent);
        }
        for agent in self.spawned {
            characters.add_spawned(agent);
        }
        if let Some(director) = self.director {
            characters.set_director(director);
        }

        let curation = InMemoryCurationStore::new();
        for (id, store) in self.stores {
            curation.add_store(id, store);
        }
        for (id, store_ids) in self.rag_pipelines {
            curation.add_rag_pipeline(id, store_ids);
        }
        for def in self.crud_pipelines {
            curation.add_crud_pipeline(def);
        }

        Collaborators::new()
            .with_agents(Arc::new(agents))
            .with_characters(Arc::new(characters))
            .with_curation(Arc::new(curation))
            .with_threads(Arc::new(InMemoryThreadLog::new()))
    }
}
