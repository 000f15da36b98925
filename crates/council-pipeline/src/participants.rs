//! Participant resolution: turns an action's participant configuration into
//! an ordered, de-duplicated list of (role, agent) pairs.
//!
//! Precedence is fixed: explicit positions, then team positions (leader
//! first), then keyword-scored subject matter experts, then characters.

use std::collections::HashSet;
use std::sync::Arc;

use council_llm::{GenerateOptions, LlmClient};
use council_types::Result;

use crate::collaborators::{Agent, Collaborators, Position};
use crate::definition::{CharacterMode, CharacterParticipation, DynamicExpertsConfig, ParticipantsConfig};

/// Words ignored by keyword extraction.
pub const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "have", "him", "his", "how", "its", "may", "new", "now", "old",
    "see", "two", "who", "did", "does", "get", "got", "let", "put", "say", "she", "too", "use",
    "that", "this", "with", "from", "they", "them", "then", "than", "there", "their", "what",
    "when", "where", "which", "while", "will", "would", "could", "should", "about", "into",
    "your", "been", "being", "were", "also", "some", "such", "just", "more", "most", "very",
    "only", "over", "each", "other", "these", "those", "here", "like", "make", "want", "need",
];

/// Lowercase word tokens of at least three characters, minus stop words,
/// without repeats, in order of first appearance.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() >= 3)
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

/// +3 for each search keyword that exactly matches an expert keyword,
/// otherwise +1 if either contains the other.
pub fn score_keywords(expert_keywords: &[String], search: &[String]) -> u32 {
    let expert: Vec<String> = expert_keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();
    search
        .iter()
        .map(|word| {
            if expert.iter().any(|k| k == word) {
                3
            } else if expert
                .iter()
                .any(|k| k.contains(word.as_str()) || word.contains(k.as_str()))
            {
                1
            } else {
                0
            }
        })
        .sum()
}

/// Score every expert position, keep those scoring above zero, and return the
/// top `max` in descending score order (ties keep directory order).
pub fn rank_experts(positions: &[Position], keywords: &[String], max: usize) -> Vec<(Position, u32)> {
    let mut scored: Vec<(Position, u32)> = positions
        .iter()
        .filter(|p| p.is_expert())
        .map(|p| (p.clone(), score_keywords(&p.sme_keywords, keywords)))
        .filter(|(_, score)| *score > 0)
        .collect();
    scored.sort_by(|a, b| b.1.cmp(&a.1));
    scored.truncate(max);
    scored
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantSource {
    Explicit,
    Team,
    Expert,
    Character,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParticipant {
    /// Position id, or `character:<id>` for character participants.
    pub position_id: String,
    pub role: String,
    pub agent: Agent,
    pub position: Option<Position>,
    pub source: ParticipantSource,
}

/// Resolves participants against the configured directories.
pub struct ParticipantResolver<'a> {
    collaborators: &'a Collaborators,
    timeout_ms: Option<u64>,
}

impl<'a> ParticipantResolver<'a> {
    pub fn new(collaborators: &'a Collaborators) -> Self {
        Self {
            collaborators,
            timeout_ms: None,
        }
    }

    /// Timeout for the LLM call made by dynamic character selection.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Resolve the full participant list. `expert_text` is the text dynamic
    /// expert matching and dynamic character selection read.
    pub async fn resolve(
        &self,
        config: &ParticipantsConfig,
        expert_text: &str,
    ) -> Result<Vec<ResolvedParticipant>> {
        let mut out: Vec<ResolvedParticipant> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut push = |p: ResolvedParticipant, out: &mut Vec<ResolvedParticipant>| {
            if seen.insert(p.position_id.clone()) {
                out.push(p);
            }
        };

        for id in &config.position_ids {
            if let Some(p) = self.seat(id, ParticipantSource::Explicit).await? {
                push(p, &mut out);
            }
        }

        if !config.team_ids.is_empty() {
            let agents = self.collaborators.agents()?;
            for team_id in &config.team_ids {
                let Some(team) = agents.get_team(team_id).await else {
                    tracing::warn!(team = %team_id, "Unknown team");
                    continue;
                };
                for id in team.position_ids() {
                    if let Some(p) = self.seat(&id, ParticipantSource::Team).await? {
                        push(p, &mut out);
                    }
                }
            }
        }

        if config.dynamic_experts.enabled {
            for p in self.experts(&config.dynamic_experts, expert_text).await? {
                push(p, &mut out);
            }
        }

        if config.characters.enabled {
            for p in self.characters(&config.characters, expert_text).await? {
                push(p, &mut out);
            }
        }

        tracing::debug!(
            participants = ?out.iter().map(|p| p.position_id.as_str()).collect::<Vec<_>>(),
            "Resolved participants"
        );
        Ok(out)
    }

    /// Seat a position: character-system agent, then directory agent, then an
    /// agent synthesized from the position itself.
    async fn seat(&self, position_id: &str, source: ParticipantSource) -> Result<Option<ResolvedParticipant>> {
        let agents = self.collaborators.agents()?;
        let Some(position) = agents.get_position(position_id).await else {
            tracing::warn!(position = %position_id, "Unknown position");
            return Ok(None);
        };
        let mut agent = None;
        if let Some(characters) = &self.collaborators.characters {
            agent = characters.resolve_position_agent(position_id).await;
        }
        if agent.is_none() {
            agent = agents.get_agent_for_position(position_id).await;
        }
        let mut agent = agent.unwrap_or_else(|| Agent::from_position(&position));
        if agent.system_prompt.trim().is_empty() {
            agent.system_prompt = position.system_prompt.clone();
        }
        Ok(Some(ResolvedParticipant {
            position_id: position.id.clone(),
            role: if position.name.is_empty() {
                position.id.clone()
            } else {
                position.name.clone()
            },
            agent,
            position: Some(position),
            source,
        }))
    }

    async fn experts(
        &self,
        config: &DynamicExpertsConfig,
        text: &str,
    ) -> Result<Vec<ResolvedParticipant>> {
        let agents = self.collaborators.agents()?;
        let keywords = extract_keywords(text);
        let positions = agents.all_positions().await;
        let ranked = rank_experts(&positions, &keywords, config.max_smes);
        tracing::debug!(
            keywords = ?keywords,
            scores = ?ranked.iter().map(|(p, s)| (p.id.as_str(), *s)).collect::<Vec<_>>(),
            "Scored subject matter experts"
        );

        let ids: Vec<String> = if ranked.is_empty() {
            config.default_position_id.iter().cloned().collect()
        } else {
            ranked.into_iter().map(|(p, _)| p.id).collect()
        };
        let mut out = Vec::new();
        for id in ids {
            if let Some(p) = self.seat(&id, ParticipantSource::Expert).await? {
                out.push(p);
            }
        }
        Ok(out)
    }

    async fn characters(
        &self,
        config: &CharacterParticipation,
        text: &str,
    ) -> Result<Vec<ResolvedParticipant>> {
        let directory = self.collaborators.characters()?;
        let typed = |agents: Vec<Agent>| -> Vec<Agent> {
            match config.agent_type.as_deref() {
                Some(t) => agents
                    .into_iter()
                    .filter(|a| a.agent_type.as_deref() == Some(t))
                    .collect(),
                None => agents,
            }
        };

        let mut agents = match config.mode {
            CharacterMode::Explicit => {
                let mut found = Vec::new();
                for id in &config.character_ids {
                    match directory.agent_by_character_id(id).await {
                        Some(a) => found.push(a),
                        None => tracing::warn!(character = %id, "Unknown character"),
                    }
                }
                found
            }
            CharacterMode::Spawned => typed(directory.spawned_agents().await),
            CharacterMode::Dynamic => {
                let pool = match config.agent_type.as_deref() {
                    Some(t) => directory.agents_by_type(t).await,
                    None => directory.all_character_agents().await,
                };
                self.select_characters(pool, config, text).await
            }
        };
        agents.truncate(config.max_characters.max(1));

        let mut out = Vec::with_capacity(agents.len());
        for mut agent in agents {
            if agent.system_prompt.trim().is_empty() {
                agent.system_prompt = directory.generate_system_prompt(&agent).await;
            }
            let key = agent.character_id.clone().unwrap_or_else(|| agent.id.clone());
            out.push(ResolvedParticipant {
                position_id: format!("character:{key}"),
                role: agent.name.clone(),
                agent,
                position: None,
                source: ParticipantSource::Character,
            });
        }
        Ok(out)
    }

    /// Ask the LLM which characters fit the text. Falls back to the first
    /// `max_characters` of the pool when the call fails or names nobody.
    async fn select_characters(
        &self,
        pool: Vec<Agent>,
        config: &CharacterParticipation,
        text: &str,
    ) -> Vec<Agent> {
        let max = config.max_characters.max(1);
        if pool.len() <= max {
            return pool;
        }
        let Some(llm) = self.collaborators.llm.as_ref() else {
            return pool.into_iter().take(max).collect();
        };

        let reply = match self.ask_for_selection(llm, &pool, config, text).await {
            Ok(reply) => reply.to_lowercase(),
            Err(e) => {
                tracing::warn!(error = %e, "Character selection failed; using the first characters");
                return pool.into_iter().take(max).collect();
            }
        };
        let chosen: Vec<Agent> = pool
            .iter()
            .filter(|a| !a.name.is_empty() && reply.contains(&a.name.to_lowercase()))
            .take(max)
            .cloned()
            .collect();
        if chosen.is_empty() {
            pool.into_iter().take(max).collect()
        } else {
            chosen
        }
    }

    async fn ask_for_selection(
        &self,
        llm: &Arc<dyn LlmClient>,
        pool: &[Agent],
        config: &CharacterParticipation,
        text: &str,
    ) -> Result<String> {
        let roster = pool
            .iter()
            .map(|a| {
                if a.description.is_empty() {
                    format!("- {}", a.name)
                } else {
                    format!("- {}: {}", a.name, a.description)
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        let instruction = if config.selection_prompt.trim().is_empty() {
            "Choose the characters best suited to respond."
        } else {
            config.selection_prompt.trim()
        };
        let prompt = format!(
            "{instruction}\n\nAvailable characters:\n{roster}\n\nSituation:\n{text}\n\n\
             Reply with the names of up to {} characters, separated by commas.",
            config.max_characters.max(1)
        );
        let options = GenerateOptions {
            timeout_ms: self.timeout_ms,
            ..GenerateOptions::default()
        };
        llm.generate(&prompt, &options).await
    }
}
