use async_trait::async_trait;
use serde_json::Value;

use council_types::{CouncilError, ParticipantResponse, Result};

use super::{character_seat, transcript, ActionContext, ActionHandler, ActionOutcome};
use crate::collaborators::Agent;
use crate::definition::{ActionType, WorkshopConfig, WorkshopMode};
use crate::participants::{ParticipantSource, ResolvedParticipant};

const DIRECTOR_PROMPT: &str = "You are the director of a character workshop. \
     You guide the characters, keep them true to themselves, and give precise notes.";

/// Handler for `character_workshop` actions. Each mode is a fixed exchange
/// between a director and the participating characters.
pub struct WorkshopHandler;

struct Workshop<'c, 'a> {
    ctx: &'c ActionContext<'a>,
    director: ResolvedParticipant,
    cast: Vec<ResolvedParticipant>,
    topic: String,
    rounds: u32,
    responses: Vec<ParticipantResponse>,
}

impl<'c, 'a> Workshop<'c, 'a> {
    fn names(&self) -> String {
        self.cast.iter().map(|c| c.role.as_str()).collect::<Vec<_>>().join(", ")
    }

    async fn say(&mut self, who: &ResolvedParticipant, prompt: String, round: u32) -> Result<String> {
        let response = self.ctx.ask(who, &prompt, round).await?;
        let text = response.content.clone();
        self.responses.push(response);
        Ok(text)
    }

    fn round_transcript(&self, round: u32) -> String {
        let this_round: Vec<ParticipantResponse> = self
            .responses
            .iter()
            .filter(|r| r.round == round && r.position_id != self.director.position_id)
            .cloned()
            .collect();
        transcript(&this_round)
    }

    /// Characters present, the director gives notes, characters refine.
    async fn refinement(&mut self) -> Result<()> {
        let mut notes = String::new();
        for round in 1..=self.rounds {
            let previous = self.round_transcript(round - 1);
            for member in self.cast.clone() {
                let prompt = if round == 1 {
                    format!("Topic:\n{}\n\nPresent your take on the topic, in character.", self.topic)
                } else {
                    format!(
                        "Topic:\n{}\n\nThe previous round:\n{previous}\n\nDirector's notes:\n{notes}\n\n\
                         Refine your contribution using the notes, in character.",
                        self.topic
                    )
                };
                self.say(&member, prompt, round).await?;
            }
            if round < self.rounds {
                let director = self.director.clone();
                let prompt = format!(
                    "Topic:\n{}\n\nContributions:\n{}\n\nGive each character specific notes for improvement.",
                    self.topic,
                    self.round_transcript(round)
                );
                notes = self.say(&director, prompt, round).await?;
            }
        }
        Ok(())
    }

    /// The director writes a checklist, characters answer, the director
    /// flags breaks in character, characters correct them.
    async fn consistency(&mut self) -> Result<()> {
        let director = self.director.clone();
        let checklist = self
            .say(
                &director,
                format!(
                    "Characters: {}\n\nTopic:\n{}\n\nList the traits, facts and voice each character \
                     must stay consistent with.",
                    self.names(),
                    self.topic
                ),
                0,
            )
            .await?;

        let mut review = String::new();
        for round in 1..=self.rounds {
            for member in self.cast.clone() {
                let prompt = if round == 1 {
                    format!("Topic:\n{}\n\nRespond to the topic, in character.", self.topic)
                } else {
                    format!(
                        "Topic:\n{}\n\nThe director's consistency review:\n{review}\n\n\
                         Revise your response to fix anything flagged for you, in character.",
                        self.topic
                    )
                };
                self.say(&member, prompt, round).await?;
            }
            let prompt = format!(
                "Checklist:\n{checklist}\n\nResponses:\n{}\n\nFlag every response that breaks character \
                 or contradicts the checklist, naming the character and the problem.",
                self.round_transcript(round)
            );
            review = self.say(&director, prompt, round).await?;
        }
        Ok(())
    }

    /// The director sets a scene and the characters build it in turns.
    async fn collaboration(&mut self) -> Result<()> {
        let director = self.director.clone();
        let setup = self
            .say(
                &director,
                format!(
                    "Set up a scene on this topic for {}:\n{}\n\nDescribe the situation and each character's goal.",
                    self.names(),
                    self.topic
                ),
                0,
            )
            .await?;
        for round in 1..=self.rounds {
            for member in self.cast.clone() {
                let so_far = transcript(&self.responses[1..]);
                let prompt = format!(
                    "Scene:\n{setup}\n\nSo far:\n{}\n\nContinue the scene as {}. Add one contribution.",
                    if so_far.is_empty() { "(nothing yet)" } else { so_far.as_str() },
                    member.role
                );
                self.say(&member, prompt, round).await?;
            }
        }
        Ok(())
    }
}

impl WorkshopHandler {
    async fn cast(&self, ctx: &ActionContext<'_>, config: &WorkshopConfig) -> Result<Vec<ResolvedParticipant>> {
        let directory = ctx.collaborators.characters()?;
        let agents: Vec<Agent> = if config.character_ids.is_empty() {
            directory.all_character_agents().await
        } else {
            let mut found = Vec::with_capacity(config.character_ids.len());
            for id in &config.character_ids {
                match directory.agent_by_character_id(id).await {
                    Some(agent) => found.push(agent),
                    None => tracing::warn!(character = %id, "Unknown workshop character"),
                }
            }
            found
        };
        let mut cast = Vec::with_capacity(agents.len());
        for mut agent in agents {
            if agent.system_prompt.trim().is_empty() {
                agent.system_prompt = directory.generate_system_prompt(&agent).await;
            }
            cast.push(character_seat(agent));
        }
        Ok(cast)
    }

    async fn director(&self, ctx: &ActionContext<'_>) -> Result<ResolvedParticipant> {
        let directory = ctx.collaborators.characters()?;
        let mut agent = directory.character_director().await.unwrap_or_else(|| Agent {
            id: "director".into(),
            name: "Director".into(),
            ..Agent::default()
        });
        if agent.system_prompt.trim().is_empty() {
            agent.system_prompt = DIRECTOR_PROMPT.to_string();
        }
        Ok(ResolvedParticipant {
            position_id: "director".into(),
            role: agent.name.clone(),
            agent,
            position: None,
            source: ParticipantSource::Character,
        })
    }
}

#[async_trait]
impl ActionHandler for WorkshopHandler {
    fn action_type(&self) -> ActionType {
        ActionType::CharacterWorkshop
    }

    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome> {
        let config = ctx.action.character_workshop_config.clone().unwrap_or_default();
        let cast = self.cast(ctx, &config).await?;
        if cast.is_empty() {
            return Err(CouncilError::Configuration(format!(
                "character_workshop action '{}' has no characters",
                ctx.action.id
            )));
        }
        let topic = if config.topic_template.trim().is_empty() {
            ctx.task()
        } else {
            ctx.resolve(&config.topic_template)
        };
        let mut workshop = Workshop {
            ctx,
            director: self.director(ctx).await?,
            cast,
            topic,
            rounds: config.rounds.max(1),
            responses: Vec::new(),
        };
        tracing::info!(
            action = %ctx.action.id,
            mode = ?config.mode,
            characters = %workshop.names(),
            "Workshop started"
        );

        match config.mode {
            WorkshopMode::Refinement => workshop.refinement().await?,
            WorkshopMode::Consistency => workshop.consistency().await?,
            WorkshopMode::Collaboration => workshop.collaboration().await?,
        }

        let last_round = workshop.rounds;
        let output = if config.synthesize {
            let director = workshop.director.clone();
            let body = transcript(&workshop.responses);
            let prompt = format!(
                "Topic:\n{}\n\nWorkshop transcript:\n{body}\n\nSynthesize the workshop into one final result.",
                workshop.topic
            );
            workshop.say(&director, prompt, last_round + 1).await?
        } else if config.mode == WorkshopMode::Collaboration {
            transcript(&workshop.responses[1..])
        } else {
            workshop.round_transcript(last_round)
        };
        Ok(ActionOutcome::with_responses(Value::String(output), workshop.responses))
    }
}
