use async_trait::async_trait;
use serde_json::Value;

use council_types::{CouncilError, ParticipantResponse, Result};

use super::rag::format_rag_results;
use super::{ActionContext, ActionHandler, ActionOutcome};
use crate::collaborators::{RagQuery, ThreadMessage};
use crate::definition::{ActionType, DeliberativeConfig, ParticipantsConfig};
use crate::participants::{ParticipantResolver, ResolvedParticipant};

/// Phrases in a question that end the deliberation early.
pub const STOP_PHRASES: &[&str] = &["sufficient", "no further"];

pub fn signals_stop(text: &str) -> bool {
    let lower = text.to_lowercase();
    STOP_PHRASES.iter().any(|p| lower.contains(p))
}

/// One question and the answers gathered for it.
#[derive(Debug, Clone, PartialEq)]
struct Exchange {
    round: u32,
    asker: String,
    question: String,
    answers: Vec<(String, String)>,
}

fn render_log(log: &[Exchange]) -> String {
    log.iter()
        .map(|e| {
            let mut block = format!("Q{} ({}): {}", e.round, e.asker, e.question.trim());
            for (who, answer) in &e.answers {
                block.push_str(&format!("\nA ({who}): {}", answer.trim()));
            }
            block
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Handler for `deliberative_rag` actions: query participants ask questions
/// round by round, curation participants answer from retrieval results.
pub struct DeliberativeHandler;

impl DeliberativeHandler {
    async fn seats(&self, ctx: &ActionContext<'_>, ids: &[String]) -> Result<Vec<ResolvedParticipant>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let config = ParticipantsConfig {
            position_ids: ids.to_vec(),
            ..ParticipantsConfig::default()
        };
        ParticipantResolver::new(ctx.collaborators).resolve(&config, "").await
    }

    async fn open_thread(&self, ctx: &ActionContext<'_>, config: &DeliberativeConfig) -> Result<Option<String>> {
        if !config.log_to_thread {
            return Ok(None);
        }
        let name = if config.thread_name.trim().is_empty() {
            format!("{} deliberation", ctx.action.name)
        } else {
            ctx.resolve(&config.thread_name)
        };
        let id = ctx.collaborators.threads()?.create_thread(&name, "deliberation").await?;
        Ok(Some(id))
    }

    async fn log(&self, ctx: &ActionContext<'_>, thread: Option<&str>, role: &str, who: &str, content: &str) -> Result<()> {
        let Some(thread_id) = thread else {
            return Ok(());
        };
        ctx.collaborators
            .threads()?
            .add_message(
                thread_id,
                ThreadMessage {
                    role: role.to_string(),
                    content: content.to_string(),
                    name: Some(who.to_string()),
                },
            )
            .await
    }

    async fn retrieve(&self, ctx: &ActionContext<'_>, config: &DeliberativeConfig, question: &str) -> Result<String> {
        let response = ctx
            .collaborators
            .curation()?
            .execute_rag(
                &config.rag_pipeline_id,
                &RagQuery {
                    query: question.to_string(),
                    limit: config.limit,
                },
            )
            .await?;
        Ok(format_rag_results(&response))
    }
}

#[async_trait]
impl ActionHandler for DeliberativeHandler {
    fn action_type(&self) -> ActionType {
        ActionType::DeliberativeRag
    }

    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome> {
        let config = ctx.action.deliberative_config.clone().unwrap_or_default();
        ctx.collaborators.curation()?;
        let askers = self.seats(ctx, &config.query_position_ids).await?;
        let Some(lead) = askers.first() else {
            return Err(CouncilError::Configuration(format!(
                "deliberative_rag action '{}' has no query participants",
                ctx.action.id
            )));
        };
        let curators = self.seats(ctx, &config.curation_position_ids).await?;
        let thread = self.open_thread(ctx, &config).await?;
        let topic = ctx.task();

        let mut log: Vec<Exchange> = Vec::new();
        let mut responses: Vec<ParticipantResponse> = Vec::new();

        'rounds: for round in 1..=config.max_rounds.max(1) {
            for asker in &askers {
                let prompt = format!(
                    "Topic:\n{topic}\n\nQuestions and answers so far:\n{}\n\n\
                     Ask the single most useful next question about the topic. \
                     If the information gathered is sufficient, say so instead.",
                    if log.is_empty() { "(none yet)".to_string() } else { render_log(&log) }
                );
                let asked = ctx.ask(asker, &prompt, round).await?;
                let question = asked.content.clone();
                responses.push(asked);
                if signals_stop(&question) {
                    tracing::info!(action = %ctx.action.id, round, "Deliberation ended early");
                    break 'rounds;
                }
                self.log(ctx, thread.as_deref(), "user", &asker.role, &question).await?;

                let retrieved = self.retrieve(ctx, &config, &question).await?;
                let mut exchange = Exchange {
                    round,
                    asker: asker.role.clone(),
                    question: question.clone(),
                    answers: Vec::new(),
                };
                if curators.is_empty() {
                    exchange.answers.push(("retrieval".into(), retrieved));
                } else {
                    for curator in &curators {
                        let prompt = format!(
                            "Question: {question}\n\nRetrieved information:\n{retrieved}\n\n\
                             Answer the question using only the retrieved information."
                        );
                        let answered = ctx.ask(curator, &prompt, round).await?;
                        self.log(ctx, thread.as_deref(), "assistant", &curator.role, &answered.content)
                            .await?;
                        exchange.answers.push((curator.role.clone(), answered.content.clone()));
                        responses.push(answered);
                    }
                }
                log.push(exchange);
            }
        }

        let record = render_log(&log);
        let output = if config.synthesize && !log.is_empty() {
            let instruction = if config.synthesis_prompt.trim().is_empty() {
                "Summarize what was learned into a concise brief.".to_string()
            } else {
                ctx.resolve(&config.synthesis_prompt)
            };
            let prompt = format!("Topic:\n{topic}\n\nFindings:\n{record}\n\n{instruction}");
            let summary = ctx.ask(lead, &prompt, config.max_rounds.max(1) + 1).await?;
            let text = summary.content.clone();
            responses.push(summary);
            text
        } else {
            record
        };
        Ok(ActionOutcome::with_responses(Value::String(output), responses))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Harness;
    use super::*;
    use crate::collaborators::{Collaborators, Position};
    use crate::definition::Action;
    use crate::memory::{InMemoryAgentDirectory, InMemoryCurationStore, InMemoryThreadLog, StoreData};
    use council_llm::ScriptedClient;
    use serde_json::json;
    use std::sync::Arc;

    fn agents() -> Arc<InMemoryAgentDirectory> {
        let dir = InMemoryAgentDirectory::new();
        for id in ["asker", "librarian"] {
            dir.add_position(Position {
                id: id.into(),
                name: id.into(),
                ..Position::default()
            });
        }
        Arc::new(dir)
    }

    fn store() -> Arc<InMemoryCurationStore> {
        let store = InMemoryCurationStore::new();
        store.add_store(
            "lore",
            StoreData {
                name: "Lore".into(),
                entries: vec![json!({"id": "1", "text": "dragons fear frost"})],
            },
        );
        Arc::new(store)
    }

    fn action(config: DeliberativeConfig) -> Action {
        let mut action = Action::new("deliberate", ActionType::DeliberativeRag);
        action.prompt_template = "Defeating {{input}}".into();
        action.deliberative_config = Some(config);
        action
    }

    #[test]
    fn stop_phrases_are_case_insensitive() {
        assert!(signals_stop("That is SUFFICIENT."));
        assert!(signals_stop("No further questions"));
        assert!(!signals_stop("What do dragons fear?"));
    }

    #[tokio::test]
    async fn stops_early_and_synthesizes() {
        let llm = ScriptedClient::with_replies([
            "What do dragons fear?",
            "They fear frost.",
            "This is sufficient.",
            "Use frost.",
        ]);
        let threads = Arc::new(InMemoryThreadLog::new());
        let h = Harness::new(
            action(DeliberativeConfig {
                query_position_ids: vec!["asker".into()],
                curation_position_ids: vec!["librarian".into()],
                max_rounds: 5,
                log_to_thread: true,
                ..DeliberativeConfig::default()
            }),
            Collaborators::new()
                .with_agents(agents())
                .with_curation(store())
                .with_threads(threads.clone())
                .with_llm(Arc::new(llm.clone())),
        );
        let out = h.execute(json!("dragons")).await.unwrap();
        assert_eq!(out.output, json!("Use frost."));
        assert_eq!(llm.call_count(), 4);
        // the librarian saw the retrieval results
        let curator_prompt = llm.requests()[1].last_user_message().unwrap().to_string();
        assert!(curator_prompt.contains("[Lore]"));
        let synthesis = llm.requests()[3].last_user_message().unwrap().to_string();
        assert!(synthesis.contains("Q1 (asker): What do dragons fear?"));
        assert!(synthesis.contains("A (librarian): They fear frost."));

        let thread = &threads.threads()[0];
        assert_eq!(threads.messages(&thread.id).len(), 2);
    }

    #[tokio::test]
    async fn without_synthesis_the_log_is_the_output() {
        let llm = ScriptedClient::with_replies(["Where do dragons sleep?", "Why frost?"]);
        let h = Harness::new(
            action(DeliberativeConfig {
                query_position_ids: vec!["asker".into()],
                max_rounds: 2,
                synthesize: false,
                ..DeliberativeConfig::default()
            }),
            Collaborators::new()
                .with_agents(agents())
                .with_curation(store())
                .with_llm(Arc::new(llm.clone())),
        );
        let out = h.execute(json!("dragons")).await.unwrap();
        let text = out.output.as_str().unwrap();
        assert!(text.starts_with("Q1 (asker): Where do dragons sleep?"));
        assert!(text.contains("Q2 (asker): Why frost?"));
        assert!(text.contains("A (retrieval): [Lore]"));
        assert_eq!(out.responses.len(), 2);
    }

    #[tokio::test]
    async fn needs_query_participants() {
        let h = Harness::new(
            action(DeliberativeConfig::default()),
            Collaborators::new().with_agents(agents()).with_curation(store()),
        );
        let err = h.execute(json!("x")).await.unwrap_err();
        assert!(matches!(err, CouncilError::Configuration(_)));
    }

    #[tokio::test]
    async fn missing_curation_store_fails_before_asking() {
        let llm = ScriptedClient::with_replies(["Q?"]);
        let h = Harness::new(
            action(DeliberativeConfig {
                query_position_ids: vec!["asker".into()],
                rag_pipeline_id: "lore".into(),
                max_rounds: 1,
                synthesize: false,
                ..DeliberativeConfig::default()
            }),
            Collaborators::new()
                .with_agents(agents())
                .with_llm(Arc::new(llm.clone())),
        );
        let err = h.execute(json!("dragons")).await.unwrap_err();
        assert!(matches!(err, CouncilError::MissingCollaborator(_)));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn retrieval_limit_comes_from_config() {
        let store = InMemoryCurationStore::new();
        store.add_store(
            "lore",
            StoreData {
                name: "Lore".into(),
                entries: vec![
                    json!({"id": "1", "text": "dragons fear frost"}),
                    json!({"id": "2", "text": "dragons hoard gold"}),
                ],
            },
        );
        let llm = ScriptedClient::with_replies(["What about dragons?"]);
        let h = Harness::new(
            action(DeliberativeConfig {
                query_position_ids: vec!["asker".into()],
                max_rounds: 1,
                limit: 1,
                synthesize: false,
                ..DeliberativeConfig::default()
            }),
            Collaborators::new()
                .with_agents(agents())
                .with_curation(Arc::new(store))
                .with_llm(Arc::new(llm)),
        );
        let out = h.execute(json!("dragons")).await.unwrap();
        assert_eq!(out.output.as_str().unwrap().matches("[Lore]").count(), 1);
    }
}
