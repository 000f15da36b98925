use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use council_llm::GenerateOptions;
use council_template::{stringify, TemplateContext};
use council_types::{ParticipantResponse, Result};

use super::rag::format_rag_results;
use super::{ActionContext, ActionHandler, ActionOutcome};
use crate::definition::{ActionType, ExpertSource};
use crate::orchestration::{final_output, Orchestrator};
use crate::participants::{ParticipantResolver, ResolvedParticipant};
use crate::collaborators::RagQuery;

/// Handler for `standard` actions: optional retrieval pre-fetch, participant
/// resolution, then the configured orchestration mode.
pub struct StandardHandler;

impl StandardHandler {
    /// Run the retrieval pre-fetch and expose it as the `rag` scope. Returns
    /// the formatted hits when anything was found.
    async fn prefetch(&self, ctx: &ActionContext<'_>, template: &mut TemplateContext) -> Result<Option<String>> {
        let rag = &ctx.action.rag;
        if !rag.enabled {
            return Ok(None);
        }
        let query = if rag.query_template.trim().is_empty() {
            stringify(&ctx.input)
        } else {
            ctx.resolver.resolve(&rag.query_template, template)
        };
        let response = ctx
            .collaborators
            .curation()?
            .execute_rag(
                &rag.pipeline_id,
                &RagQuery {
                    query: query.clone(),
                    limit: rag.limit,
                },
            )
            .await?;
        let text = format_rag_results(&response);
        let results = serde_json::to_value(&response.results)?;
        template.set_scope(
            "rag",
            json!({
                "query": query,
                "count": response.count,
                "results": results,
                "text": text.clone(),
            }),
        );
        tracing::debug!(action = %ctx.action.id, hits = response.count, "Retrieval pre-fetch");
        Ok((response.count > 0).then_some(text))
    }

    fn expert_text(&self, ctx: &ActionContext<'_>, template: &TemplateContext, task: &str) -> String {
        let experts = &ctx.action.participants.dynamic_experts;
        match experts.source {
            ExpertSource::Input => stringify(&ctx.input),
            ExpertSource::Prompt => task.to_string(),
            ExpertSource::PhaseInput => template
                .lookup("phase.input")
                .map(|v| stringify(&v))
                .unwrap_or_default(),
            ExpertSource::Custom => ctx.resolver.resolve(&experts.custom_text, template),
        }
    }

    /// Resolve the prompt template once per participant with the `agent`
    /// and `position` scopes set.
    fn participant_prompts(
        &self,
        ctx: &ActionContext<'_>,
        template: &TemplateContext,
        participants: &[ResolvedParticipant],
        injected: Option<&str>,
    ) -> Result<HashMap<String, String>> {
        let source = &ctx.action.prompt_template;
        if !(source.contains("agent.") || source.contains("position.")) {
            return Ok(HashMap::new());
        }
        let mut prompts = HashMap::with_capacity(participants.len());
        for p in participants {
            let mut scoped = template.clone();
            scoped.set_scope("agent", serde_json::to_value(&p.agent)?);
            if let Some(position) = &p.position {
                scoped.set_scope("position", serde_json::to_value(position)?);
            }
            let prompt = with_injection(ctx.resolver.resolve(source, &scoped), injected);
            prompts.insert(p.position_id.clone(), prompt);
        }
        Ok(prompts)
    }
}

fn with_injection(task: String, injected: Option<&str>) -> String {
    match injected {
        Some(text) => format!("{task}\n\n## Retrieved context\n{text}"),
        None => task,
    }
}

#[async_trait]
impl ActionHandler for StandardHandler {
    fn action_type(&self) -> ActionType {
        ActionType::Standard
    }

    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome> {
        let action = ctx.action;
        let mut template = ctx.template.clone();
        let retrieved = self.prefetch(ctx, &mut template).await?;

        let base = if action.prompt_template.trim().is_empty() {
            stringify(&ctx.input)
        } else {
            ctx.resolver.resolve(&action.prompt_template, &template)
        };
        // Hits go into the prompt unless the template already places them.
        let injected = retrieved
            .as_deref()
            .filter(|_| action.rag.inject && !action.prompt_template.contains("rag."));
        let task = with_injection(base, injected);

        let expert_text = self.expert_text(ctx, &template, &task);
        let participants = ParticipantResolver::new(ctx.collaborators)
            .with_timeout_ms(ctx.timeout_ms)
            .resolve(&action.participants, &expert_text)
            .await?;
        let llm = ctx.llm()?;

        if participants.is_empty() {
            tracing::debug!(action = %action.id, "No participants, single generate call");
            let options = GenerateOptions {
                timeout_ms: Some(ctx.timeout_ms),
                ..GenerateOptions::default()
            };
            let text = llm.generate(&task, &options).await?;
            return Ok(ActionOutcome::output(Value::String(text)));
        }

        let prompts = self.participant_prompts(ctx, &template, &participants, injected)?;
        let observer = |r: &ParticipantResponse| ctx.responded(r);
        let responses = Orchestrator::new(llm, &action.id, ctx.cancel)
            .with_timeout_ms(ctx.timeout_ms)
            .with_prompts(&prompts)
            .with_observer(&observer)
            .run(
                action.participants.orchestration,
                &participants,
                &task,
                action.participants.max_rounds,
            )
            .await?;

        tracing::info!(
            action = %action.id,
            mode = action.participants.orchestration.as_str(),
            responses = responses.len(),
            "Orchestration complete"
        );
        Ok(ActionOutcome::with_responses(final_output(&responses), responses))
    }
}
