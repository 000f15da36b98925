use async_trait::async_trait;
use serde_json::Value;

use council_template::stringify;
use council_types::Result;

use super::{ActionContext, ActionHandler, ActionOutcome};
use crate::collaborators::{RagQuery, RagResponse};
use crate::definition::ActionType;

/// Output of a retrieval that found nothing.
pub const NO_RESULTS: &str = "No relevant information found.";

/// One `[storeName] json` line per hit, or [`NO_RESULTS`].
pub fn format_rag_results(response: &RagResponse) -> String {
    if response.results.is_empty() {
        return NO_RESULTS.to_string();
    }
    response
        .results
        .iter()
        .map(|hit| format!("[{}] {}", hit.store_name, hit.entry))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Handler for `rag_pipeline` actions.
pub struct RagHandler;

#[async_trait]
impl ActionHandler for RagHandler {
    fn action_type(&self) -> ActionType {
        ActionType::RagPipeline
    }

    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome> {
        let config = ctx.action.rag_config.clone().unwrap_or_default();
        let curation = ctx.collaborators.curation()?;

        let query = if config.query_template.trim().is_empty() {
            stringify(&ctx.input)
        } else {
            ctx.resolve(&config.query_template)
        };
        let response = curation
            .execute_rag(
                &config.pipeline_id,
                &RagQuery {
                    query: query.clone(),
                    limit: config.limit,
                },
            )
            .await?;
        tracing::info!(
            action = %ctx.action.id,
            pipeline = %config.pipeline_id,
            hits = response.count,
            "Retrieval complete"
        );
        Ok(ActionOutcome::output(Value::String(format_rag_results(&response))))
    }
}
