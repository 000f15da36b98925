use std::time::Duration;

use async_trait::async_trait;

use council_types::{CouncilError, Result};

use super::{ActionContext, ActionHandler, ActionOutcome};
use crate::definition::ActionType;
use crate::events::PipelineEvent;
use crate::gavel::{GavelKey, GavelOutcome};

/// Handler for `user_gavel` actions: suspends until a caller resolves the
/// gavel for this action, or the gavel timeout elapses.
pub struct UserGavelHandler;

#[async_trait]
impl ActionHandler for UserGavelHandler {
    fn action_type(&self) -> ActionType {
        ActionType::UserGavel
    }

    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome> {
        let config = ctx.action.gavel_config.clone().unwrap_or_default();
        let key = GavelKey::Action(ctx.action.id.clone());
        let prompt = if config.prompt.trim().is_empty() {
            format!("Review the input to '{}'", ctx.action.name)
        } else {
            ctx.resolve(&config.prompt)
        };

        (ctx.on_respond)();
        ctx.emit(PipelineEvent::GavelRequested {
            run_id: ctx.run_id.to_string(),
            key: key.to_string(),
            prompt: prompt.clone(),
            value: ctx.input.clone(),
        });

        let outcome = ctx
            .gavels
            .wait(
                key.clone(),
                prompt,
                ctx.input.clone(),
                config.timeout_ms.map(Duration::from_millis),
                ctx.cancel,
            )
            .await?;

        let (output, skipped) = match outcome {
            GavelOutcome::Resolved(value) => (value, false),
            GavelOutcome::TimedOut if config.can_skip => {
                tracing::info!(gavel = %key, "Gavel timed out, passing input through");
                (ctx.input.clone(), true)
            }
            GavelOutcome::TimedOut => {
                return Err(CouncilError::GavelTimeout {
                    key: key.to_string(),
                    timeout_ms: config.timeout_ms.unwrap_or_default(),
                })
            }
        };
        ctx.emit(PipelineEvent::GavelResolved {
            run_id: ctx.run_id.to_string(),
            key: key.to_string(),
            skipped,
        });
        Ok(ActionOutcome::output(output))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Harness;
    use super::*;
    use crate::collaborators::Collaborators;
    use crate::definition::{Action, GavelConfig};
    use serde_json::json;

    fn gavel(timeout_ms: Option<u64>, can_skip: bool) -> Action {
        let mut action = Action::new("review", ActionType::UserGavel);
        action.gavel_config = Some(GavelConfig {
            prompt: "Approve {{input}}?".into(),
            timeout_ms,
            can_skip,
        });
        action
    }

    #[tokio::test]
    async fn resolved_value_becomes_output() {
        let h = Harness::new(gavel(None, true), Collaborators::new());
        let mut events = h.events.subscribe();
        let run = h.execute(json!("draft"));
        let resolve = async {
            while !h.gavels.is_pending(&GavelKey::Action("review".into())) {
                tokio::task::yield_now().await;
            }
            let pending = h.gavels.pending();
            assert_eq!(pending[0].prompt, "Approve draft?");
            h.gavels
                .resolve(&GavelKey::Action("review".into()), json!("edited"))
                .unwrap();
        };
        let (out, _) = tokio::join!(run, resolve);
        assert_eq!(out.unwrap().output, json!("edited"));
        assert_eq!(events.recv().await.unwrap().name(), "gavel_requested");
        assert_eq!(
            events.recv().await.unwrap(),
            PipelineEvent::GavelResolved {
                run_id: "run-test".into(),
                key: "action:review".into(),
                skipped: false
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_with_skip_passes_input_through() {
        let h = Harness::new(gavel(Some(1_000), true), Collaborators::new());
        let out = h.execute(json!("draft")).await.unwrap();
        assert_eq!(out.output, json!("draft"));
        assert!(h.gavels.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_without_skip_fails() {
        let h = Harness::new(gavel(Some(1_000), false), Collaborators::new());
        let err = h.execute(json!("draft")).await.unwrap_err();
        assert!(matches!(err, CouncilError::GavelTimeout { timeout_ms: 1_000, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn abort_releases_the_wait() {
        let h = Harness::new(gavel(None, true), Collaborators::new());
        h.cancel.cancel();
        let err = h.execute(json!("draft")).await.unwrap_err();
        assert!(err.is_abort());
    }
}
