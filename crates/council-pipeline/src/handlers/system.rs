use async_trait::async_trait;
use serde_json::Value;

use council_types::Result;

use super::{ActionContext, ActionHandler, ActionOutcome};
use crate::definition::ActionType;

/// Handler for `system` actions: a pure template transform of the input.
/// Without a template the input passes through unchanged.
pub struct SystemHandler;

#[async_trait]
impl ActionHandler for SystemHandler {
    fn action_type(&self) -> ActionType {
        ActionType::System
    }

    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome> {
        let template = &ctx.action.prompt_template;
        if template.trim().is_empty() {
            return Ok(ActionOutcome::output(ctx.input.clone()));
        }
        let output = ctx
            .resolver
            .resolve_value(&Value::String(template.clone()), &ctx.template);
        tracing::debug!(action = %ctx.action.id, "System transform applied");
        Ok(ActionOutcome::output(output))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Harness;
    use crate::collaborators::Collaborators;
    use crate::definition::{Action, ActionType};
    use serde_json::json;

    fn system(template: &str) -> Action {
        let mut action = Action::new("sys", ActionType::System);
        action.prompt_template = template.into();
        action
    }

    #[tokio::test]
    async fn echo_template() {
        let h = Harness::new(system("ECHO: {{input}}"), Collaborators::new());
        let out = h.execute(json!("hi")).await.unwrap();
        assert_eq!(out.output, json!("ECHO: hi"));
        assert!(out.responses.is_empty());
    }

    #[tokio::test]
    async fn empty_template_passes_input_through() {
        let h = Harness::new(system(""), Collaborators::new());
        let out = h.execute(json!({"a": 1})).await.unwrap();
        assert_eq!(out.output, json!({"a": 1}));
    }

    #[tokio::test]
    async fn single_token_keeps_shape() {
        let h = Harness::new(system("{{input}}"), Collaborators::new());
        let out = h.execute(json!(["x", "y"])).await.unwrap();
        assert_eq!(out.output, json!(["x", "y"]));
    }

    #[tokio::test]
    async fn host_macros_survive() {
        let h = Harness::new(system("{{char}} says {{input | upper}}"), Collaborators::new());
        let out = h.execute(json!("hello")).await.unwrap();
        assert_eq!(out.output, json!("{{char}} says HELLO"));
    }
}
