use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use council_template::{stringify, TemplateContext, TemplateResolver};
use council_types::{CouncilError, Result};

use super::{ActionContext, ActionHandler, ActionOutcome};
use crate::definition::{ActionType, CrudConfig, CrudOperation};
use crate::routing::get_path;

/// Build an object from a field mapping. Sources containing `{{` are
/// templates; anything else is a dot path into `source` (`.` or empty for
/// the whole value). Missing paths map to `null`.
pub fn map_fields(
    mapping: &BTreeMap<String, String>,
    source: &Value,
    resolver: &TemplateResolver,
    ctx: &TemplateContext,
) -> Value {
    let mut out = Map::new();
    for (target, from) in mapping {
        let from = from.trim();
        let value = if from.contains("{{") {
            resolver.resolve_value(&Value::String(from.to_string()), ctx)
        } else if from.is_empty() || from == "." {
            source.clone()
        } else {
            get_path(source, from).cloned().unwrap_or(Value::Null)
        };
        out.insert(target.clone(), value);
    }
    Value::Object(out)
}

/// Handler for `crud_pipeline` actions: one create/read/update/delete call.
pub struct CrudHandler;

impl CrudHandler {
    /// Fill empty fields from the named CRUD pipeline. A pipeline supplies the
    /// operation only when the action names no store of its own.
    async fn effective_config(&self, ctx: &ActionContext<'_>) -> Result<CrudConfig> {
        let mut config = ctx.action.crud_config.clone().unwrap_or_default();
        let Some(pipeline_id) = config.crud_pipeline_id.clone().filter(|id| !id.trim().is_empty()) else {
            return Ok(config);
        };
        let def = ctx
            .collaborators
            .curation()?
            .crud_pipeline(&pipeline_id)
            .await
            .ok_or_else(|| {
                CouncilError::Configuration(format!("CRUD pipeline '{pipeline_id}' is not registered"))
            })?;
        if config.store_id.trim().is_empty() {
            config.store_id = def.store_id;
            config.operation = def.operation;
        }
        if config.input_mapping.is_empty() {
            config.input_mapping = def.input_mapping;
        }
        if config.output_mapping.is_empty() {
            config.output_mapping = def.output_mapping;
        }
        Ok(config)
    }
}

#[async_trait]
impl ActionHandler for CrudHandler {
    fn action_type(&self) -> ActionType {
        ActionType::CrudPipeline
    }

    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome> {
        let config = self.effective_config(ctx).await?;
        let curation = ctx.collaborators.curation()?;
        let store_id = config.store_id.trim();
        if store_id.is_empty() {
            return Err(CouncilError::Configuration(format!(
                "crud_pipeline action '{}' names no store",
                ctx.action.id
            )));
        }

        let data = if config.input_mapping.is_empty() {
            ctx.input.clone()
        } else {
            map_fields(&config.input_mapping, &ctx.input, ctx.resolver, &ctx.template)
        };
        let entry_id = {
            let templated = ctx.resolve(&config.entry_id);
            let templated = templated.trim();
            if !templated.is_empty() && !templated.contains("{{") {
                Some(templated.to_string())
            } else {
                data.get("id").or_else(|| ctx.input.get("id")).map(stringify)
            }
        };
        let require_entry = || {
            entry_id.clone().ok_or_else(|| {
                CouncilError::Configuration(format!(
                    "crud_pipeline action '{}' needs an entry id for {:?}",
                    ctx.action.id, config.operation
                ))
            })
        };

        let result = match config.operation {
            CrudOperation::Create => curation.create(store_id, data).await?,
            CrudOperation::Read => curation.read(store_id, entry_id.as_deref()).await?,
            CrudOperation::Update => curation.update(store_id, &require_entry()?, data).await?,
            CrudOperation::Delete => {
                let id = require_entry()?;
                let deleted = curation.delete(store_id, &id).await?;
                json!({"id": id, "deleted": deleted})
            }
        };
        tracing::info!(
            action = %ctx.action.id,
            store = %store_id,
            operation = ?config.operation,
            "CRUD call complete"
        );

        let output = if config.output_mapping.is_empty() {
            result
        } else {
            map_fields(&config.output_mapping, &result, ctx.resolver, &ctx.template)
        };
        Ok(ActionOutcome::output(output))
    }
}
