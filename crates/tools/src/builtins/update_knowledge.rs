use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::warn;

use super::{arg_str, normalize_args};
use crate::{Tool, ToolCtx, ToolResult, ToolSpec};

/// Replaces a piece of episodic knowledge: deletes the outdated record and
/// inserts the corrected version. The contradiction-reconciliation flow calls
/// this after merging old and new information.
pub struct UpdateKnowledgeTool;

#[async_trait]
impl Tool for UpdateKnowledgeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "update_knowledge",
            "Updates a piece of knowledge in memory. Deletes the old information and adds \
             the new, corrected version.",
            json!({
                "type": "object",
                "properties": {
                    "old_knowledge_text": {
                        "type": "string",
                        "description": "The exact text of the outdated knowledge to delete."
                    },
                    "updated_knowledge_text": {
                        "type": "string",
                        "description": "The corrected knowledge to add."
                    }
                },
                "required": ["old_knowledge_text", "updated_knowledge_text"]
            }),
        )
        .non_cacheable()
    }

    async fn invoke(&self, args: Value, ctx: &ToolCtx) -> Result<ToolResult> {
        let args = normalize_args(args);
        let (Some(old_text), Some(new_text)) = (
            arg_str(&args, "old_knowledge_text"),
            arg_str(&args, "updated_knowledge_text"),
        ) else {
            return Ok(ToolResult::error(
                "both old_knowledge_text and updated_knowledge_text must be provided",
            ));
        };

        let deleted = ctx.memory.delete_by_content(&old_text)?;
        if deleted == 0 {
            warn!("old knowledge not found for replacement");
        }
        ctx.memory.add(&new_text).await?;

        Ok(ToolResult::success(format!(
            "Knowledge updated. Replaced {deleted} record(s) with: {new_text}"
        )))
    }
}
