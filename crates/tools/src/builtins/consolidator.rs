use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use super::normalize_args;
use minerva_memory::consolidate;

use crate::{Tool, ToolCtx, ToolResult, ToolSpec};

/// Folds the scattered episodic notes of the last day into denser summary
/// notes and removes the originals.
pub struct MemoryConsolidatorTool;

#[async_trait]
impl Tool for MemoryConsolidatorTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "memory_consolidator",
            "Reads the notes added over the last day, merges them into denser summary notes \
             and cleans up the originals. Keeps memory tidy.",
            json!({
                "type": "object",
                "properties": {
                    "days": {"type": "integer", "description": "Look-back window in days (default 1)."}
                }
            }),
        )
        .non_cacheable()
    }

    async fn invoke(&self, args: Value, ctx: &ToolCtx) -> Result<ToolResult> {
        let args = normalize_args(args);
        let days = args.get("days").and_then(|v| v.as_i64()).unwrap_or(1);

        match consolidate(&ctx.memory, &ctx.llm, days).await {
            Ok(report) if report.source_notes == 0 => Ok(ToolResult::success(
                "No new notes to consolidate in the look-back window.",
            )),
            Ok(report) => Ok(ToolResult::success(format!(
                "Memory consolidated. {} source notes became {} summary notes; {} deleted.",
                report.source_notes, report.new_notes, report.deleted
            ))),
            Err(err) => Ok(ToolResult::error(format!("consolidation failed: {err}"))),
        }
    }
}
