use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use super::{arg_str, normalize_args};
use crate::{Tool, ToolCtx, ToolResult, ToolSpec};

/// Manages quarantined tool artefacts: list them, show their content, and
/// approve (move to the community directory, reloading the registry) or
/// reject (delete) them.
pub struct ReviewAndApproveTool;

#[async_trait]
impl Tool for ReviewAndApproveTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "review_and_approve_tool",
            "Lists quarantined tools, shows their content, and approves or rejects them. \
             Approved tools move to the community directory and become callable.",
            json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["list", "review", "approve", "reject"]},
                    "tool_filename": {"type": "string"}
                },
                "required": ["action"]
            }),
        )
        .non_cacheable()
    }

    async fn invoke(&self, args: Value, ctx: &ToolCtx) -> Result<ToolResult> {
        let args = normalize_args(args);
        // Accept "<action> <filename>" as a bare string as well.
        let (action, filename) = match &args {
            Value::String(raw) => {
                let mut parts = raw.trim().splitn(2, ' ');
                (
                    parts.next().unwrap_or_default().to_string(),
                    parts.next().map(|s| s.trim().to_string()),
                )
            }
            other => (
                arg_str(other, "action").unwrap_or_default(),
                arg_str(other, "tool_filename"),
            ),
        };

        // An omitted action with a filename means approval; the controller's
        // hard-break path relies on this.
        let action = if action.is_empty() && filename.is_some() {
            "approve".to_string()
        } else {
            action
        };
        if action.is_empty() {
            return Ok(ToolResult::error(
                "no action given. Use 'list', 'review', 'approve' or 'reject'.",
            ));
        }

        match action.as_str() {
            "list" => {
                let quarantined = ctx.registry.quarantined();
                if quarantined.is_empty() {
                    Ok(ToolResult::success("No tools are waiting in quarantine."))
                } else {
                    Ok(ToolResult::success(format!(
                        "Quarantined tools: {}",
                        quarantined.join(", ")
                    )))
                }
            }
            "review" | "approve" | "reject" => {
                let Some(filename) = filename.filter(|f| !f.is_empty()) else {
                    return Ok(ToolResult::error("this action requires a 'tool_filename'"));
                };
                match action.as_str() {
                    "review" => match ctx.registry.read_quarantined(&filename) {
                        Ok(content) => Ok(ToolResult::success(format!(
                            "--- content of {filename} ---\n\n{content}"
                        ))),
                        Err(err) => Ok(ToolResult::error(format!(
                            "could not read '{filename}': {err}"
                        ))),
                    },
                    "approve" => match ctx.registry.approve(&filename) {
                        Ok(()) => {
                            let mut result = ToolResult::success(format!(
                                "Tool '{filename}' was approved and moved to the community \
                                 directory. Tools are reloading."
                            ));
                            result.special_action = Some("reload_tools".to_string());
                            result.tool_filename = Some(filename);
                            Ok(result)
                        }
                        Err(err) => Ok(ToolResult::error(format!(
                            "could not approve '{filename}': {err}"
                        ))),
                    },
                    _ => match ctx.registry.reject(&filename) {
                        Ok(()) => Ok(ToolResult::success(format!(
                            "Tool '{filename}' was rejected and deleted."
                        ))),
                        Err(err) => Ok(ToolResult::error(format!(
                            "could not reject '{filename}': {err}"
                        ))),
                    },
                }
            }
            other => Ok(ToolResult::error(format!(
                "invalid action '{other}'. Use 'list', 'review', 'approve' or 'reject'."
            ))),
        }
    }
}
