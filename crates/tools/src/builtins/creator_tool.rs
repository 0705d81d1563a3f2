use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use super::{arg_str, normalize_args};
use crate::creator::create_tool;
use crate::{Tool, ToolCtx, ToolResult, ToolSpec};

/// Synthesises a brand-new tool artefact from a task description and
/// quarantines it for approval.
pub struct ToolCreatorTool;

#[async_trait]
impl Tool for ToolCreatorTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "tool_creator",
            "Creates a new tool with real functionality for a given task, validates the \
             artefact and quarantines it for approval.",
            json!({
                "type": "object",
                "properties": {
                    "task_description": {
                        "type": "string",
                        "description": "What the tool should do (e.g. 'fetch the HTTP headers of a URL')."
                    },
                    "tool_name": {
                        "type": "string",
                        "description": "Artefact name (e.g. 'http_header_checker')."
                    },
                    "input_schema": {
                        "type": "object",
                        "description": "JSON Schema of the tool's parameters."
                    }
                },
                "required": ["task_description", "tool_name"]
            }),
        )
        .non_cacheable()
    }

    async fn invoke(&self, args: Value, ctx: &ToolCtx) -> Result<ToolResult> {
        let args = normalize_args(args);
        let Some(task_description) = arg_str(&args, "task_description") else {
            return Ok(ToolResult::error(
                "missing arguments: task_description and tool_name are required",
            ));
        };
        let Some(tool_name) = arg_str(&args, "tool_name") else {
            return Ok(ToolResult::error(
                "missing arguments: task_description and tool_name are required",
            ));
        };
        let input_schema = args
            .get("input_schema")
            .cloned()
            .unwrap_or_else(|| json!({"type": "object"}));

        create_tool(ctx, &task_description, &tool_name, &input_schema).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ToolStatus, testing};

    #[tokio::test]
    async fn missing_arguments_error_out() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = testing::ctx(&dir, &[]).await;
        let result = ToolCreatorTool
            .invoke(json!({"task_description": "only half"}), &ctx)
            .await
            .unwrap();
        assert_eq!(result.status, ToolStatus::Error);
    }

    #[tokio::test]
    async fn string_args_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let reply = r#"```toml
[tool]
name = "echoer"
description = "echoes"
kind = "prompt"
requires = ["llm"]

[prompt]
template = "Repeat exactly: {{text}}"
```"#;
        let ctx = testing::ctx(&dir, &[reply]).await;

        let raw = r#"{"task_description": "echoes", "tool_name": "echoer"}"#;
        let result = ToolCreatorTool
            .invoke(Value::String(raw.to_string()), &ctx)
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.tool_filename.as_deref(), Some("echoer.tool.toml"));
    }
}
