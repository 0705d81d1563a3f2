use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use super::{arg_str, normalize_args};
use crate::{Tool, ToolCtx, ToolResult, ToolSpec};

/// Asks the user for extra information. Emitting `clarification_needed`
/// halts the current plan until the user answers.
pub struct ChatTool;

#[async_trait]
impl Tool for ChatTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "chat",
            "Ask the user for additional information or clarification. Use only when the \
             goal is ambiguous or missing critical details.",
            json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string", "description": "The question to put to the user."}
                },
                "required": ["message"]
            }),
        )
        .non_cacheable()
    }

    async fn invoke(&self, args: Value, _ctx: &ToolCtx) -> Result<ToolResult> {
        let args = normalize_args(args);
        let message = match &args {
            Value::String(s) => Some(s.clone()),
            other => arg_str(other, "message"),
        };
        match message.filter(|m| !m.trim().is_empty()) {
            Some(message) => Ok(ToolResult::clarification(message)),
            None => Ok(ToolResult::error("missing 'message' in arguments")),
        }
    }
}
