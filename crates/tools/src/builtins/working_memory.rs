use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use super::{arg_str, normalize_args};
use crate::{Tool, ToolCtx, ToolResult, ToolSpec};

/// The planner scratchpad: set a value under a key in one step, read it back
/// in a later step via the `{{working_memory.get('key')}}` placeholder.
pub struct WorkingMemoryTool;

#[async_trait]
impl Tool for WorkingMemoryTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "working_memory",
            "Store and retrieve intermediate results between plan steps. Use action 'set' \
             with key and value, or action 'get' with key.",
            json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["get", "set"]},
                    "key": {"type": "string"},
                    "value": {"type": "string"}
                },
                "required": ["action", "key"]
            }),
        )
        .non_cacheable()
    }

    async fn invoke(&self, args: Value, ctx: &ToolCtx) -> Result<ToolResult> {
        let args = normalize_args(args);
        let Some(action) = arg_str(&args, "action") else {
            return Ok(ToolResult::error("missing 'action' in arguments"));
        };
        let Some(key) = arg_str(&args, "key") else {
            return Ok(ToolResult::error("missing 'key' in arguments"));
        };

        match action.as_str() {
            "set" => {
                let value = match args.get("value") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => return Ok(ToolResult::error("missing 'value' for action 'set'")),
                };
                ctx.working_set(&key, value);
                Ok(ToolResult::success(format!("stored under key '{key}'")))
            }
            "get" => match ctx.working_get(&key) {
                Some(value) => Ok(ToolResult::success(value)),
                None => Ok(ToolResult::error(format!("no value stored under key '{key}'"))),
            },
            other => Ok(ToolResult::error(format!(
                "unknown action '{other}' (expected 'get' or 'set')"
            ))),
        }
    }
}
