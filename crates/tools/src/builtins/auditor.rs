use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use super::{arg_str, normalize_args};
use minerva_llm::extract_json_value;

use crate::{Tool, ToolCtx, ToolResult, ToolSpec};

/// Reviews a tool manifest and suggests concrete text edits. The creator
/// pipeline applies the suggestions and re-validates the artefact.
pub struct ManifestAuditorTool;

#[async_trait]
impl Tool for ManifestAuditorTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "manifest_auditor",
            "Audits a tool manifest file for quality problems and returns suggested edits. \
             Only audits manifest files, not websites, URLs or free text.",
            json!({
                "type": "object",
                "properties": {
                    "file_path": {"type": "string", "description": "Path of the manifest to audit."}
                },
                "required": ["file_path"]
            }),
        )
        .non_cacheable()
    }

    async fn invoke(&self, args: Value, ctx: &ToolCtx) -> Result<ToolResult> {
        let args = normalize_args(args);
        let Some(file_path) = arg_str(&args, "file_path") else {
            return Ok(ToolResult::error("missing 'file_path' in arguments"));
        };
        let content = match std::fs::read_to_string(&file_path) {
            Ok(content) => content,
            Err(err) => return Ok(ToolResult::error(format!("could not read '{file_path}': {err}"))),
        };

        let prompt = format!(
            "You are reviewing a tool manifest. Point out concrete quality problems — vague \
             descriptions, prompt templates that ignore their args, wrong capability lists — \
             as exact text replacements.\n\
             Respond with ONLY a JSON object of the form \
             {{\"suggestions\": [{{\"original\": \"<exact text>\", \"suggested\": \"<replacement>\", \
             \"reason\": \"<why>\"}}]}}. Use an empty list when the manifest is fine.\n\n\
             MANIFEST:\n---\n{content}\n---"
        );
        let reply = match ctx.llm.complete(&prompt, 1024).await {
            Ok(reply) => reply,
            Err(err) => return Ok(ToolResult::error(format!("auditor LLM call failed: {err}"))),
        };

        let suggestions = extract_json_value(&reply)
            .and_then(|v| v.get("suggestions").cloned())
            .filter(|s| s.is_array())
            .unwrap_or_else(|| json!([]));

        Ok(ToolResult::success(json!({"suggestions": suggestions})))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[tokio::test]
    async fn returns_parsed_suggestions() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join("x.tool.toml");
        std::fs::write(&manifest_path, "[tool]\nname = \"x\"").unwrap();

        let reply = r#"{"suggestions": [{"original": "name = \"x\"", "suggested": "name = \"xray\"", "reason": "clearer"}]}"#;
        let ctx = testing::ctx(&dir, &[reply]).await;

        let result = ManifestAuditorTool
            .invoke(json!({"file_path": manifest_path.to_string_lossy()}), &ctx)
            .await
            .unwrap();
        assert!(result.is_success());
        let suggestions = &result.result.unwrap()["suggestions"];
        assert_eq!(suggestions.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn prose_reply_yields_empty_suggestions() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join("x.tool.toml");
        std::fs::write(&manifest_path, "[tool]").unwrap();
        let ctx = testing::ctx(&dir, &["looks fine to me"]).await;

        let result = ManifestAuditorTool
            .invoke(json!({"file_path": manifest_path.to_string_lossy()}), &ctx)
            .await
            .unwrap();
        assert!(result.is_success());
        assert!(result.result.unwrap()["suggestions"].as_array().unwrap().is_empty());
    }
}
