//! Tool synthesis: ask the heavy LLM for a complete manifest artefact,
//! validate it, audit it, and quarantine it for approval.

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use crate::dynamic::DynamicTool;
use crate::registry::MANIFEST_SUFFIX;
use crate::{ToolCtx, ToolResult};

const MAX_ATTEMPTS: usize = 3;

/// Normalise a requested tool name to `[a-z0-9_]+`.
pub fn sanitize_tool_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_')
        .collect()
}

fn skeleton_prompt(tool_name: &str, task_description: &str, input_schema: &Value) -> String {
    let schema_toml = schema_as_toml(input_schema);
    format!(
        r#"You are an expert tool author. Write a complete manifest for a tool named `{tool_name}`.

**TASK:** {task_description}

**CRITICAL RULES:**
1. The manifest must have REAL functionality. Never leave placeholder text.
2. DO NOT change the `[tool]` block fields `name` and `input_schema`; they are pre-filled.
3. Pick `kind = "prompt"` (an instruction template run on a language model, with
   `{{{{arg_name}}}}` tokens standing in for the tool's args) or `kind = "http_get"`
   (a URL template fetched over HTTP).
4. List what the tool needs in `requires`: "llm" for prompt tools, "http" for http_get tools.

**TEMPLATE (copy this and fill the body):**
```toml
[tool]
name = "{tool_name}"
description = "{task_description}"
kind = "prompt"
cacheable = true
requires = ["llm"]

[tool.input_schema]
{schema_toml}

[prompt]
template = """<the complete instruction template, using {{{{arg_name}}}} tokens>"""
max_tokens = 512
```

Output the COMPLETE manifest now, inside a single ```toml code block."#
    )
}

/// Render a JSON Schema object as TOML key-value lines for the skeleton.
/// Falls back to a bare object type on anything unrepresentable.
fn schema_as_toml(schema: &Value) -> String {
    match toml::to_string(schema) {
        Ok(rendered) if !rendered.trim().is_empty() => rendered.trim_end().to_string(),
        _ => "type = \"object\"".to_string(),
    }
}

/// Pull the manifest body out of the LLM reply: fenced ```toml block first,
/// any fenced block second, the raw text last.
fn extract_manifest(text: &str) -> String {
    for fence in ["```toml", "```"] {
        if let Some(start) = text.find(fence) {
            let body = &text[start + fence.len()..];
            if let Some(end) = body.find("```") {
                return body[..end].trim().to_string();
            }
        }
    }
    text.trim().to_string()
}

/// Synthesise, validate and quarantine a new tool. On success the result
/// carries `special_action = "reload_tools"` and the artefact filename; its
/// message prompts approval.
pub async fn create_tool(
    ctx: &ToolCtx,
    task_description: &str,
    tool_name: &str,
    input_schema: &Value,
) -> Result<ToolResult> {
    let safe_name = sanitize_tool_name(tool_name);
    if safe_name.is_empty() || task_description.trim().is_empty() {
        return Ok(ToolResult::error(
            "missing arguments: task_description and tool_name are required",
        ));
    }

    let base_prompt = skeleton_prompt(&safe_name, task_description, input_schema);
    let mut last_error = String::new();

    for attempt in 1..=MAX_ATTEMPTS {
        info!(tool = %safe_name, attempt, "synthesising tool artefact");

        let prompt = if last_error.is_empty() {
            base_prompt.clone()
        } else {
            format!("{base_prompt}\n\nPREVIOUS ATTEMPT WAS REJECTED: {last_error}\nFix the problem and output the corrected manifest.")
        };

        let reply = match ctx.llm.complete(&prompt, 2500).await {
            Ok(reply) => reply,
            Err(err) => {
                last_error = err.to_string();
                continue;
            }
        };
        let manifest = extract_manifest(&reply);

        if let Err(err) = DynamicTool::from_manifest_str(&manifest, Some(&safe_name)) {
            last_error = err.to_string();
            warn!(tool = %safe_name, attempt, error = %last_error, "generated manifest rejected");
            continue;
        }

        let filename = format!("{safe_name}{MANIFEST_SUFFIX}");
        let quarantine_dir = &ctx.registry.dirs().quarantine_dir;
        std::fs::create_dir_all(quarantine_dir)?;
        let path = quarantine_dir.join(&filename);
        std::fs::write(&path, &manifest)
            .with_context(|| format!("writing tool artefact {}", path.display()))?;
        info!(tool = %safe_name, path = %path.display(), "tool artefact quarantined");

        audit_artefact(ctx, &path, &safe_name).await;

        let mut result = ToolResult::success(format!(
            "New tool '{filename}' was created and quarantined. \
             Use review_and_approve_tool to approve it before use."
        ));
        result.special_action = Some("reload_tools".to_string());
        result.tool_filename = Some(filename);
        return Ok(result);
    }

    Ok(ToolResult::error(format!(
        "tool creation failed after {MAX_ATTEMPTS} attempts. Last error: {last_error}"
    )))
}

/// Run the manifest auditor over a freshly written artefact, apply its
/// suggested edits, and keep the original whenever the edited artefact fails
/// re-validation. Auditor failures are non-fatal.
async fn audit_artefact(ctx: &ToolCtx, path: &std::path::Path, expected_name: &str) {
    let Some(auditor) = ctx.registry.get("manifest_auditor") else {
        return;
    };
    let args = serde_json::json!({"file_path": path.to_string_lossy()});
    let audit = match auditor.invoke(args, ctx).await {
        Ok(result) if result.is_success() => result,
        Ok(_) | Err(_) => {
            warn!("manifest auditor did not produce a usable review");
            return;
        }
    };

    let suggestions = audit
        .result
        .as_ref()
        .and_then(|r| r.get("suggestions"))
        .and_then(|s| s.as_array())
        .cloned()
        .unwrap_or_default();
    if suggestions.is_empty() {
        info!("manifest auditor found no issues");
        return;
    }

    let Ok(original) = std::fs::read_to_string(path) else {
        return;
    };
    let mut edited = original.clone();
    let mut applied = 0usize;
    for suggestion in &suggestions {
        let (Some(from), Some(to)) = (
            suggestion.get("original").and_then(|v| v.as_str()),
            suggestion.get("suggested").and_then(|v| v.as_str()),
        ) else {
            continue;
        };
        if edited.contains(from) {
            edited = edited.replace(from, to);
            applied += 1;
        }
    }
    if applied == 0 {
        return;
    }

    match DynamicTool::from_manifest_str(&edited, Some(expected_name)) {
        Ok(_) => {
            if std::fs::write(path, edited).is_ok() {
                info!(applied, "auditor suggestions applied");
            }
        }
        Err(err) => {
            warn!(%err, "audited manifest failed re-validation, keeping original");
        }
    }
}
