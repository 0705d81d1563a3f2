//! Runtime-loaded manifest tools.
//!
//! A dynamic tool is a reviewable TOML artefact (`*.tool.toml`) exposing the
//! standard descriptor plus an execution body. Two kinds exist: `prompt`
//! (a template run on the heavy LLM) and `http_get` (a URL fetched over
//! HTTP). Args are substituted into the body via `{{arg_name}}` tokens.

use std::path::Path;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::{Tool, ToolCtx, ToolResult, ToolSpec};

/// Capabilities a manifest may require. Anything else fails validation.
const KNOWN_CAPABILITIES: &[&str] = &["llm", "http"];

/// Strings that mark an unfinished artefact. Generated manifests containing
/// any of these are rejected.
pub(crate) const FORBIDDEN_MARKERS: &[&str] = &[
    "TODO",
    "YOUR PROMPT HERE",
    "YOUR URL HERE",
    "PLACEHOLDER",
    "mock data",
    "dummy response",
];

#[derive(Debug, Deserialize)]
struct Manifest {
    tool: ManifestTool,
    #[serde(default)]
    prompt: Option<ManifestPrompt>,
    #[serde(default)]
    http_get: Option<ManifestHttpGet>,
}

#[derive(Debug, Deserialize)]
struct ManifestTool {
    name: String,
    description: String,
    kind: String,
    #[serde(default = "default_cacheable")]
    cacheable: bool,
    #[serde(default)]
    requires: Vec<String>,
    #[serde(default)]
    input_schema: Option<toml::Value>,
}

fn default_cacheable() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ManifestPrompt {
    template: String,
    #[serde(default = "default_max_tokens")]
    max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    512
}

#[derive(Debug, Deserialize)]
struct ManifestHttpGet {
    url: String,
}

#[derive(Debug, Clone)]
enum DynamicKind {
    Prompt { template: String, max_tokens: u32 },
    HttpGet { url: String },
}

/// A tool backed by a manifest artefact on disk.
#[derive(Debug, Clone)]
pub struct DynamicTool {
    spec: ToolSpec,
    kind: DynamicKind,
}

impl DynamicTool {
    /// Parse and validate a manifest. `expected_name` enforces the
    /// creator-pipeline rule that the artefact names exactly the requested
    /// tool.
    pub fn from_manifest_str(raw: &str, expected_name: Option<&str>) -> Result<Self> {
        for marker in FORBIDDEN_MARKERS {
            if raw.contains(marker) {
                bail!("manifest contains forbidden placeholder text: '{marker}'");
            }
        }

        let manifest: Manifest = toml::from_str(raw).context("manifest is not well-formed TOML")?;
        let tool = &manifest.tool;

        if tool.name.is_empty() || !tool.name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
            bail!("tool name '{}' must match [a-z0-9_]+", tool.name);
        }
        if let Some(expected) = expected_name {
            if tool.name != expected {
                bail!("tool name mismatch: expected '{expected}', found '{}'", tool.name);
            }
        }
        if tool.description.trim().is_empty() {
            bail!("tool description must not be empty");
        }
        for capability in &tool.requires {
            if !KNOWN_CAPABILITIES.contains(&capability.as_str()) {
                bail!("manifest requires unknown capability '{capability}'");
            }
        }

        let kind = match tool.kind.as_str() {
            "prompt" => {
                let prompt = manifest
                    .prompt
                    .as_ref()
                    .context("kind = \"prompt\" requires a [prompt] section")?;
                if prompt.template.trim().is_empty() {
                    bail!("prompt template must not be empty");
                }
                DynamicKind::Prompt {
                    template: prompt.template.clone(),
                    max_tokens: prompt.max_tokens,
                }
            }
            "http_get" => {
                let http = manifest
                    .http_get
                    .as_ref()
                    .context("kind = \"http_get\" requires an [http_get] section")?;
                if http.url.trim().is_empty() {
                    bail!("http_get url must not be empty");
                }
                DynamicKind::HttpGet {
                    url: http.url.clone(),
                }
            }
            other => bail!("unknown tool kind '{other}' (expected 'prompt' or 'http_get')"),
        };

        let input_schema = match &tool.input_schema {
            Some(value) => serde_json::to_value(value)?,
            None => serde_json::json!({"type": "object"}),
        };

        let mut spec = ToolSpec::new(tool.name.clone(), tool.description.clone(), input_schema);
        spec.cacheable = tool.cacheable;
        Ok(Self { spec, kind })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        Self::from_manifest_str(&raw, None)
            .with_context(|| format!("loading manifest {}", path.display()))
    }
}

/// Replace every `{{key}}` token with the matching arg's string form.
fn substitute(template: &str, args: &Value) -> String {
    let mut out = template.to_string();
    if let Some(map) = args.as_object() {
        for (key, value) in map {
            let token = format!("{{{{{key}}}}}");
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out = out.replace(&token, &rendered);
        }
    }
    out
}

#[async_trait]
impl Tool for DynamicTool {
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    async fn invoke(&self, args: Value, ctx: &ToolCtx) -> Result<ToolResult> {
        match &self.kind {
            DynamicKind::Prompt {
                template,
                max_tokens,
            } => {
                let prompt = substitute(template, &args);
                match ctx.llm.complete(&prompt, *max_tokens).await {
                    Ok(reply) => Ok(ToolResult::success(reply)),
                    Err(err) => Ok(ToolResult::error(format!(
                        "tool '{}' LLM call failed: {err}",
                        self.spec.name
                    ))),
                }
            }
            DynamicKind::HttpGet { url } => {
                let url = substitute(url, &args);
                let response = match reqwest::get(&url).await {
                    Ok(r) => r,
                    Err(err) => {
                        return Ok(ToolResult::error(format!("GET {url} failed: {err}")));
                    }
                };
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                if !status.is_success() {
                    return Ok(ToolResult::error(format!("GET {url} returned {status}: {body}")));
                }
                Ok(ToolResult::success(body))
            }
        }
    }
}
