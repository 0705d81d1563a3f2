use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Model id for the heavy (reasoning/extraction/synthesis) profile.
    pub heavy_model: String,
    /// Model id for the fast profile, used only on the hot chat path.
    pub fast_model: String,
    /// Model id used for embeddings.
    pub embed_model: String,
    /// Embedding dimension D. Fixed across a deployment; stores refuse to
    /// load when their persisted dimension differs.
    pub embed_dim: usize,
    /// Base URL of the completion/embedding server. Overridden at runtime by
    /// the `MINERVA_LLM_BASE_URL` environment variable when set.
    pub base_url: String,
    /// Local cache directory for downloaded model files.
    pub model_cache_path: String,
    pub heavy_ctx: u32,
    pub heavy_batch: u32,
    pub heavy_threads: u32,
    pub fast_ctx: u32,
    pub fast_batch: u32,
    pub fast_threads: u32,
    /// Layers offloaded to the GPU for the heavy profile. -1 = all, 0 = CPU.
    pub gpu_layers: i32,
    /// Optional per-GPU split weights. Empty = single device.
    pub gpu_split: Vec<f32>,
    pub heavy_temperature: f32,
    pub heavy_top_p: f32,
    pub heavy_repeat_penalty: f32,
    pub fast_temperature: f32,
    pub fast_top_p: f32,
    pub fast_repeat_penalty: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            heavy_model: "llama3.1:8b".to_string(),
            fast_model: "phi3:mini".to_string(),
            embed_model: "all-minilm".to_string(),
            embed_dim: 384,
            base_url: "http://localhost:11434".to_string(),
            model_cache_path: "data/models".to_string(),
            heavy_ctx: 4096,
            heavy_batch: 512,
            heavy_threads: 8,
            fast_ctx: 2048,
            fast_batch: 512,
            fast_threads: 8,
            gpu_layers: -1,
            gpu_split: Vec::new(),
            heavy_temperature: 0.2,
            heavy_top_p: 0.9,
            heavy_repeat_penalty: 1.1,
            fast_temperature: 0.3,
            fast_top_p: 0.9,
            fast_repeat_penalty: 1.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub episodic_db_path: String,
    pub persona_db_path: String,
    pub knowledge_graph_db_path: String,
    /// Directory holding the personal-notes metadata, index and research queue.
    pub personal_store_dir: String,
    pub knowledge_notes_dir: String,
    pub persona_retention_days: i64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            episodic_db_path: "data/memory.redb".to_string(),
            persona_db_path: "data/persona.redb".to_string(),
            knowledge_graph_db_path: "data/knowledge_graph.redb".to_string(),
            personal_store_dir: "data/personal_store".to_string(),
            knowledge_notes_dir: "data/knowledge_notes".to_string(),
            persona_retention_days: 365,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Root tool directory scanned for manifest artefacts.
    pub tools_dir: String,
    /// Approved community artefacts. Scanned alongside `tools_dir`.
    pub community_dir: String,
    /// Quarantined artefacts, visible only through review operations.
    pub quarantine_dir: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            tools_dir: "tools".to_string(),
            community_dir: "tools/community_tools".to_string(),
            quarantine_dir: "tools/community_tools/quarantine_tools".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub tool_policy_path: String,
    pub prompt_policy_path: String,
    pub epsilon: f32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            tool_policy_path: "data/tool_policy.json".to_string(),
            prompt_policy_path: "data/prompt_policy.json".to_string(),
            epsilon: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Hard cap on reactive loop steps per user turn.
    pub max_steps: usize,
    /// LLM retries when a decision fails to parse as JSON.
    pub decision_retries: usize,
    /// Replanning budget for the planner.
    pub planner_max_retries: u32,
    pub researcher_max_workers: usize,
    pub summary_max_workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            decision_retries: 2,
            planner_max_retries: 3,
            researcher_max_workers: 5,
            summary_max_workers: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    /// ANSI colour output in the CLI.
    pub colored: bool,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self { colored: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub memory: MemoryConfig,
    pub tools: ToolsConfig,
    pub policy: PolicyConfig,
    pub runtime: RuntimeConfig,
    pub ui: UiConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("MINERVA_LLM_BASE_URL") {
            if !value.is_empty() {
                config.llm.base_url = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}
