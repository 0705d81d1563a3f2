//! The tool layer: the `Tool` trait and result contract, the dynamic
//! registry with its quarantine/approval lifecycle, runtime-loaded manifest
//! tools, the tool-creation pipeline, and the built-in tools.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use minerva_llm::LlmProfiles;
use minerva_memory::{KnowledgeGraph, PersonaStore, PersonalVectorStore, VectorStore};

pub mod builtins;
pub mod creator;
pub mod dynamic;
pub mod registry;

pub use creator::create_tool;
pub use dynamic::DynamicTool;
pub use registry::{ToolDirs, ToolRegistry};

// ── Tool contract ────────────────────────────────────────────────────────────

/// Every tool invocation resolves to one of these statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
    ClarificationNeeded,
    Info,
}

/// A `(sub_topic, summary)` pair emitted by research-style tools; the
/// controller stores each chunk as its own memory record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchChunk {
    pub sub_topic: String,
    pub summary: String,
}

/// The uniform wire format between the controller and every tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Set when status is `clarification_needed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    /// `"reload_tools"` asks the controller to refresh the registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<ResearchChunk>,
}

impl ToolResult {
    pub fn success(result: impl Into<Value>) -> Self {
        Self {
            status: ToolStatus::Success,
            result: Some(result.into()),
            message: None,
            question: None,
            special_action: None,
            tool_filename: None,
            chunks: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            result: None,
            message: Some(message.into()),
            question: None,
            special_action: None,
            tool_filename: None,
            chunks: Vec::new(),
        }
    }

    pub fn clarification(question: impl Into<String>) -> Self {
        let question = question.into();
        Self {
            status: ToolStatus::ClarificationNeeded,
            result: Some(Value::String(format!(
                "Waiting for clarification from the user: {question}"
            ))),
            message: None,
            question: Some(question),
            special_action: None,
            tool_filename: None,
            chunks: Vec::new(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Info,
            result: None,
            message: Some(message.into()),
            question: None,
            special_action: None,
            tool_filename: None,
            chunks: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }

    /// The textual observation the controller feeds into the next decision.
    pub fn observation_text(&self) -> String {
        if let Some(result) = &self.result {
            return match result {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
        }
        if let Some(message) = &self.message {
            return message.clone();
        }
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Static metadata about a tool, shown to the LLM when it picks an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's args.
    pub input_schema: Value,
    /// Whether a successful response may be served from the response cache.
    pub cacheable: bool,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            cacheable: true,
        }
    }

    pub fn non_cacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }
}

/// Trait implemented by every tool, built-in or manifest-loaded.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn invoke(&self, args: Value, ctx: &ToolCtx) -> Result<ToolResult>;
}

// ── Capability handle ────────────────────────────────────────────────────────

/// The narrowed handle passed to every tool invocation. Tools may re-enter
/// the registry, memory and LLM through it; they never see the controller
/// itself, and the controller-owned turn state stays out of reach.
pub struct ToolCtx {
    pub llm: Arc<LlmProfiles>,
    pub memory: Arc<VectorStore>,
    pub graph: Arc<KnowledgeGraph>,
    pub persona: Arc<PersonaStore>,
    pub personal: Arc<PersonalVectorStore>,
    pub registry: Arc<ToolRegistry>,
    /// Planner scratchpad, shared across the steps of one goal.
    pub working_memory: Mutex<HashMap<String, String>>,
}

impl ToolCtx {
    pub fn working_get(&self, key: &str) -> Option<String> {
        self.working_memory
            .lock()
            .expect("working memory lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn working_set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.working_memory
            .lock()
            .expect("working memory lock poisoned")
            .insert(key.into(), value.into());
    }
}

#[cfg(test)]
pub(crate) mod testing;
