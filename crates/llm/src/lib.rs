//! LLM access layer: the `LlmClient` trait, the Ollama HTTP adapter, and the
//! heavy/fast profile pair used by the rest of the system.
//!
//! Two completion profiles share one interface. The *heavy* profile drives
//! reasoning, extraction and synthesis and is serialised process-wide (one
//! in-flight completion at a time). The *fast* profile serves the hot chat
//! path and summarisation. Embeddings are thread-safe and freely concurrent.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use minerva_config::LlmConfig;

mod extract;
pub use extract::{extract_json, extract_json_value};

// ── Errors ───────────────────────────────────────────────────────────────────

/// Failure of the completion or embedding backend.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("completion failed: {0}")]
    Completion(String),
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("embedding dimension mismatch: got {got}, expected {expected}")]
    Dimension { got: usize, expected: usize },
}

// ── Client trait ─────────────────────────────────────────────────────────────

/// A completion + embedding backend.
///
/// `complete` is deterministic per call (temperature is a client setting, not
/// a call parameter). `embed` returns a vector of the deployment's fixed
/// dimension D.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, LlmError>;
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;
}

// ── Ollama adapter ───────────────────────────────────────────────────────────

/// Sampling options applied to every completion from one client.
#[derive(Debug, Clone)]
pub struct SamplingOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    pub num_ctx: u32,
}

/// HTTP client for an Ollama-compatible server.
///
/// `POST /api/generate` for completions, `POST /api/embeddings` for
/// embeddings. One instance is constructed per profile (heavy, fast,
/// embedder), each with its own model id and sampling options.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    options: SamplingOptions,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, options: SamplingOptions) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            options,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, LlmError> {
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "num_predict": max_tokens,
                "temperature": self.options.temperature,
                "top_p": self.options.top_p,
                "repeat_penalty": self.options.repeat_penalty,
                "num_ctx": self.options.num_ctx,
            }
        });

        let response = self
            .client
            .post(self.endpoint("api/generate"))
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::Completion(format!("{} unreachable: {e}", self.base_url)))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Completion(format!("invalid response body: {e}")))?;
        if !status.is_success() {
            return Err(LlmError::Completion(format!("server error ({status}): {body}")));
        }

        body.get("response")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| LlmError::Completion(format!("response missing text: {body}")))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let payload = json!({
            "model": self.model,
            "prompt": text,
        });

        let response = self
            .client
            .post(self.endpoint("api/embeddings"))
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::Embedding(format!("{} unreachable: {e}", self.base_url)))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Embedding(format!("invalid response body: {e}")))?;
        if !status.is_success() {
            return Err(LlmError::Embedding(format!("server error ({status}): {body}")));
        }

        let vector = body
            .get("embedding")
            .and_then(|v| v.as_array())
            .ok_or_else(|| LlmError::Embedding(format!("response missing embedding: {body}")))?;

        Ok(vector
            .iter()
            .filter_map(|v| v.as_f64())
            .map(|v| v as f32)
            .collect())
    }
}

// ── Profile pair ─────────────────────────────────────────────────────────────

/// The heavy/fast/embedder triple shared by every subsystem.
///
/// Heavy completions are serialised behind a process-wide mutex; workers that
/// call back into the LLM queue up here rather than contending for the
/// backend. Fast completions and embeddings do not take the lock.
pub struct LlmProfiles {
    heavy: Arc<dyn LlmClient>,
    fast: Arc<dyn LlmClient>,
    embedder: Arc<dyn LlmClient>,
    heavy_gate: Mutex<()>,
    dim: usize,
}

impl LlmProfiles {
    pub fn new(
        heavy: Arc<dyn LlmClient>,
        fast: Arc<dyn LlmClient>,
        embedder: Arc<dyn LlmClient>,
        dim: usize,
    ) -> Self {
        Self {
            heavy,
            fast,
            embedder,
            heavy_gate: Mutex::new(()),
            dim,
        }
    }

    /// Build the standard Ollama-backed profile pair from configuration.
    pub fn from_config(config: &LlmConfig) -> Self {
        let heavy = OllamaClient::new(
            &config.base_url,
            &config.heavy_model,
            SamplingOptions {
                temperature: config.heavy_temperature,
                top_p: config.heavy_top_p,
                repeat_penalty: config.heavy_repeat_penalty,
                num_ctx: config.heavy_ctx,
            },
        );
        let fast = OllamaClient::new(
            &config.base_url,
            &config.fast_model,
            SamplingOptions {
                temperature: config.fast_temperature,
                top_p: config.fast_top_p,
                repeat_penalty: config.fast_repeat_penalty,
                num_ctx: config.fast_ctx,
            },
        );
        let embedder = OllamaClient::new(
            &config.base_url,
            &config.embed_model,
            SamplingOptions {
                temperature: 0.0,
                top_p: 1.0,
                repeat_penalty: 1.0,
                num_ctx: config.fast_ctx,
            },
        );
        Self::new(Arc::new(heavy), Arc::new(fast), Arc::new(embedder), config.embed_dim)
    }

    /// Embedding dimension D, fixed for the deployment.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Heavy completion. Takes the process-wide gate for the full call.
    pub async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, LlmError> {
        let _guard = self.heavy_gate.lock().await;
        debug!(max_tokens, prompt_len = prompt.len(), "heavy completion");
        self.heavy.complete(prompt, max_tokens).await
    }

    /// Fast completion for the hot chat path and summarisation. No gate.
    pub async fn complete_fast(&self, prompt: &str, max_tokens: u32) -> Result<String, LlmError> {
        debug!(max_tokens, prompt_len = prompt.len(), "fast completion");
        self.fast.complete(prompt, max_tokens).await
    }

    /// Embed `text`. Thread-safe; callers may fan out freely.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let vector = self.embedder.embed(text).await?;
        if vector.len() != self.dim {
            return Err(LlmError::Dimension {
                got: vector.len(),
                expected: self.dim,
            });
        }
        Ok(vector)
    }
}
