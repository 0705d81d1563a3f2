//! Shared fixtures for the tool-layer tests: a scripted LLM backend and a
//! fully wired `ToolCtx` over temp-dir stores.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use minerva_llm::{LlmClient, LlmError, LlmProfiles};
use minerva_memory::{KnowledgeGraph, PersonaStore, PersonalVectorStore, VectorStore};

use crate::registry::{ToolDirs, ToolRegistry};
use crate::ToolCtx;

pub const TEST_DIM: usize = 8;

pub struct ScriptedLlm {
    pub replies: Mutex<VecDeque<String>>,
}

impl ScriptedLlm {
    pub fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
        })
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _prompt: &str, _max_tokens: u32) -> Result<String, LlmError> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::Completion("script exhausted".to_string()))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let mut v = vec![0.0f32; TEST_DIM];
        for b in text.bytes() {
            v[(b as usize) % TEST_DIM] += 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        Ok(v)
    }
}

pub fn profiles(replies: &[&str]) -> Arc<LlmProfiles> {
    let llm = ScriptedLlm::new(replies);
    Arc::new(LlmProfiles::new(llm.clone(), llm.clone(), llm, TEST_DIM))
}

/// Build a complete `ToolCtx` rooted in `dir`, with `replies` scripted into
/// the LLM.
pub async fn ctx(dir: &tempfile::TempDir, replies: &[&str]) -> Arc<ToolCtx> {
    let llm = profiles(replies);
    let root = dir.path();

    let dirs = ToolDirs {
        tools_dir: root.join("tools"),
        community_dir: root.join("tools/community_tools"),
        quarantine_dir: root.join("tools/community_tools/quarantine_tools"),
    };
    let registry = Arc::new(ToolRegistry::new(dirs));

    let memory = Arc::new(VectorStore::open(root.join("memory.redb"), llm.clone()).unwrap());
    let graph = Arc::new(KnowledgeGraph::open(root.join("kg.redb"), llm.clone()).unwrap());
    let persona =
        Arc::new(PersonaStore::open(root.join("persona.redb"), llm.clone(), 365).unwrap());
    let personal = Arc::new(
        PersonalVectorStore::open(root.join("personal"), llm.clone())
            .await
            .unwrap(),
    );

    Arc::new(ToolCtx {
        llm,
        memory,
        graph,
        persona,
        personal,
        registry,
        working_memory: Mutex::new(Default::default()),
    })
}
