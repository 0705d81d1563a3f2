//! Test fixtures for the controller: a pattern-matched LLM fake (safe under
//! concurrent completions, unlike a plain reply queue) and a fully wired
//! `Services` over temp-dir stores.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use minerva_config::AppConfig;
use minerva_llm::{LlmClient, LlmError, LlmProfiles};
use minerva_memory::{KnowledgeGraph, PersonaStore, PersonalVectorStore, VectorStore};
use minerva_planner::Planner;
use minerva_policy::{BanditPolicy, RewardShaper};
use minerva_tools::registry::{ToolDirs, ToolRegistry};

use crate::controller::Services;

pub const TEST_DIM: usize = 8;

struct Rule {
    pattern: String,
    replies: VecDeque<String>,
    hits: usize,
}

/// Completion fake keyed on prompt content: the first rule whose pattern the
/// prompt contains answers. Each rule pops its reply queue and repeats the
/// last entry once drained, so loops see a stable answer. Unmatched prompts
/// answer with an empty string, which every graceful-degradation path treats
/// as "nothing".
pub struct PatternLlm {
    rules: Mutex<Vec<Rule>>,
    completions: AtomicUsize,
    fail_all: AtomicBool,
}

impl PatternLlm {
    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    /// How many completions matched the rule with this pattern.
    pub fn hits(&self, pattern: &str) -> usize {
        self.rules
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.pattern == pattern)
            .map(|r| r.hits)
            .unwrap_or(0)
    }

    /// Make every completion fail from now on.
    pub fn fail_completions(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LlmClient for PatternLlm {
    async fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<String, LlmError> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(LlmError::Completion("forced failure".to_string()));
        }
        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            if prompt.contains(&rule.pattern) {
                rule.hits += 1;
                let reply = if rule.replies.len() > 1 {
                    rule.replies.pop_front().unwrap()
                } else {
                    rule.replies.front().cloned().unwrap_or_default()
                };
                return Ok(reply);
            }
        }
        Ok(String::new())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        Ok(hash_embed(text))
    }
}

pub fn hash_embed(text: &str) -> Vec<f32> {
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
    v
}

/// Build a `PatternLlm` + profiles from `(pattern, reply)` pairs. Repeated
/// patterns queue their replies in order.
pub fn pattern_llm(rules: &[(&str, &str)]) -> (Arc<PatternLlm>, Arc<LlmProfiles>) {
    let mut merged: Vec<Rule> = Vec::new();
    for (pattern, reply) in rules {
        if let Some(rule) = merged.iter_mut().find(|r| r.pattern == *pattern) {
            rule.replies.push_back(reply.to_string());
        } else {
            merged.push(Rule {
                pattern: pattern.to_string(),
                replies: VecDeque::from([reply.to_string()]),
                hits: 0,
            });
        }
    }
    let llm = Arc::new(PatternLlm {
        rules: Mutex::new(merged),
        completions: AtomicUsize::new(0),
        fail_all: AtomicBool::new(false),
    });
    let profiles = Arc::new(LlmProfiles::new(llm.clone(), llm.clone(), llm.clone(), TEST_DIM));
    (llm, profiles)
}

/// Wire a full `Services` over `dir` with the given LLM script.
pub async fn services(dir: &tempfile::TempDir, rules: &[(&str, &str)]) -> (Arc<PatternLlm>, Arc<Services>) {
    let (llm, profiles) = pattern_llm(rules);
    let root = dir.path();

    let registry = Arc::new(ToolRegistry::new(ToolDirs {
        tools_dir: root.join("tools"),
        community_dir: root.join("tools/community_tools"),
        quarantine_dir: root.join("tools/community_tools/quarantine_tools"),
    }));
    minerva_tools::builtins::register_all(&registry);

    let mut config = AppConfig::default();
    config.llm.embed_dim = TEST_DIM;
    config.runtime.researcher_max_workers = 2;
    config.runtime.summary_max_workers = 2;

    let services = Services {
        config,
        llm: profiles.clone(),
        memory: Arc::new(VectorStore::open(root.join("memory.redb"), profiles.clone()).unwrap()),
        graph: Arc::new(KnowledgeGraph::open(root.join("kg.redb"), profiles.clone()).unwrap()),
        persona: Arc::new(
            PersonaStore::open(root.join("persona.redb"), profiles.clone(), 365).unwrap(),
        ),
        personal: Arc::new(
            PersonalVectorStore::open(root.join("personal"), profiles.clone())
                .await
                .unwrap(),
        ),
        registry,
        planner: Planner::new(2),
        reward: RewardShaper::default(),
        tool_policy: Mutex::new(BanditPolicy::tool_policy(
            root.join("tool_policy.json"),
            ["none".to_string()],
            0.0,
        )),
        prompt_policy: Mutex::new(BanditPolicy::prompt_policy(
            root.join("prompt_policy.json"),
            ["default_prompt".to_string()],
            0.0,
        )),
    };
    (llm, Arc::new(services))
}
