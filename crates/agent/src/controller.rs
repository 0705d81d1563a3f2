//! The reasoning controller: one `run()` call per user turn.
//!
//! A turn flows cache → fast chat path → parallel context gathering →
//! strategy selection → planner run or reactive step loop → reflection and
//! policy updates. The reactive loop is bounded, detects action loops, polls
//! for interrupts between steps, and dual-writes every observation into
//! episodic memory and the knowledge graph.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use minerva_config::AppConfig;
use minerva_llm::{LlmProfiles, extract_json_value};
use minerva_memory::{
    KnowledgeGraph, PersonaStore, PersonalVectorStore, VectorStore, cosine_similarity,
    extract_triplets,
};
use minerva_planner::Planner;
use minerva_policy::{BanditPolicy, Feedback, RewardShaper};
use minerva_tools::registry::{ToolDirs, ToolRegistry};
use minerva_tools::{ToolCtx, ToolResult, ToolStatus};

use crate::decision::{Decision, parse_decision};
use crate::error::AgentError;
use crate::intent::{IntentDetector, Strategy};
use crate::truncate::smart_truncate;

// ── Fixed user-visible messages ──────────────────────────────────────────────

pub const LOOP_MESSAGE: &str =
    "I noticed I was going in circles and could not make progress. Please try rephrasing the task.";
pub const UNDECIDED_MESSAGE: &str = "I could not decide; please rephrase.";
pub const CANCELLED_MESSAGE: &str = "The task was cancelled. Awaiting a new command.";
const FALLBACK_MESSAGE: &str = "I could not complete the task.";

// ── Tunables ─────────────────────────────────────────────────────────────────

const SHORT_TERM_CAPACITY: usize = 20;
const ACTION_HISTORY_CAPACITY: usize = 5;
const RESPONSE_CACHE_CAPACITY: usize = 128;
const OBSERVATION_BUDGET: usize = 3500;
const KNOWLEDGE_BUDGET: usize = 1500;
/// Observations below this length are not mined for knowledge triplets.
const REFLECT_MIN_LEN: usize = 250;
/// Episodic records older than this count as stale during reconciliation.
const STALE_AFTER_DAYS: i64 = 7;

/// Tools whose observations are mined for knowledge triplets.
const REFLECT_TOOLS: &[&str] = &[
    "internet_search",
    "critical_web_researcher",
    "comprehensive_financial_analyst",
];

/// Tools whose successful answers are additionally stored as advice notes.
const FINANCIAL_TOOLS: &[&str] = &[
    "find_assets",
    "comprehensive_financial_analyst",
    "price_forecaster",
    "portfolio_manager",
];

/// Per-tool misuse warnings rendered next to the catalogue entry.
const TOOL_ANTI_PATTERNS: &[(&str, &str)] = &[
    (
        "manifest_auditor",
        "Only for auditing an existing tool manifest file. NOT for analysing websites, URLs or free text.",
    ),
    (
        "tool_creator",
        "NOT for tasks an existing tool can already do. Only when a genuinely new capability is required.",
    ),
    (
        "working_memory",
        "NOT for storing permanent data. Only for passing intermediate results between plan steps.",
    ),
    (
        "internet_search",
        "Avoid this general tool when a more specific research tool fits the task better.",
    ),
];

/// Observation substrings that mark a freshly created artefact awaiting
/// approval. Paired with [`tool_file_pattern`], they trigger the rule-based
/// loop break that dispatches `review_and_approve_tool` without consulting
/// the LLM.
const APPROVAL_PHRASES: &[&str] = &[
    "created and quarantined",
    "review_and_approve_tool to approve",
    "approve it before use",
];

fn tool_file_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"'([a-z0-9_]+\.tool\.toml)'").unwrap())
}

// ── Conversation types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Agent,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Agent => "agent",
        }
    }
}

/// One immutable conversation entry.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Utterance {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

// ── Interrupt seam ───────────────────────────────────────────────────────────

/// Between-step cancellation probe. The CLI installs a TTY key poll; headless
/// deployments keep the no-op, and the loop then runs to its step budget.
pub trait InterruptSource: Send {
    fn interrupted(&mut self) -> bool;
}

pub struct NoInterrupt;

impl InterruptSource for NoInterrupt {
    fn interrupted(&mut self) -> bool {
        false
    }
}

// ── Services ─────────────────────────────────────────────────────────────────

/// Process-wide handle struct: every subsystem the controller coordinates.
/// Shared by reference; no hidden globals.
pub struct Services {
    pub config: AppConfig,
    pub llm: Arc<LlmProfiles>,
    pub memory: Arc<VectorStore>,
    pub graph: Arc<KnowledgeGraph>,
    pub persona: Arc<PersonaStore>,
    pub personal: Arc<PersonalVectorStore>,
    pub registry: Arc<ToolRegistry>,
    pub planner: Planner,
    pub reward: RewardShaper,
    pub tool_policy: Mutex<BanditPolicy>,
    pub prompt_policy: Mutex<BanditPolicy>,
}

impl Services {
    /// Build the standard deployment from configuration: Ollama-backed LLM
    /// profiles, redb stores, the tool registry with built-ins discovered,
    /// and the persisted policies.
    pub async fn initialize(config: AppConfig) -> Result<Self> {
        let llm = Arc::new(LlmProfiles::from_config(&config.llm));

        let registry = Arc::new(ToolRegistry::new(ToolDirs {
            tools_dir: config.tools.tools_dir.clone().into(),
            community_dir: config.tools.community_dir.clone().into(),
            quarantine_dir: config.tools.quarantine_dir.clone().into(),
        }));
        minerva_tools::builtins::register_all(&registry);
        registry.reload()?;

        let memory = Arc::new(VectorStore::open(&config.memory.episodic_db_path, llm.clone())?);
        let graph = Arc::new(KnowledgeGraph::open(
            &config.memory.knowledge_graph_db_path,
            llm.clone(),
        )?);
        let persona = Arc::new(PersonaStore::open(
            &config.memory.persona_db_path,
            llm.clone(),
            config.memory.persona_retention_days,
        )?);
        let personal = Arc::new(
            PersonalVectorStore::open(&config.memory.personal_store_dir, llm.clone()).await?,
        );

        let mut tool_arms = registry.names();
        tool_arms.push("none".to_string());
        let tool_policy = BanditPolicy::tool_policy(
            &config.policy.tool_policy_path,
            tool_arms,
            config.policy.epsilon,
        );
        let prompt_policy = BanditPolicy::prompt_policy(
            &config.policy.prompt_policy_path,
            ["default_prompt".to_string()],
            config.policy.epsilon,
        );

        Ok(Self {
            planner: Planner::new(config.runtime.planner_max_retries),
            reward: RewardShaper::default(),
            tool_policy: Mutex::new(tool_policy),
            prompt_policy: Mutex::new(prompt_policy),
            config,
            llm,
            memory,
            graph,
            persona,
            personal,
            registry,
        })
    }

}

// ── Per-turn loop outcome ────────────────────────────────────────────────────

struct TurnState {
    final_response: String,
    tool_name: String,
    tool_input: Value,
    tool_result: Option<ToolResult>,
    retries: u32,
}

// ── Agent ────────────────────────────────────────────────────────────────────

pub struct Agent {
    services: Arc<Services>,
    ctx: Arc<ToolCtx>,
    intent: IntentDetector,
    interrupt: Box<dyn InterruptSource>,
    short_term: VecDeque<Utterance>,
    response_cache: LruCache<String, String>,
    action_history: VecDeque<String>,
    stuck_counter: u32,
}

impl Agent {
    pub fn new(services: Arc<Services>) -> Self {
        let ctx = Arc::new(ToolCtx {
            llm: services.llm.clone(),
            memory: services.memory.clone(),
            graph: services.graph.clone(),
            persona: services.persona.clone(),
            personal: services.personal.clone(),
            registry: services.registry.clone(),
            working_memory: Mutex::new(Default::default()),
        });
        let intent = IntentDetector::builtin(services.llm.clone());
        Self {
            services,
            ctx,
            intent,
            interrupt: Box::new(NoInterrupt),
            short_term: VecDeque::with_capacity(SHORT_TERM_CAPACITY),
            response_cache: LruCache::new(NonZeroUsize::new(RESPONSE_CACHE_CAPACITY).unwrap()),
            action_history: VecDeque::with_capacity(ACTION_HISTORY_CAPACITY),
            stuck_counter: 0,
        }
    }

    pub fn with_intent_detector(mut self, intent: IntentDetector) -> Self {
        self.intent = intent;
        self
    }

    pub fn with_interrupt(mut self, interrupt: Box<dyn InterruptSource>) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn tool_ctx(&self) -> &Arc<ToolCtx> {
        &self.ctx
    }

    pub fn short_term_memory(&self) -> &VecDeque<Utterance> {
        &self.short_term
    }

    /// Seed the response cache (used by the CLI to restore session state).
    pub fn cache_insert(&mut self, prompt: impl Into<String>, response: impl Into<String>) {
        self.response_cache.put(prompt.into(), response.into());
    }

    fn remember(&mut self, role: Role, content: &str) {
        if self.short_term.len() == SHORT_TERM_CAPACITY {
            self.short_term.pop_front();
        }
        self.short_term.push_back(Utterance::new(role, content));
    }

    // ── The turn ─────────────────────────────────────────────────────────────

    pub async fn run(&mut self, user_prompt: &str) -> Result<String> {
        // Exact cache hit: no LLM involvement at all.
        if let Some(cached) = self.response_cache.get(user_prompt).cloned() {
            info!("response served from cache");
            self.remember(Role::User, user_prompt);
            self.remember(Role::Agent, &cached);
            return Ok(cached);
        }

        let intent_info = self.intent.detect(user_prompt).await;
        info!(
            intent = %intent_info.intent,
            strategy = ?intent_info.strategy,
            confidence = intent_info.confidence,
            "intent classified"
        );

        // Fast chat path: bare conversational turns go straight to the fast
        // profile.
        if intent_info.intent == "chat" && intent_info.source == crate::intent::IntentSource::Regex
        {
            let chat_prompt =
                format!("You are a helpful assistant.\nUser: {user_prompt}\nAssistant:");
            match self.services.llm.complete_fast(&chat_prompt, 512).await {
                Ok(reply) => {
                    self.remember(Role::User, user_prompt);
                    self.remember(Role::Agent, &reply);
                    self.response_cache.put(user_prompt.to_string(), reply.clone());
                    return Ok(reply);
                }
                Err(err) => {
                    let err = AgentError::LlmFailure(err.to_string());
                    warn!(error = %err, "fast chat path failed, falling through");
                }
            }
        }

        let start = Instant::now();
        self.remember(Role::User, user_prompt);

        if let Err(err) = self.services.persona.extract_and_add_from_message(user_prompt).await {
            warn!(%err, "persona extraction failed");
        }
        let context = self.gather_context(user_prompt).await;

        let state = match intent_info.strategy {
            Strategy::Planner => self.run_planner(user_prompt).await,
            Strategy::Reactive => {
                match self.run_reactive_loop(user_prompt, &context).await {
                    Some(state) => state,
                    // Loop detection is terminal: record the response and stop
                    // without touching the policies.
                    None => {
                        self.remember(Role::Agent, LOOP_MESSAGE);
                        return Ok(LOOP_MESSAGE.to_string());
                    }
                }
            }
        };

        let final_response = self
            .finish_turn(user_prompt, state, start.elapsed())
            .await;
        Ok(final_response)
    }

    // ── Context gathering ────────────────────────────────────────────────────

    async fn gather_context(&self, user_prompt: &str) -> GatheredContext {
        let (persona_summary, personal_hits, graph_text, episodic_hits) = tokio::join!(
            self.services.persona.summarize_persona(600),
            self.services.personal.search(user_prompt, 3, None),
            self.services.graph.query_as_text(user_prompt),
            self.services.memory.search(user_prompt, 3),
        );

        let persona_summary = persona_summary.unwrap_or_else(|err| {
            warn!(%err, "persona summary failed");
            String::new()
        });
        let personal_knowledge = personal_hits
            .map(|hits| {
                hits.iter()
                    .map(|(note, _)| format!("- {}", note.text))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_else(|err| {
                warn!(%err, "personal note search failed");
                String::new()
            });
        let past_knowledge = episodic_hits
            .map(|hits| {
                hits.iter()
                    .map(|hit| format!("- {}", hit.content))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_else(|err| {
                warn!(%err, "episodic search failed");
                String::new()
            });

        GatheredContext {
            persona_summary,
            personal_knowledge,
            graph_knowledge: graph_text,
            past_knowledge,
        }
    }

    // ── Planner strategy ─────────────────────────────────────────────────────

    async fn run_planner(&mut self, user_prompt: &str) -> TurnState {
        info!("dispatching to the planner");
        let outcome = self.services.planner.plan_and_execute(&self.ctx, user_prompt).await;

        let final_response = match outcome.result.status {
            ToolStatus::ClarificationNeeded => outcome
                .result
                .question
                .clone()
                .unwrap_or_else(|| "I need more information from you.".to_string()),
            ToolStatus::Success | ToolStatus::Info => {
                let plan_output = outcome.result.observation_text();
                let synthesis_prompt = format!(
                    "You carried out a series of actions to answer a user's request. Use their \
                     outcome to write a comprehensive and direct answer.\n\n\
                     Original request: \"{user_prompt}\"\n\n\
                     Outcome of your actions:\n---\n{plan_output}\n---\n\n\
                     Answer the request directly and conversationally. Emphasise the final \
                     result, not the intermediate steps."
                );
                match self.services.llm.complete(&synthesis_prompt, 1024).await {
                    Ok(reply) => reply,
                    Err(err) => {
                        warn!(%err, "final synthesis failed, returning raw plan output");
                        plan_output
                    }
                }
            }
            ToolStatus::Error => format!(
                "The planner could not complete the task: {}",
                outcome
                    .result
                    .message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string())
            ),
        };

        TurnState {
            final_response,
            tool_name: "planner".to_string(),
            tool_input: Value::String(user_prompt.to_string()),
            tool_result: Some(outcome.result),
            retries: outcome.retries,
        }
    }

    // ── Reactive strategy ────────────────────────────────────────────────────

    /// The think→act→observe loop. Returns `None` when loop detection
    /// terminated the turn.
    async fn run_reactive_loop(
        &mut self,
        user_prompt: &str,
        context: &GatheredContext,
    ) -> Option<TurnState> {
        let max_steps = self.services.config.runtime.max_steps;
        let mut last_observation = String::new();
        let mut state = TurnState {
            final_response: FALLBACK_MESSAGE.to_string(),
            tool_name: "none".to_string(),
            tool_input: Value::Null,
            tool_result: None,
            retries: 0,
        };

        for step in 0..max_steps {
            info!(step = step + 1, max_steps, "reactive step");

            if self.interrupt.interrupted() {
                info!(error = %AgentError::Cancelled, "turn cancelled");
                state.final_response = CANCELLED_MESSAGE.to_string();
                state.tool_result = Some(ToolResult::error(AgentError::Cancelled.to_string()));
                return Some(state);
            }

            let decision = match self.decide(user_prompt, context, &last_observation).await {
                Some(decision) => decision,
                None => {
                    let err = AgentError::SchemaViolation(
                        "no parseable JSON decision after retries".to_string(),
                    );
                    warn!(error = %err, "aborting the step loop");
                    state.final_response = UNDECIDED_MESSAGE.to_string();
                    state.tool_result = Some(ToolResult::error(err.to_string()));
                    return Some(state);
                }
            };

            debug!(thought = %decision.thought, action = %decision.action, "decision");
            state.tool_name = decision.action.clone();
            state.tool_input = decision.input.clone();

            // Loop detection over (action, input-prefix) summaries.
            if !decision.is_terminal() {
                let summary = decision_summary(&decision);
                if self.action_history.contains(&summary) {
                    self.stuck_counter += 1;
                    warn!(summary = %summary, counter = self.stuck_counter, "repeated action");
                } else {
                    self.stuck_counter = 0;
                }
                if self.stuck_counter >= 2 {
                    warn!(error = %AgentError::LoopDetected, "terminating the turn");
                    return None;
                }
                if self.action_history.len() == ACTION_HISTORY_CAPACITY {
                    self.action_history.pop_front();
                }
                self.action_history.push_back(summary);
            }

            if decision.is_terminal() {
                state.final_response = decision
                    .response
                    .unwrap_or_else(|| "I finished the task but have no answer to report.".to_string());
                state.tool_result = Some(ToolResult::success(state.final_response.clone()));
                return Some(state);
            }

            let (observation, tool_result) =
                self.dispatch(&decision.action, decision.input.clone()).await;
            last_observation = observation;
            state.tool_result = Some(tool_result);

            // Errors re-enter the loop as observations so the model can
            // self-correct.
            if let Some(result) = &state.tool_result {
                if result.status == ToolStatus::Error {
                    continue;
                }
            }

            last_observation = self.observe(&decision.action, last_observation).await;
        }

        info!(max_steps, error = %AgentError::StepBudgetExhausted, "turn over budget");
        state.final_response = if last_observation.is_empty() {
            FALLBACK_MESSAGE.to_string()
        } else {
            last_observation
        };
        Some(state)
    }

    /// One decision: the rule-based approval break first, then the LLM with
    /// bounded parse retries.
    async fn decide(
        &mut self,
        user_prompt: &str,
        context: &GatheredContext,
        last_observation: &str,
    ) -> Option<Decision> {
        if !last_observation.is_empty()
            && APPROVAL_PHRASES.iter().any(|p| last_observation.contains(p))
        {
            if let Some(captures) = tool_file_pattern().captures(last_observation) {
                let filename = captures[1].to_string();
                info!(filename, "rule-based loop break: approving the new tool");
                return Some(Decision {
                    thought: "A tool was created in the previous step and now needs approval. \
                              Dispatching review_and_approve_tool directly to break the loop."
                        .to_string(),
                    action: "review_and_approve_tool".to_string(),
                    input: serde_json::json!({"action": "approve", "tool_filename": filename}),
                    response: None,
                });
            }
        }

        let retries = self.services.config.runtime.decision_retries;
        for attempt in 0..=retries {
            let prompt = self
                .build_decision_prompt(user_prompt, context, last_observation)
                .await;
            match self.services.llm.complete(&prompt, 1024).await {
                Ok(raw) => {
                    if let Some(decision) = parse_decision(&raw) {
                        return Some(decision);
                    }
                    warn!(attempt, "decision did not parse as JSON");
                }
                Err(err) => warn!(attempt, %err, "decision completion failed"),
            }
        }
        None
    }

    async fn build_decision_prompt(
        &self,
        user_prompt: &str,
        context: &GatheredContext,
        last_observation: &str,
    ) -> String {
        let llm = &self.services.llm;
        let personal = smart_truncate(llm, &context.personal_knowledge, KNOWLEDGE_BUDGET, user_prompt).await;
        let graph = smart_truncate(llm, &context.graph_knowledge, KNOWLEDGE_BUDGET, user_prompt).await;
        let past = smart_truncate(llm, &context.past_knowledge, KNOWLEDGE_BUDGET, user_prompt).await;

        let observation_block = if last_observation.is_empty() {
            String::new()
        } else {
            let truncated =
                smart_truncate(llm, last_observation, OBSERVATION_BUDGET, user_prompt).await;
            format!("**OBSERVATION FROM THE PREVIOUS STEP:**\n{truncated}\n\n")
        };

        let conversation = if self.short_term.is_empty() {
            "The conversation history is empty.".to_string()
        } else {
            self.short_term
                .iter()
                .rev()
                .map(|u| format!("- {}: {}", u.role.label(), u.content))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let tools_block = self
            .services
            .registry
            .specs()
            .iter()
            .map(|spec| {
                match TOOL_ANTI_PATTERNS.iter().find(|(name, _)| *name == spec.name) {
                    Some((_, warning)) => format!(
                        "- `{}`: {}\n  **Not suitable:** {}",
                        spec.name, spec.description, warning
                    ),
                    None => format!("- `{}`: {}", spec.name, spec.description),
                }
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"You are an intelligent autonomous agent that selects the right tools to complete a task and critically analyses their results. You can split a task into steps and run tools one after another. ALWAYS answer in JSON.

**KNOWLEDGE SOURCES (IN PRIORITY ORDER)**

**1. THE USER'S PERSONAL NOTES (HIGHEST PRIORITY):**
{personal}

**2. STRUCTURED KNOWLEDGE GRAPH (HIGH PRIORITY):**
{graph}

**3. PAST KNOWLEDGE AND GENERAL NOTES (MEDIUM PRIORITY):**
{past}

**RECENT CONVERSATION (NEWEST FIRST):**
{conversation}

**USER PROFILE SUMMARY:**
{persona}

{observation_block}**AVAILABLE TOOLS:**
{tools_block}

**TASK AND RULES:**

**0. RULE: DETECT A DIRECT TOOL CALL (HIGHEST PRIORITY).** If the user's request names one of the available tools directly, dispatch that tool with the given input before considering anything else.

**1. RULE: APPROVE A JUST-CREATED TOOL.** If the previous observation says a new tool was created and needs approval, choose `review_and_approve_tool` with the tool's filename as input. Never run any other tool (especially not `tool_creator`) in that situation.

**2. RULE: PICK THE BEST TOOL FOR THE TASK.** Analyse the main task, study the available tools, and choose the one that best advances the task, filling `input` with its arguments.

**2.5 RULE: LEARN FROM TOOL ERRORS.** If the previous observation contains a tool error, do not repeat it. Avoid the failing tool (and tools likely to fail the same way) and reconsider; if no remaining tool fits, fall through to rule 3.

**3. RULE: CREATE A NEW TOOL ONLY WHEN NOTHING FITS.** Use `tool_creator` only when no available tool can perform the task and the task needs a new, reusable capability. Observing that a tool you tried does not exist is a strong signal for this rule.

**4. RULE: JUST CHAT WHEN NO TOOL IS NEEDED.** For greetings and simple questions use `action: "none"` and put the answer in `response`.

**5. RULE: THINK CRITICALLY.** Do not blindly accept tool results; note contradictions or inconsistencies in `thought`.

**6. RULE: VERIFY IMPORTANT FINDINGS.** Confirm important findings with a second search before concluding, then finish with `action: "none"` and the final answer in `response`.

**7. RULE: FINISH THE TASK.** If the previous observation shows the task is complete and nothing remains to do, use `action: "none"` and give the user a final answer.

Reply with a single JSON object: `thought` (short reasoning), `action` (a tool name from the list, or "none"), `input` (the tool's input), and `response` (only with action "none": the final answer).

**MAIN TASK:** "{user_prompt}"

Answer (JSON only):"#,
            persona = context.persona_summary,
        )
    }

    // ── Dispatch and observation ─────────────────────────────────────────────

    /// Run one tool, converting every failure mode into a synthetic
    /// observation.
    async fn dispatch(&mut self, action: &str, mut input: Value) -> (String, ToolResult) {
        let Some(tool) = self.services.registry.get(action) else {
            let err = AgentError::UnknownTool(action.to_string());
            warn!(error = %err, "unknown action");
            let observation = format!(
                "ERROR: in the previous step I tried to use a tool named '{action}', but no \
                 such tool exists. I must either pick a different existing tool or create one \
                 with 'tool_creator'."
            );
            return (observation, ToolResult::error(err.to_string()));
        };

        if action == "tool_creator" {
            self.enrich_tool_creator_input(&mut input).await;
        }

        info!(action, "dispatching tool");
        let result = match tool.invoke(input, &self.ctx).await {
            Ok(result) => result,
            // An unhandled error out of a tool is captured and normalised to
            // a standard error result.
            Err(err) => {
                let err = AgentError::ToolError {
                    tool: action.to_string(),
                    message: err.to_string(),
                };
                warn!(error = %err, "tool raised an error");
                ToolResult::error(err.to_string())
            }
        };

        let observation = match result.status {
            ToolStatus::Error => format!(
                "ERROR: running the tool '{action}' in the previous step failed with: '{}'. \
                 Either the tool was the wrong choice or its arguments were wrong; I should \
                 try a different tool or different arguments.",
                result.message.clone().unwrap_or_else(|| "unknown tool error".to_string())
            ),
            _ => result.observation_text(),
        };

        if result.special_action.as_deref() == Some("reload_tools") {
            info!("tool requested a registry reload");
            if let Err(err) = self.services.registry.reload() {
                warn!(%err, "registry reload failed");
            }
        }

        // Research-style tools return chunked findings; store each chunk.
        if result.is_success() && !result.chunks.is_empty() {
            for chunk in &result.chunks {
                let note = format!("Research result ({}): {}", chunk.sub_topic, chunk.summary);
                if let Err(err) = self.services.memory.add(&note).await {
                    warn!(%err, "failed to store research chunk");
                    continue;
                }
                self.dual_write_triplets(&note).await;
            }
        }

        (observation, result)
    }

    /// Scan memory for knowledge related to the tool-creation task and fold
    /// it into the task description.
    async fn enrich_tool_creator_input(&self, input: &mut Value) {
        let Some(task_description) = input
            .get("task_description")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
        else {
            return;
        };

        let personal = self
            .services
            .personal
            .search(&task_description, 3, None)
            .await
            .map(|hits| {
                hits.iter()
                    .map(|(note, _)| note.text.clone())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        let general = self
            .services
            .memory
            .search(&task_description, 2)
            .await
            .map(|hits| {
                hits.iter()
                    .map(|hit| hit.content.clone())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        let mut combined = String::new();
        if !personal.is_empty() {
            combined.push_str(&format!(
                "THE USER'S PERSONAL NOTES ON THIS SUBJECT (PRIORITISE):\n{personal}\n\n"
            ));
        }
        if !general.is_empty() {
            combined.push_str(&format!("GENERAL KNOWLEDGE (MAY HELP):\n{general}"));
        }
        if combined.is_empty() {
            return;
        }

        info!("enriching tool_creator task with remembered knowledge");
        if let Some(obj) = input.as_object_mut() {
            obj.insert(
                "task_description".to_string(),
                Value::String(format!(
                    "TASK: {task_description}\n\nKNOWLEDGE WE ALREADY HAVE THAT MAY HELP:\n{combined}"
                )),
            );
        }
    }

    /// Post-dispatch processing of a successful observation: knowledge
    /// synthesis into the graph, then contradiction reconciliation. Returns
    /// the (possibly corrected) observation.
    async fn observe(&mut self, action: &str, observation: String) -> String {
        self.reflect_and_synthesize(action, &observation).await;

        if let Some((old, merged)) = self.check_for_contradictions(&observation).await {
            info!("reconciling contradictory memory");
            let args = serde_json::json!({
                "old_knowledge_text": old,
                "updated_knowledge_text": merged,
            });
            match self.services.registry.get("update_knowledge") {
                Some(tool) => match tool.invoke(args, &self.ctx).await {
                    Ok(result) if result.is_success() => {
                        return format!("Knowledge corrected. New knowledge: {merged}");
                    }
                    Ok(result) => {
                        warn!(message = ?result.message, "knowledge update was rejected")
                    }
                    Err(err) => warn!(%err, "knowledge update failed"),
                },
                None => warn!("update_knowledge tool is not registered"),
            }
        }
        observation
    }

    /// Proactively mine reusable facts out of research-grade observations.
    async fn reflect_and_synthesize(&self, action: &str, observation: &str) {
        if observation.len() < REFLECT_MIN_LEN || !REFLECT_TOOLS.contains(&action) {
            return;
        }
        match extract_triplets(&self.services.llm, observation).await {
            Ok(triplets) if !triplets.is_empty() => {
                match self.services.graph.add_triplets(&triplets) {
                    Ok(added) => info!(added, "facts learned from observation"),
                    Err(err) => warn!(%err, "knowledge graph write failed"),
                }
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "triplet extraction failed"),
        }
    }

    /// Compare a fresh observation against the most similar stored record.
    /// Returns `(old_text, merged_text)` when the verdict says the stored
    /// record should be replaced: a confident contradiction, or a stale
    /// record — in both cases only when the model supplies merged text.
    async fn check_for_contradictions(&self, observation: &str) -> Option<(String, String)> {
        let hits = match self.services.memory.search(observation, 1).await {
            Ok(hits) => hits,
            Err(err) => {
                warn!(%err, "contradiction search failed");
                return None;
            }
        };
        let top = hits.first()?;
        let is_stale = Utc::now() - top.created_at > Duration::days(STALE_AFTER_DAYS);

        let staleness = if is_stale { "OLD" } else { "RECENT" };
        let prompt = format!(
            r#"You are a fact-checking expert. Identify contradictions between a new piece of information and existing knowledge.

**Existing knowledge:**
---
{existing}
---

**New information:**
---
{observation}
---

The existing knowledge is {staleness}. If it is OLD, be more critical and favour the new information when it seems more current.

Answer in strict JSON with the keys:
- "contradiction_found": boolean
- "confidence_score": float between 0.0 and 1.0
- "explanation": short string
- "more_accurate_info": "new", "existing" or "mixed"
- "updated_knowledge": when the stored record should be replaced, a corrected and comprehensive text merging the valuable information from both sources; otherwise null

Reply with ONLY the JSON object."#,
            existing = top.content,
        );

        let reply = match self.services.llm.complete(&prompt, 1024).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(%err, "contradiction check failed");
                return None;
            }
        };
        let verdict = extract_json_value(&reply)?;

        let found = verdict
            .get("contradiction_found")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let confidence = verdict
            .get("confidence_score")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);

        if (found && confidence > 0.75) || is_stale {
            let merged = verdict.get("updated_knowledge")?.as_str()?;
            if merged.trim().is_empty() {
                return None;
            }
            return Some((top.content.clone(), merged.to_string()));
        }
        None
    }

    // ── Turn close-out ───────────────────────────────────────────────────────

    async fn finish_turn(
        &mut self,
        user_prompt: &str,
        state: TurnState,
        elapsed: std::time::Duration,
    ) -> String {
        let succeeded = state
            .tool_result
            .as_ref()
            .map(|r| r.status != ToolStatus::Error)
            .unwrap_or(false);
        let error_message = state.tool_result.as_ref().and_then(|r| {
            (r.status == ToolStatus::Error).then(|| r.message.clone().unwrap_or_default())
        });

        let reward = self.services.reward.total_reward(
            if succeeded { Feedback::ThumbsUp } else { Feedback::ThumbsDown },
            elapsed,
            error_message.as_deref(),
            user_prompt,
            state.retries,
            self.services.config.runtime.planner_max_retries,
        );
        debug!(
            reward,
            tool = %state.tool_name,
            input = %summarize_input(&state.tool_input),
            "updating policies"
        );

        let context_embedding = self.services.llm.embed(user_prompt).await.ok();
        {
            let mut tool_policy = self
                .services
                .tool_policy
                .lock()
                .expect("tool policy lock poisoned");
            if let Err(err) =
                tool_policy.update(&state.tool_name, reward, context_embedding.as_deref())
            {
                warn!(%err, "tool policy update failed");
            }
        }
        {
            let mut prompt_policy = self
                .services
                .prompt_policy
                .lock()
                .expect("prompt policy lock poisoned");
            if let Err(err) = prompt_policy.update("default_prompt", reward, None) {
                warn!(%err, "prompt policy update failed");
            }
        }

        // Dual-write the turn itself.
        let turn_record = format!("User: {user_prompt}\nAgent: {}", state.final_response);
        if let Err(err) = self.services.memory.add(&turn_record).await {
            let err = AgentError::Storage(err.to_string());
            warn!(error = %err, "failed to store the turn record");
        }
        self.dual_write_triplets(&turn_record).await;

        self.reflect_and_note(user_prompt).await;

        if succeeded && FINANCIAL_TOOLS.contains(&state.tool_name.as_str()) {
            let note = format!(
                "Financial advice note ({}): for the request '{user_prompt}' this analysis \
                 was given:\n{}",
                state.tool_name, state.final_response
            );
            if let Err(err) = self.services.memory.add(&note).await {
                warn!(%err, "failed to store the advice note");
            } else {
                self.dual_write_triplets(&note).await;
            }
        }

        let non_cacheable = self.services.registry.non_cacheable_names();
        if succeeded && !non_cacheable.iter().any(|n| n == &state.tool_name) {
            self.response_cache
                .put(user_prompt.to_string(), state.final_response.clone());
        }

        self.remember(Role::Agent, &state.final_response);
        state.final_response
    }

    async fn dual_write_triplets(&self, text: &str) {
        match extract_triplets(&self.services.llm, text).await {
            Ok(triplets) if !triplets.is_empty() => {
                if let Err(err) = self.services.graph.add_triplets(&triplets) {
                    warn!(%err, "dual-write to the knowledge graph failed");
                }
            }
            Ok(_) => {}
            Err(err) => debug!(%err, "dual-write triplet extraction failed"),
        }
    }

    /// Score the utterance for personal importance; important utterances are
    /// auto-noted into episodic memory and the graph.
    async fn reflect_and_note(&self, user_message: &str) {
        let mut importance = 0u32;
        const IMPORTANCE_KEYWORDS: &[&str] = &[
            "tomorrow",
            "next week",
            "remember",
            "don't forget",
            "i love",
            "i hate",
            "my address",
            "my phone",
        ];
        let lower = user_message.to_lowercase();
        if IMPORTANCE_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            importance += 1;
        }

        const IMPORTANCE_QUERIES: &[&str] =
            &["personal information", "task", "instruction", "preference"];
        if let Ok(message_embedding) = self.services.llm.embed(user_message).await {
            for query in IMPORTANCE_QUERIES {
                if let Ok(query_embedding) = self.services.llm.embed(query).await {
                    if cosine_similarity(&message_embedding, &query_embedding) > 0.80 {
                        importance += 1;
                        break;
                    }
                }
            }
        }

        if importance == 0 {
            return;
        }
        let note = format!("The user said: {user_message}");
        match self.services.memory.add(&note).await {
            Ok(_) => {
                debug!("auto-noted an important utterance");
                self.dual_write_triplets(&note).await;
            }
            Err(err) => warn!(%err, "auto-note failed"),
        }
    }
}

struct GatheredContext {
    persona_summary: String,
    personal_knowledge: String,
    graph_knowledge: String,
    past_knowledge: String,
}

fn summarize_input(input: &Value) -> String {
    let rendered = match input {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if rendered.len() > 75 {
        let mut cut = 75;
        while !rendered.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}..", &rendered[..cut])
    } else {
        rendered
    }
}

fn decision_summary(decision: &Decision) -> String {
    format!("{}({})", decision.action, summarize_input(&decision.input))
}
