use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use minerva_llm::{LlmClient, LlmError, LlmProfiles};
use minerva_memory::{KnowledgeGraph, PersonaStore, PersonalVectorStore, VectorStore};
use minerva_tools::registry::{ToolDirs, ToolRegistry};
use minerva_tools::{Tool, ToolCtx, ToolResult, ToolSpec, ToolStatus};

use super::{PlanError, PlanStep, Planner};

const TEST_DIM: usize = 8;

struct ScriptedLlm {
    replies: Mutex<VecDeque<String>>,
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
        Ok(v)
    }
}

async fn ctx(dir: &tempfile::TempDir, replies: &[&str]) -> Arc<ToolCtx> {
    let llm = Arc::new(ScriptedLlm {
        replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
    });
    let llm = Arc::new(LlmProfiles::new(llm.clone(), llm.clone(), llm, TEST_DIM));
    let root = dir.path();

    let registry = Arc::new(ToolRegistry::new(ToolDirs {
        tools_dir: root.join("tools"),
        community_dir: root.join("tools/community_tools"),
        quarantine_dir: root.join("tools/community_tools/quarantine_tools"),
    }));
    registry.register_builtin(Arc::new(minerva_tools::builtins::ChatTool));
    registry.register_builtin(Arc::new(minerva_tools::builtins::WorkingMemoryTool));

    Arc::new(ToolCtx {
        llm: llm.clone(),
        memory: Arc::new(VectorStore::open(root.join("memory.redb"), llm.clone()).unwrap()),
        graph: Arc::new(KnowledgeGraph::open(root.join("kg.redb"), llm.clone()).unwrap()),
        persona: Arc::new(PersonaStore::open(root.join("persona.redb"), llm.clone(), 365).unwrap()),
        personal: Arc::new(
            PersonalVectorStore::open(root.join("personal"), llm.clone())
                .await
                .unwrap(),
        ),
        registry,
        working_memory: Mutex::new(Default::default()),
    })
}

/// Records the args it was invoked with and returns a fixed result.
struct RecordingTool {
    name: &'static str,
    reply: &'static str,
    calls: Mutex<Vec<Value>>,
}

impl RecordingTool {
    fn new(name: &'static str, reply: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            reply,
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Tool for RecordingTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            self.name,
            "test tool",
            json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }),
        )
    }

    async fn invoke(&self, args: Value, _ctx: &ToolCtx) -> anyhow::Result<ToolResult> {
        self.calls.lock().unwrap().push(args);
        Ok(ToolResult::success(self.reply))
    }
}

/// Fails with "permission denied" on the first invocation, succeeds after.
struct FlakyTool {
    failed_once: AtomicBool,
}

#[async_trait]
impl Tool for FlakyTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("write_file", "writes a file", json!({"type": "object"}))
    }

    async fn invoke(&self, _args: Value, _ctx: &ToolCtx) -> anyhow::Result<ToolResult> {
        if !self.failed_once.swap(true, Ordering::SeqCst) {
            Ok(ToolResult::error("permission denied"))
        } else {
            Ok(ToolResult::success("written"))
        }
    }
}

fn step(tool: &str, args: Value) -> PlanStep {
    PlanStep {
        tool_name: tool.to_string(),
        args: args.as_object().cloned().unwrap_or_default(),
    }
}

// ── Validation ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn empty_plan_is_a_validation_error() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx(&dir, &[]).await;
    let planner = Planner::new(3);

    let err = planner.validate(&ctx, &[]).unwrap_err();
    assert!(matches!(err, PlanError::Validation(_)));
}

#[tokio::test]
async fn step_zero_previous_output_placeholder_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx(&dir, &[]).await;
    ctx.registry.register_builtin(RecordingTool::new("search", "ok"));
    let planner = Planner::new(3);

    let plan = vec![step("search", json!({"query": "{{previous_tool_output}}"}))];
    let err = planner.validate(&ctx, &plan).unwrap_err();
    assert!(err.to_string().contains("previous_tool_output"));
}

#[tokio::test]
async fn unknown_tool_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx(&dir, &[]).await;
    let planner = Planner::new(3);

    let plan = vec![step("missing_tool", json!({}))];
    let err = planner.validate(&ctx, &plan).unwrap_err();
    assert!(err.to_string().contains("unknown tool"));
}

#[tokio::test]
async fn literal_args_are_schema_checked() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx(&dir, &[]).await;
    ctx.registry.register_builtin(RecordingTool::new("search", "ok"));
    let planner = Planner::new(3);

    // query must be a string.
    let bad = vec![step("search", json!({"query": 42}))];
    assert!(planner.validate(&ctx, &bad).is_err());

    let good = vec![step("search", json!({"query": "rust"}))];
    planner.validate(&ctx, &good).unwrap();
}

#[tokio::test]
async fn placeholders_pass_schema_validation() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx(&dir, &[]).await;
    ctx.registry.register_builtin(RecordingTool::new("search", "ok"));
    let planner = Planner::new(3);

    // "query" is required by the schema but carried as a placeholder; it must
    // pass through untouched.
    let plan = vec![
        step("search", json!({"query": "rust"})),
        step("search", json!({"query": "{{previous_tool_output}}"})),
    ];
    planner.validate(&ctx, &plan).unwrap();
}

// ── Execution ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn placeholders_are_substituted_between_steps() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx(&dir, &[]).await;
    let first = RecordingTool::new("search", "search results");
    let second = RecordingTool::new("summarize", "done");
    ctx.registry.register_builtin(first.clone());
    ctx.registry.register_builtin(second.clone());
    let planner = Planner::new(3);

    let plan = vec![
        step("search", json!({"query": "{{user_goal}}"})),
        step("summarize", json!({"query": "{{previous_tool_output}}"})),
    ];
    let result = planner.execute(&ctx, &plan, "research rust").await.unwrap();
    assert!(result.is_success());

    assert_eq!(first.calls.lock().unwrap()[0]["query"], "research rust");
    assert_eq!(second.calls.lock().unwrap()[0]["query"], "search results");
}

#[tokio::test]
async fn working_memory_placeholder_reads_the_scratchpad() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx(&dir, &[]).await;
    let sink = RecordingTool::new("sink", "ok");
    ctx.registry.register_builtin(sink.clone());
    let planner = Planner::new(3);

    let plan = vec![
        step(
            "working_memory",
            json!({"action": "set", "key": "summary_key", "value": "stored findings"}),
        ),
        step("sink", json!({"query": "{{working_memory.get('summary_key')}}"})),
    ];
    planner.execute(&ctx, &plan, "goal").await.unwrap();
    assert_eq!(sink.calls.lock().unwrap()[0]["query"], "stored findings");
}

#[tokio::test]
async fn clarification_halts_and_propagates() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx(&dir, &[]).await;
    let never_reached = RecordingTool::new("after", "x");
    ctx.registry.register_builtin(never_reached.clone());
    let planner = Planner::new(3);

    let plan = vec![
        step("chat", json!({"message": "which ticker do you mean?"})),
        step("after", json!({"query": "y"})),
    ];
    let result = planner.execute(&ctx, &plan, "goal").await.unwrap();
    assert_eq!(result.status, ToolStatus::ClarificationNeeded);
    assert!(never_reached.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failing_step_raises_execution_error() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx(&dir, &[]).await;
    ctx.registry.register_builtin(Arc::new(FlakyTool {
        failed_once: AtomicBool::new(false),
    }));
    let planner = Planner::new(3);

    let plan = vec![step("write_file", json!({}))];
    let err = planner.execute(&ctx, &plan, "goal").await.unwrap_err();
    assert!(err.to_string().contains("permission denied"));
}

// ── plan_and_execute ─────────────────────────────────────────────────────────

const PLAN_JSON: &str = r#"[
  {"tool_name": "search", "args": {"query": "{{user_goal}}"}},
  {"tool_name": "write_file", "args": {}}
]"#;

#[tokio::test]
async fn replan_after_failure_carries_retry_count() {
    let dir = tempfile::tempdir().unwrap();
    // Two plan-generation replies: the same plan twice. The flaky tool fails
    // during the first execution and succeeds during the second.
    let ctx = ctx(&dir, &[PLAN_JSON, PLAN_JSON]).await;
    ctx.registry.register_builtin(RecordingTool::new("search", "found"));
    ctx.registry.register_builtin(Arc::new(FlakyTool {
        failed_once: AtomicBool::new(false),
    }));
    let planner = Planner::new(3);

    let outcome = planner.plan_and_execute(&ctx, "write the findings down").await;
    assert!(outcome.result.is_success());
    assert_eq!(outcome.retries, 1);
}

#[tokio::test]
async fn exhausted_replans_return_the_last_error() {
    let dir = tempfile::tempdir().unwrap();
    // Every plan references an unknown tool, so validation fails on each of
    // the 1 + max_retries attempts.
    let bad_plan = r#"[{"tool_name": "ghost", "args": {}}]"#;
    let ctx = ctx(&dir, &[bad_plan, bad_plan]).await;
    let planner = Planner::new(1);

    let outcome = planner.plan_and_execute(&ctx, "goal").await;
    assert_eq!(outcome.result.status, ToolStatus::Error);
    assert_eq!(outcome.retries, 1);
    assert!(outcome.result.message.as_ref().unwrap().contains("ghost"));
}

#[tokio::test]
async fn tool_creation_goal_short_circuits_to_tool_creator() {
    let dir = tempfile::tempdir().unwrap();
    // Classifier reply "true" → single-step tool_creator plan; no catalogue
    // call happens.
    let ctx = ctx(&dir, &["true"]).await;
    ctx.registry
        .register_builtin(Arc::new(minerva_tools::builtins::ToolCreatorTool));
    let planner = Planner::new(3);

    let plan = planner.plan(&ctx, "create a tool that checks HTTP headers").await.unwrap();
    assert_eq!(plan.len(), 1);
    assert_eq!(plan[0].tool_name, "tool_creator");
    assert_eq!(
        plan[0].args["task_description"],
        "create a tool that checks HTTP headers"
    );
}

#[tokio::test]
async fn prose_reply_is_a_generation_error() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx(&dir, &["I cannot produce a plan right now."]).await;
    let planner = Planner::new(3);

    let err = planner.plan(&ctx, "goal").await.unwrap_err();
    assert!(matches!(err, PlanError::Generation(_)));
}
