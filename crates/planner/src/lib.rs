//! Multi-step planning: synthesise a validated tool sequence for a goal,
//! execute it with placeholder substitution, and replan on failure.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use minerva_llm::extract_json_value;
use minerva_tools::{ToolCtx, ToolResult, ToolStatus};

pub const PREVIOUS_OUTPUT_TOKEN: &str = "{{previous_tool_output}}";
pub const USER_GOAL_TOKEN: &str = "{{user_goal}}";

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("plan generation failed: {0}")]
    Generation(String),
    #[error("plan validation failed: {0}")]
    Validation(String),
    #[error("step '{tool}' failed: {message}")]
    Execution { tool: String, message: String },
}

/// One planned tool invocation. Arg values may carry placeholder tokens that
/// are substituted at execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub tool_name: String,
    #[serde(default)]
    pub args: serde_json::Map<String, Value>,
}

/// Result of `plan_and_execute`, carrying how many replans were spent.
#[derive(Debug)]
pub struct PlanOutcome {
    pub result: ToolResult,
    pub retries: u32,
}

pub struct Planner {
    max_retries: u32,
}

impl Planner {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    // ── Plan generation ──────────────────────────────────────────────────────

    /// Narrow classifier: does this goal require creating a new tool?
    async fn needs_new_tool(&self, ctx: &ToolCtx, goal: &str) -> bool {
        if !ctx.registry.contains("tool_creator") {
            return false;
        }
        let prompt = format!(
            "You are a decision-making AI. Determine whether the user's request requires \
             creating a new tool.\n\
             A new tool is needed for a specific, reusable capability (e.g. 'write a tool \
             to do X', 'create a function for Y').\n\
             A new tool is NOT needed for general questions, research, file editing or \
             one-off commands.\n\n\
             User goal: \"{goal}\"\n\n\
             Does this goal require creating a new tool? Answer only true or false:"
        );
        match ctx.llm.complete(&prompt, 10).await {
            Ok(reply) => reply.to_lowercase().contains("true"),
            Err(err) => {
                warn!(%err, "tool-creation classifier failed");
                false
            }
        }
    }

    pub async fn plan(&self, ctx: &ToolCtx, goal: &str) -> Result<Vec<PlanStep>, PlanError> {
        if self.needs_new_tool(ctx, goal).await {
            info!("goal requires a new tool, planning a tool_creator invocation");
            let mut args = serde_json::Map::new();
            args.insert("task_description".to_string(), Value::String(goal.to_string()));
            return Ok(vec![PlanStep {
                tool_name: "tool_creator".to_string(),
                args,
            }]);
        }

        let tools_string = ctx
            .registry
            .specs()
            .iter()
            .map(|spec| {
                format!(
                    "- `{}`: {} (args schema: {})",
                    spec.name, spec.description, spec.input_schema
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            r#"You are an expert planner AI. Create a step-by-step plan that achieves the user's goal.
Your response MUST be a JSON list of objects, each with "tool_name" (string) and "args" (object).

RULES:
1. Break complex goals into a logical sequence of tool calls, and provide every required argument.
2. For multi-step tasks that pass data between steps, use the `working_memory` tool: action "set" to store an intermediate result, action "get" to read it back later.
3. The `chat` tool may ONLY be the very first step, and ONLY when the goal is ambiguous or missing critical information. Never use it to rephrase the goal back at the user.
4. Use "{{{{previous_tool_output}}}}" to pass the previous step's result, "{{{{user_goal}}}}" for the original request, and "{{{{working_memory.get('key')}}}}" to read a stored value.
5. Never invent tool names or argument values; only use the tools listed below.
6. Review the plan against these rules before answering, and fix it if it violates any.

User goal: "{goal}"

Available tools:
{tools_string}

Plan (respond with ONLY a valid JSON list of objects, no other text):"#
        );

        let reply = ctx
            .llm
            .complete(&prompt, 512)
            .await
            .map_err(|err| PlanError::Generation(err.to_string()))?;

        let Some(Value::Array(items)) = extract_json_value(&reply) else {
            return Err(PlanError::Generation(format!(
                "no JSON plan list in reply: {reply}"
            )));
        };
        let steps: Vec<PlanStep> = items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()
            .map_err(|err| {
                PlanError::Generation(format!(
                    "plan items must be objects with tool_name and args: {err}"
                ))
            })?;
        debug!(steps = steps.len(), "plan generated");
        Ok(steps)
    }

    // ── Validation ───────────────────────────────────────────────────────────

    pub fn validate(&self, ctx: &ToolCtx, plan: &[PlanStep]) -> Result<(), PlanError> {
        if plan.is_empty() {
            return Err(PlanError::Validation("plan must not be empty".to_string()));
        }

        for (i, step) in plan.iter().enumerate() {
            if step.tool_name.is_empty() {
                return Err(PlanError::Validation(format!("step {i} is missing a tool_name")));
            }
            let Some(tool) = ctx.registry.get(&step.tool_name) else {
                return Err(PlanError::Validation(format!(
                    "step {i} references unknown tool '{}'",
                    step.tool_name
                )));
            };

            if i == 0 {
                for value in step.args.values() {
                    if matches!(value, Value::String(s) if s.contains(PREVIOUS_OUTPUT_TOKEN)) {
                        return Err(PlanError::Validation(format!(
                            "step 0 must not reference {PREVIOUS_OUTPUT_TOKEN}"
                        )));
                    }
                }
            }

            validate_step_args(&tool.spec().input_schema, &step.args, &step.tool_name)?;
        }
        Ok(())
    }

    // ── Execution ────────────────────────────────────────────────────────────

    /// Run the plan linearly, substituting placeholders between steps.
    /// `clarification_needed` halts the plan and propagates. Any non-success
    /// step raises an execution error so the caller can replan.
    pub async fn execute(
        &self,
        ctx: &ToolCtx,
        plan: &[PlanStep],
        goal: &str,
    ) -> Result<ToolResult, PlanError> {
        let mut last_result: Option<ToolResult> = None;
        let mut previous_output: Option<Value> = None;

        for (i, step) in plan.iter().enumerate() {
            info!(step = i + 1, total = plan.len(), tool = %step.tool_name, "executing plan step");

            let Some(tool) = ctx.registry.get(&step.tool_name) else {
                return Err(PlanError::Execution {
                    tool: step.tool_name.clone(),
                    message: "unknown tool".to_string(),
                });
            };

            let args = resolve_args(ctx, &step.args, goal, previous_output.as_ref(), i);
            let result = tool
                .invoke(Value::Object(args), ctx)
                .await
                .map_err(|err| PlanError::Execution {
                    tool: step.tool_name.clone(),
                    message: err.to_string(),
                })?;

            match result.status {
                ToolStatus::ClarificationNeeded => {
                    info!("plan halted: clarification needed from the user");
                    return Ok(result);
                }
                ToolStatus::Error => {
                    return Err(PlanError::Execution {
                        tool: step.tool_name.clone(),
                        message: result
                            .message
                            .unwrap_or_else(|| "unknown execution error".to_string()),
                    });
                }
                ToolStatus::Success | ToolStatus::Info => {
                    previous_output = result.result.clone();
                    last_result = Some(result);
                }
            }
        }

        Ok(last_result.unwrap_or_else(|| {
            ToolResult::success("Plan executed successfully, but no tool returned a result.")
        }))
    }

    /// Plan, validate and execute; on failure, replan with the error appended
    /// to the goal, up to the retry budget.
    pub async fn plan_and_execute(&self, ctx: &ToolCtx, goal: &str) -> PlanOutcome {
        let mut retries = 0u32;
        let mut current_goal = goal.to_string();
        let mut last_error = String::new();

        loop {
            match self.attempt(ctx, &current_goal, goal).await {
                Ok(result) => return PlanOutcome { result, retries },
                Err(err) => {
                    last_error = err.to_string();
                    warn!(attempt = retries + 1, error = %last_error, "plan attempt failed");
                    if retries >= self.max_retries {
                        break;
                    }
                    retries += 1;
                    current_goal = format!(
                        "While trying to achieve '{goal}', the previous attempt failed with: \
                         '{last_error}'. Produce a different plan that avoids this error."
                    );
                }
            }
        }

        PlanOutcome {
            result: ToolResult::error(format!(
                "the planner failed on every attempt. Last error: {last_error}"
            )),
            retries,
        }
    }

    async fn attempt(
        &self,
        ctx: &ToolCtx,
        current_goal: &str,
        original_goal: &str,
    ) -> Result<ToolResult, PlanError> {
        let plan = self.plan(ctx, current_goal).await?;
        self.validate(ctx, &plan)?;
        self.execute(ctx, &plan, original_goal).await
    }
}

// ── Placeholder handling ─────────────────────────────────────────────────────

fn is_placeholder(value: &Value) -> bool {
    matches!(value, Value::String(s) if s.contains("{{") && s.contains("}}"))
}

fn working_memory_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"working_memory\.get\('([^']+)'\)").unwrap())
}

fn resolve_args(
    ctx: &ToolCtx,
    args: &serde_json::Map<String, Value>,
    goal: &str,
    previous_output: Option<&Value>,
    step_index: usize,
) -> serde_json::Map<String, Value> {
    let mut resolved = serde_json::Map::new();
    for (key, value) in args {
        let Value::String(s) = value else {
            resolved.insert(key.clone(), value.clone());
            continue;
        };

        if s == PREVIOUS_OUTPUT_TOKEN || s == "{previous_tool_output}" {
            if step_index > 0 && previous_output.is_none() {
                warn!(key, "previous step produced no output for this placeholder");
            }
            resolved.insert(key.clone(), previous_output.cloned().unwrap_or(Value::Null));
        } else if s == USER_GOAL_TOKEN || s == "{user_goal}" {
            resolved.insert(key.clone(), Value::String(goal.to_string()));
        } else if s.contains("{{working_memory.get") {
            match working_memory_pattern().captures(s) {
                Some(captures) => {
                    let wm_key = &captures[1];
                    let stored = ctx.working_get(wm_key).unwrap_or_default();
                    let token = format!("{{{{working_memory.get('{wm_key}')}}}}");
                    resolved.insert(key.clone(), Value::String(s.replace(&token, &stored)));
                }
                None => {
                    warn!(key, "could not parse working_memory placeholder");
                    resolved.insert(key.clone(), value.clone());
                }
            }
        } else {
            resolved.insert(key.clone(), value.clone());
        }
    }
    resolved
}

// ── Schema validation ────────────────────────────────────────────────────────

/// Validate literal args against the tool's declared JSON Schema. Values that
/// carry placeholder tokens pass through: they are removed from the instance
/// and from the schema's `required` list before validation.
fn validate_step_args(
    schema: &Value,
    args: &serde_json::Map<String, Value>,
    tool_name: &str,
) -> Result<(), PlanError> {
    if !schema.is_object() {
        return Ok(());
    }

    let placeholder_keys: Vec<&String> = args
        .iter()
        .filter(|(_, v)| is_placeholder(v))
        .map(|(k, _)| k)
        .collect();

    let mut instance = serde_json::Map::new();
    for (key, value) in args {
        if !placeholder_keys.contains(&key) {
            instance.insert(key.clone(), value.clone());
        }
    }

    let mut schema = schema.clone();
    if let Some(required) = schema.get_mut("required").and_then(|r| r.as_array_mut()) {
        required.retain(|name| {
            name.as_str()
                .map(|n| !placeholder_keys.iter().any(|k| k.as_str() == n))
                .unwrap_or(true)
        });
    }

    let validator = jsonschema::validator_for(&schema).map_err(|err| {
        PlanError::Validation(format!("tool '{tool_name}' has an invalid arg schema: {err}"))
    })?;
    let instance = Value::Object(instance);
    validator.validate(&instance).map_err(|err| {
        PlanError::Validation(format!("invalid arguments for tool '{tool_name}': {err}"))
    })
}

#[cfg(test)]
mod tests;
