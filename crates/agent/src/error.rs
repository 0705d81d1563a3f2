//! Turn-level error taxonomy. Most of these never abort a turn: tool and
//! unknown-action failures re-enter the loop as synthetic observations, and
//! the terminal variants resolve to fixed user-visible messages.

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("llm failure: {0}")]
    LlmFailure(String),
    #[error("the model returned an unusable decision: {0}")]
    SchemaViolation(String),
    #[error("tool '{tool}' failed: {message}")]
    ToolError { tool: String, message: String },
    #[error("no tool named '{0}' is registered")]
    UnknownTool(String),
    #[error("plan validation failed: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("cancelled by the user")]
    Cancelled,
    #[error("the agent detected it was stuck in a loop")]
    LoopDetected,
    #[error("the step budget was exhausted")]
    StepBudgetExhausted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_no_internals() {
        let err = AgentError::ToolError {
            tool: "search".to_string(),
            message: "timeout".to_string(),
        };
        assert_eq!(err.to_string(), "tool 'search' failed: timeout");
        assert_eq!(AgentError::Cancelled.to_string(), "cancelled by the user");
    }

    #[test]
    fn every_variant_renders_one_line() {
        let errors = [
            AgentError::LlmFailure("down".to_string()),
            AgentError::SchemaViolation("not json".to_string()),
            AgentError::UnknownTool("ghost".to_string()),
            AgentError::Validation("empty plan".to_string()),
            AgentError::Storage("disk full".to_string()),
            AgentError::Cancelled,
            AgentError::LoopDetected,
            AgentError::StepBudgetExhausted,
        ];
        for err in errors {
            let rendered = err.to_string();
            assert!(!rendered.is_empty());
            assert!(!rendered.contains('\n'));
        }
    }
}
