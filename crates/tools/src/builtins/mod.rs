//! Built-in tools, compile-time registered.

mod auditor;
mod chat;
mod consolidator;
mod creator_tool;
mod review;
mod update_knowledge;
mod working_memory;

pub use auditor::ManifestAuditorTool;
pub use chat::ChatTool;
pub use consolidator::MemoryConsolidatorTool;
pub use creator_tool::ToolCreatorTool;
pub use review::ReviewAndApproveTool;
pub use update_knowledge::UpdateKnowledgeTool;
pub use working_memory::WorkingMemoryTool;

use std::sync::Arc;

use serde_json::Value;

use crate::ToolRegistry;

/// Register every built-in on `registry`.
pub fn register_all(registry: &ToolRegistry) {
    registry.register_builtin(Arc::new(ChatTool));
    registry.register_builtin(Arc::new(WorkingMemoryTool));
    registry.register_builtin(Arc::new(UpdateKnowledgeTool));
    registry.register_builtin(Arc::new(ReviewAndApproveTool));
    registry.register_builtin(Arc::new(ToolCreatorTool));
    registry.register_builtin(Arc::new(ManifestAuditorTool));
    registry.register_builtin(Arc::new(MemoryConsolidatorTool));
}

/// Tools accept args as either an object or a JSON-encoded string; normalise
/// to a `Value`.
pub(crate) fn normalize_args(args: Value) -> Value {
    match args {
        Value::String(raw) => {
            let cleaned = raw.replace("```json", "").replace("```", "");
            serde_json::from_str(cleaned.trim()).unwrap_or(Value::String(raw))
        }
        other => other,
    }
}

pub(crate) fn arg_str(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}
