//! Parsing of the controller's per-step decision.
//!
//! The model must answer with a JSON object carrying `thought`, `action`,
//! `input` and optionally `response`. Replies are parsed leniently: fenced or
//! bare JSON is accepted, an action given as a list collapses to its first
//! element, a missing `input` becomes an empty map, and a missing `response`
//! stays absent.

use serde_json::Value;

use minerva_llm::extract_json_value;

#[derive(Debug, Clone)]
pub struct Decision {
    pub thought: String,
    pub action: String,
    pub input: Value,
    pub response: Option<String>,
}

impl Decision {
    /// Whether this decision ends the turn instead of dispatching a tool.
    pub fn is_terminal(&self) -> bool {
        self.action == "none"
    }
}

/// Parse a raw model reply into a [`Decision`]. `None` when no JSON object
/// can be recovered.
pub fn parse_decision(raw: &str) -> Option<Decision> {
    let value = extract_json_value(raw)?;
    let obj = value.as_object()?;

    let action = match obj.get("action") {
        Some(Value::String(s)) => s.clone(),
        // Some models return a list of actions; take the first.
        Some(Value::Array(items)) => items
            .first()
            .and_then(|v| v.as_str())
            .unwrap_or("none")
            .to_string(),
        _ => "none".to_string(),
    };

    let input = match obj.get("input") {
        Some(Value::Null) | None => Value::Object(serde_json::Map::new()),
        Some(other) => other.clone(),
    };

    Some(Decision {
        thought: obj
            .get("thought")
            .and_then(|v| v.as_str())
            .unwrap_or("(no thought given)")
            .to_string(),
        action,
        input,
        response: obj
            .get("response")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_decision_parses() {
        let raw = r#"{"thought":"greet","action":"none","input":"","response":"Hi!"}"#;
        let d = parse_decision(raw).unwrap();
        assert!(d.is_terminal());
        assert_eq!(d.thought, "greet");
        assert_eq!(d.response.as_deref(), Some("Hi!"));
    }

    #[test]
    fn fenced_decision_parses() {
        let raw = "Thinking...\n```json\n{\"thought\":\"t\",\"action\":\"search\",\"input\":{\"query\":\"x\"}}\n```";
        let d = parse_decision(raw).unwrap();
        assert_eq!(d.action, "search");
        assert_eq!(d.input["query"], "x");
    }

    #[test]
    fn action_list_collapses_to_first() {
        let raw = r#"{"action":["search","summarize"],"input":{}}"#;
        let d = parse_decision(raw).unwrap();
        assert_eq!(d.action, "search");
    }

    #[test]
    fn missing_input_becomes_empty_map() {
        let raw = r#"{"action":"search"}"#;
        let d = parse_decision(raw).unwrap();
        assert!(d.input.as_object().unwrap().is_empty());
        assert!(d.response.is_none());
    }

    #[test]
    fn prose_is_rejected() {
        assert!(parse_decision("I think I should search the web.").is_none());
    }
}
