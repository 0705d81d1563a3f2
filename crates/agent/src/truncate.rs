//! Smart truncation: long text bound for an LLM prompt is summarised by the
//! fast profile instead of being chopped. Hard truncation is the fallback
//! when the summariser is unavailable. Output never exceeds the budget;
//! within-budget input passes through unchanged.

use tracing::warn;

use minerva_llm::LlmProfiles;

const TRUNCATION_MARKER: &str = "\n...[truncated]...";

/// Bound `text` to `budget` bytes. `context` (usually the user goal) steers
/// the summary toward what matters for the task at hand.
pub async fn smart_truncate(llm: &LlmProfiles, text: &str, budget: usize, context: &str) -> String {
    if text.len() <= budget {
        return text.to_string();
    }

    let context_line = if context.is_empty() {
        String::new()
    } else {
        format!(" This summary will be used for the task: '{context}'.")
    };
    let target = budget / 2;
    let prompt = format!(
        "Summarise the following text into roughly {target} characters, keeping the most \
         important information.{context_line}\n\nTEXT:\n{text}\n\nSUMMARY:"
    );

    match llm.complete_fast(&prompt, 1024).await {
        Ok(summary) if !summary.trim().is_empty() => {
            if summary.len() <= budget {
                summary
            } else {
                hard_truncate(&summary, budget)
            }
        }
        Ok(_) => hard_truncate(text, budget),
        Err(err) => {
            warn!(%err, "summariser unavailable, hard-truncating");
            hard_truncate(text, budget)
        }
    }
}

fn hard_truncate(text: &str, budget: usize) -> String {
    let mut cut = budget.saturating_sub(TRUNCATION_MARKER.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &text[..cut], TRUNCATION_MARKER)
}
