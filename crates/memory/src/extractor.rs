//! LLM-driven extraction of knowledge triplets from free text. The dual-write
//! path runs every episodic insert through this before feeding the graph.

use anyhow::Result;
use serde_json::Value;
use tracing::debug;

use minerva_llm::{LlmProfiles, extract_json_value};

use crate::graph::TripletCandidate;

/// Extract `(subject, relation, object)` triplets from `text`. Returns an
/// empty list when the reply carries no parseable triplet list.
pub async fn extract_triplets(llm: &LlmProfiles, text: &str) -> Result<Vec<TripletCandidate>> {
    let prompt = format!(
        "You are a knowledge engineer. Extract the semantic relations from the text below \
         as knowledge triplets. Your output MUST be a JSON list in the form \
         [{{\"subject\": \"Entity 1\", \"relation\": \"RELATION\", \"object\": \"Entity 2\"}}, ...]. \
         Respond with ONLY the JSON list, no other text or explanation.\n\
         Text: \"{text}\"\nJSON:"
    );
    let reply = llm.complete(&prompt, 1024).await?;

    let Some(Value::Array(items)) = extract_json_value(&reply) else {
        debug!("no triplet list in extractor reply");
        return Ok(Vec::new());
    };

    let triplets: Vec<TripletCandidate> = items
        .into_iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            Some(TripletCandidate {
                subject: obj.get("subject")?.as_str()?.to_string(),
                relation: obj.get("relation")?.as_str()?.to_string(),
                object: obj.get("object")?.as_str()?.to_string(),
            })
        })
        .collect();
    debug!(count = triplets.len(), "triplets extracted");
    Ok(triplets)
}
