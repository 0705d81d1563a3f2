//! Proactive research: drain the research queue and turn each queued topic
//! into a synthesised report written back to the personal store.
//!
//! Research fans out over the LLM-proposed sub-queries with a bounded worker
//! pool. Workers that call the heavy LLM serialise on its process-wide gate.

use anyhow::{Context, Result};
use futures::StreamExt;
use serde_json::Value;
use tracing::{info, warn};

use minerva_llm::extract_json_value;
use minerva_tools::ToolCtx;

use crate::controller::Services;
use crate::truncate::smart_truncate;

/// Episodic hits closer than this squared distance count as "already known".
const KNOWN_DISTANCE: f32 = 0.2;
/// Per-source budget going into the synthesis prompt.
const SYNTHESIS_BUDGET: usize = 10_000;

/// Research `topic` in depth. Returns `None` when episodic memory already
/// covers the topic closely enough to skip the research.
pub async fn deep_research(services: &Services, ctx: &ToolCtx, topic: &str) -> Result<Option<String>> {
    info!(topic, "proactive research started");

    let existing = services.memory.search(topic, 5).await?;
    let known: Vec<&str> = existing
        .iter()
        .filter(|hit| hit.distance < KNOWN_DISTANCE)
        .map(|hit| hit.content.as_str())
        .collect();
    if !known.is_empty() {
        info!(topic, "topic already covered, skipping research");
        return Ok(None);
    }

    let search_topic = extract_search_keywords(services, topic).await;

    let initial_summary = run_search(services, ctx, &search_topic).await;
    let sub_queries = propose_sub_queries(services, topic, &initial_summary).await?;
    info!(count = sub_queries.len(), "researching sub-queries");

    let max_workers = services.config.runtime.researcher_max_workers.max(1);
    let deep_dives: Vec<(String, String)> = futures::stream::iter(sub_queries.into_iter().map(|query| {
        async move {
            let result = run_search(services, ctx, &query).await;
            (query, result)
        }
    }))
    .buffer_unordered(max_workers)
    .collect()
    .await;

    let summarized_initial =
        smart_truncate(&services.llm, &initial_summary, SYNTHESIS_BUDGET, topic).await;
    let mut synthesis_prompt = format!(
        "You are a research analyst. You gathered the information below about the topic \
         '{topic}'. Combine it into a comprehensive, fluent, well-structured final report. \
         Note differing viewpoints or conflicting information where present. Write only the \
         report.\n\nINITIAL SUMMARY:\n{summarized_initial}\n\nDETAILED FINDINGS:\n"
    );
    for (query, result) in &deep_dives {
        let truncated = smart_truncate(&services.llm, result, SYNTHESIS_BUDGET, query).await;
        synthesis_prompt.push_str(&format!("- Sub-topic '{query}':\n{truncated}\n\n"));
    }

    let report = services
        .llm
        .complete(&synthesis_prompt, 4096)
        .await
        .context("research synthesis failed")?;
    info!(topic, report_len = report.len(), "research report synthesised");
    Ok(Some(report))
}

/// Drain the research queue FIFO and write each finished report back to the
/// personal store under the queued topic. `skip_queue` on the write-back
/// keeps consumed topics from re-enqueueing. Returns the number of topics
/// researched.
pub async fn process_research_queue(services: &Services, ctx: &ToolCtx) -> Result<usize> {
    let entries = services.personal.drain_research_queue()?;
    if entries.is_empty() {
        return Ok(0);
    }
    info!(topics = entries.len(), "processing research queue");

    let mut processed = 0usize;
    for (topic, text) in entries {
        let subject = if text.is_empty() { topic.clone() } else { text };
        match deep_research(services, ctx, &subject).await {
            Ok(Some(report)) => {
                let note = format!("Research report on '{subject}':\n{report}");
                services
                    .personal
                    .add(&note, &topic, Default::default(), true)
                    .await?;
                processed += 1;
            }
            Ok(None) => {}
            Err(err) => warn!(%err, topic, "research failed for queued topic"),
        }
    }
    Ok(processed)
}

async fn extract_search_keywords(services: &Services, topic: &str) -> String {
    let prompt = format!(
        "Analyze the following request and extract a concise search query of 3-5 keywords \
         for a web search.\n\nRequest: \"{topic}\"\n\nSearch query:"
    );
    match services.llm.complete(&prompt, 64).await {
        Ok(keywords) if !keywords.trim().is_empty() => keywords.trim().replace('"', ""),
        _ => topic.to_string(),
    }
}

/// Run one search pass: through the `internet_search` tool when a deployment
/// provides one, otherwise straight from the model's own knowledge.
async fn run_search(services: &Services, ctx: &ToolCtx, query: &str) -> String {
    if let Some(search) = services.registry.get("internet_search") {
        match search
            .invoke(serde_json::json!({"query": query}), ctx)
            .await
        {
            Ok(result) if result.is_success() => return result.observation_text(),
            Ok(result) => warn!(query, message = ?result.message, "search tool failed"),
            Err(err) => warn!(query, %err, "search tool raised an error"),
        }
    }

    let prompt = format!(
        "Summarise the most important facts you know about the following subject in a few \
         paragraphs.\n\nSubject: {query}\n\nSummary:"
    );
    services.llm.complete(&prompt, 1024).await.unwrap_or_default()
}

async fn propose_sub_queries(
    services: &Services,
    topic: &str,
    initial_summary: &str,
) -> Result<Vec<String>> {
    let prompt = format!(
        "Request: \"{topic}\"\n\n\
         Identify 3 to 5 sub-topics, questions or key concepts that must be researched to \
         understand this request in depth. Stay strictly on topic. Respond with ONLY a JSON \
         list of strings.\n\nINITIAL RESEARCH SUMMARY:\n\"{initial_summary}\"\n\nJSON:"
    );
    let reply = services.llm.complete(&prompt, 2048).await?;

    if let Some(Value::Array(items)) = extract_json_value(&reply) {
        let queries: Vec<String> = items
            .into_iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .filter(|q| q.len() > 5)
            .collect();
        if !queries.is_empty() {
            return Ok(queries);
        }
    }

    // Fallback: strip list markup and keep plausible lines.
    let cleaned: Vec<String> = reply
        .replace('`', "")
        .replace("json", "")
        .lines()
        .map(|line| line.trim_matches([' ', '-', '*', ',', '"', '[', ']']).to_string())
        .filter(|line| line.len() > 5)
        .collect();
    if cleaned.is_empty() {
        anyhow::bail!("no usable sub-queries in reply: {reply}");
    }
    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Agent;
    use crate::testing;

    const SUB_QUERIES: &str = "Identify 3 to 5 sub-topics";
    const SYNTHESIS: &str = "You are a research analyst";

    #[tokio::test]
    async fn queued_topics_become_personal_notes_without_requeueing() {
        let dir = tempfile::tempdir().unwrap();
        let (_llm, services) = testing::services(
            &dir,
            &[
                ("concise search query", "stoicism basics"),
                (SUB_QUERIES, r#"["stoic ethics in practice", "history of the stoa"]"#),
                (SYNTHESIS, "a full report on stoicism"),
                ("Summarise the most important facts", "some facts"),
            ],
        )
        .await;
        let agent = Agent::new(services.clone());

        // Queue one topic the normal way.
        services
            .personal
            .add("learn about stoicism", "philosophy", Default::default(), false)
            .await
            .unwrap();

        let processed = process_research_queue(&services, agent.tool_ctx()).await.unwrap();
        assert_eq!(processed, 1);

        // The report landed under the queued topic...
        let notes = services.personal.notes_by_topic("philosophy");
        assert!(notes.iter().any(|n| n.text.contains("a full report on stoicism")));
        // ...and the write-back did not re-enqueue anything.
        assert!(services.personal.drain_research_queue().unwrap().is_empty());
    }

    #[tokio::test]
    async fn well_known_topics_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (llm, services) = testing::services(&dir, &[]).await;
        let agent = Agent::new(services.clone());

        // An exact record in episodic memory puts the top hit at distance 0.
        services.memory.add("stoicism overview").await.unwrap();

        let report = deep_research(&services, agent.tool_ctx(), "stoicism overview")
            .await
            .unwrap();
        assert!(report.is_none());
        assert_eq!(llm.completions(), 0);
    }

    #[tokio::test]
    async fn empty_queue_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (_llm, services) = testing::services(&dir, &[]).await;
        let agent = Agent::new(services.clone());
        assert_eq!(
            process_research_queue(&services, agent.tool_ctx()).await.unwrap(),
            0
        );
    }
}
