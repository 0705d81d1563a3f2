//! Document summarisation for the CLI: map over fixed-size chunks with a
//! bounded worker pool on the fast profile, then reduce with the heavy one.

use anyhow::{Context, Result};
use futures::StreamExt;
use tracing::info;

use minerva_llm::LlmProfiles;

/// Character size of one map chunk.
const CHUNK_SIZE: usize = 4000;

/// Summarise an arbitrary document. Short inputs go through a single call;
/// long ones are chunked, mapped in parallel (at most `max_workers` at a
/// time) and reduced into one summary.
pub async fn summarize_document(llm: &LlmProfiles, text: &str, max_workers: usize) -> Result<String> {
    let text = text.trim();
    if text.is_empty() {
        anyhow::bail!("nothing to summarise");
    }

    if text.len() <= CHUNK_SIZE {
        let prompt = format!(
            "Summarise the following text, keeping the key facts and conclusions:\n\n{text}\n\nSummary:"
        );
        return llm
            .complete(&prompt, 1024)
            .await
            .context("summarisation failed");
    }

    let chunks = split_chunks(text, CHUNK_SIZE);
    info!(chunks = chunks.len(), "summarising document in parallel");

    let partials: Vec<(usize, Result<String, minerva_llm::LlmError>)> =
        futures::stream::iter(chunks.into_iter().enumerate().map(|(i, chunk)| async move {
            let prompt = format!(
                "Summarise this part of a longer document, keeping the key facts:\n\n{chunk}\n\nSummary:"
            );
            (i, llm.complete_fast(&prompt, 512).await)
        }))
        .buffer_unordered(max_workers.max(1))
        .collect()
        .await;

    // Restore document order; failed chunks are dropped.
    let mut ordered: Vec<(usize, String)> = partials
        .into_iter()
        .filter_map(|(i, result)| result.ok().map(|s| (i, s)))
        .collect();
    ordered.sort_by_key(|(i, _)| *i);
    if ordered.is_empty() {
        anyhow::bail!("every chunk summarisation failed");
    }

    let combined = ordered
        .into_iter()
        .map(|(_, s)| s)
        .collect::<Vec<_>>()
        .join("\n\n");
    let prompt = format!(
        "The notes below summarise consecutive parts of one document. Merge them into a \
         single coherent summary:\n\n{combined}\n\nFinal summary:"
    );
    llm.complete(&prompt, 1024)
        .await
        .context("final summarisation failed")
}

/// Split on char boundaries into chunks of at most `size` bytes.
fn split_chunks(text: &str, size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        if rest.len() <= size {
            chunks.push(rest.to_string());
            break;
        }
        let mut cut = size;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    chunks
}
