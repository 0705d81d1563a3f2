//! Memory consolidation: fold the scattered notes of the last N days into
//! denser summary notes and drop the originals.

use anyhow::{Result, bail};
use tracing::info;

use minerva_llm::LlmProfiles;

use crate::episodic::VectorStore;

#[derive(Debug, Clone, Copy)]
pub struct ConsolidationReport {
    pub source_notes: usize,
    pub new_notes: usize,
    pub deleted: usize,
}

/// Summarise every note added in the last `days` days into merged notes,
/// insert the merged notes, then delete the sources.
pub async fn consolidate(
    store: &VectorStore,
    llm: &LlmProfiles,
    days: i64,
) -> Result<ConsolidationReport> {
    let recent = store.get_documents_since(days)?;
    if recent.is_empty() {
        return Ok(ConsolidationReport {
            source_notes: 0,
            new_notes: 0,
            deleted: 0,
        });
    }

    let ids: Vec<u64> = recent.iter().map(|(id, _)| *id).collect();
    let combined = recent
        .iter()
        .map(|(_, text)| text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n---\n\n");

    let prompt = format!(
        "Below is a series of notes recorded over the last few days. Analyse them and \
         produce denser, summarised notes that keep the important, related and reusable \
         facts and conclusions.\n\
         - Skip repeated, trivial or transient information (e.g. 'file written').\n\
         - Merge related facts into one meaningful note.\n\
         - Output a bulleted list, one note per line, each line starting with '- '.\n\n\
         NOTES:\n---\n{combined}\n---\n\nSUMMARISED NOTES (bulleted list):"
    );
    let reply = llm.complete(&prompt, 2048).await?;

    let new_notes: Vec<String> = reply
        .lines()
        .map(|line| line.trim().trim_start_matches('-').trim().to_string())
        .filter(|note| note.len() > 20)
        .collect();
    if new_notes.is_empty() {
        bail!("consolidation produced no usable summary notes");
    }

    for note in &new_notes {
        store.add(&format!("Consolidated memory: {note}")).await?;
    }
    let deleted = store.delete_by_ids(&ids)?;

    let report = ConsolidationReport {
        source_notes: recent.len(),
        new_notes: new_notes.len(),
        deleted,
    };
    info!(
        sources = report.source_notes,
        merged = report.new_notes,
        deleted = report.deleted,
        "memory consolidated"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[tokio::test]
    async fn merges_recent_notes_and_deletes_sources() {
        let dir = tempfile::tempdir().unwrap();
        let llm = testing::profiles(&[
            "- the user works on a rust agent project\n- short\n- canberra is the capital of australia",
        ]);
        let store = VectorStore::open(dir.path().join("m.redb"), llm.clone()).unwrap();
        store.add("working on agent in rust today").await.unwrap();
        store.add("rust project continues").await.unwrap();
        store.add("learned canberra is the capital").await.unwrap();

        let report = consolidate(&store, &llm, 1).await.unwrap();
        assert_eq!(report.source_notes, 3);
        // "- short" is under the 20-char floor.
        assert_eq!(report.new_notes, 2);
        assert_eq!(report.deleted, 3);
        assert_eq!(store.len().unwrap(), 2);

        let texts = store.get_all_document_texts().unwrap();
        assert!(texts.iter().all(|t| t.starts_with("Consolidated memory: ")));
    }

    #[tokio::test]
    async fn nothing_recent_is_a_clean_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let llm = testing::profiles(&[]);
        let store = VectorStore::open(dir.path().join("m.redb"), llm.clone()).unwrap();

        let report = consolidate(&store, &llm, 1).await.unwrap();
        assert_eq!(report.source_notes, 0);
        assert_eq!(report.deleted, 0);
    }
}
