//! Content-addressed episodic memory: durable rows in redb plus an in-RAM
//! flat index keyed by the same ids.
//!
//! Invariant: every id in the index has exactly one matching row, and vice
//! versa. The index is rebuilt from the persisted rows at startup; a stored
//! dimension that differs from the model dimension refuses to load.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use minerva_llm::LlmProfiles;

use crate::flat_index::FlatIndex;
use crate::{blob_to_vec, vec_to_blob};

/// Note rows: `id → json(NoteRow)`.
const ROWS: TableDefinition<u64, &[u8]> = TableDefinition::new("notes");
/// Embedding blobs: `id → little-endian f32 * D`.
const VECS: TableDefinition<u64, &[u8]> = TableDefinition::new("note_vecs");
/// Store metadata: `next_id`, `dim`.
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

#[derive(Debug, Serialize, Deserialize)]
struct NoteRow {
    content: String,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
    // Rows written before this field existed hydrate with "now";
    // deserialisation stays non-destructive across schema growth.
    #[serde(default = "Utc::now")]
    last_accessed_at: DateTime<Utc>,
}

/// One search result, hydrated from the row the index hit points at.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: u64,
    pub content: String,
    pub distance: f32,
    pub created_at: DateTime<Utc>,
}

/// The store refuses to load when the persisted embedding dimension does not
/// match the model's.
#[derive(Debug, thiserror::Error)]
#[error("stored embedding dimension {stored} does not match model dimension {expected}")]
pub struct DimensionMismatch {
    pub stored: usize,
    pub expected: usize,
}

pub struct VectorStore {
    db: Database,
    llm: Arc<LlmProfiles>,
    index: Mutex<FlatIndex>,
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore").finish_non_exhaustive()
    }
}

impl VectorStore {
    /// Open (or create) the store at `path` and rebuild the index from the
    /// persisted rows.
    pub fn open(path: impl AsRef<Path>, llm: Arc<LlmProfiles>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)
            .with_context(|| format!("opening episodic store at {}", path.display()))?;

        let expected = llm.dim();
        {
            let tx = db.begin_write()?;
            {
                tx.open_table(ROWS)?;
                tx.open_table(VECS)?;
                let mut meta = tx.open_table(META)?;
                let stored_dim = meta.get("dim")?.map(|v| v.value());
                match stored_dim {
                    Some(stored) if stored as usize != expected => {
                        bail!(DimensionMismatch {
                            stored: stored as usize,
                            expected,
                        });
                    }
                    Some(_) => {}
                    None => {
                        meta.insert("dim", expected as u64)?;
                    }
                }
            }
            tx.commit()?;
        }

        let mut index = FlatIndex::new(expected);
        {
            let tx = db.begin_read()?;
            let vecs = tx.open_table(VECS)?;
            for entry in vecs.iter()? {
                let (key, value) = entry?;
                index.insert(key.value(), blob_to_vec(value.value()))?;
            }
        }
        info!(entries = index.len(), path = %path.display(), "episodic index rebuilt");

        Ok(Self {
            db,
            llm,
            index: Mutex::new(index),
        })
    }

    /// Insert a new note. The row commits first; the index contains the id
    /// before this returns. The embedding dimension is validated before the
    /// commit, so the index insert cannot fail afterwards.
    pub async fn add(&self, content: &str) -> Result<u64> {
        let embedding = self.llm.embed(content).await?;
        let now = Utc::now();
        let row = NoteRow {
            content: content.to_string(),
            created_at: now,
            last_accessed_at: now,
        };
        let row_bytes = serde_json::to_vec(&row)?;
        let blob = vec_to_blob(&embedding);

        let id;
        {
            let tx = self.db.begin_write()?;
            {
                let mut meta = tx.open_table(META)?;
                id = meta.get("next_id")?.map(|v| v.value()).unwrap_or(1);
                meta.insert("next_id", id + 1)?;

                let mut rows = tx.open_table(ROWS)?;
                rows.insert(id, row_bytes.as_slice())?;
                let mut vecs = tx.open_table(VECS)?;
                vecs.insert(id, blob.as_slice())?;
            }
            tx.commit()?;
        }

        self.index
            .lock()
            .expect("episodic index lock poisoned")
            .insert(id, embedding)?;
        debug!(id, len = content.len(), "episodic note added");
        Ok(id)
    }

    /// Nearest notes to `query`, at most `k`, ordered by non-decreasing
    /// distance (ties on the lower id). Hits get their `last_accessed_at`
    /// refreshed in a single batch.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        if self.is_empty()? {
            return Ok(Vec::new());
        }
        let q = self.llm.embed(query).await?;
        let hits = self
            .index
            .lock()
            .expect("episodic index lock poisoned")
            .search(&q, k);
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut results = Vec::with_capacity(hits.len());
        {
            let tx = self.db.begin_write()?;
            {
                let mut rows = tx.open_table(ROWS)?;
                for (id, distance) in &hits {
                    let Some(existing) = rows.get(*id)?.map(|v| v.value().to_vec()) else {
                        continue;
                    };
                    let mut row: NoteRow = serde_json::from_slice(&existing)?;
                    results.push(SearchHit {
                        id: *id,
                        content: row.content.clone(),
                        distance: *distance,
                        created_at: row.created_at,
                    });
                    row.last_accessed_at = now;
                    rows.insert(*id, serde_json::to_vec(&row)?.as_slice())?;
                }
            }
            tx.commit()?;
        }

        Ok(results)
    }

    /// Delete notes by id from both the table and the index. Returns the
    /// number of rows actually removed.
    pub fn delete_by_ids(&self, ids: &[u64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut deleted = 0usize;
        {
            let tx = self.db.begin_write()?;
            {
                let mut rows = tx.open_table(ROWS)?;
                let mut vecs = tx.open_table(VECS)?;
                for id in ids {
                    if rows.remove(*id)?.is_some() {
                        deleted += 1;
                    }
                    vecs.remove(*id)?;
                }
            }
            tx.commit()?;
        }
        self.index
            .lock()
            .expect("episodic index lock poisoned")
            .remove(ids);
        debug!(deleted, "episodic notes deleted by id");
        Ok(deleted)
    }

    /// Delete every note whose content contains `substring`.
    pub fn delete_by_content(&self, substring: &str) -> Result<usize> {
        let ids = {
            let tx = self.db.begin_read()?;
            let rows = tx.open_table(ROWS)?;
            let mut matched = Vec::new();
            for entry in rows.iter()? {
                let (key, value) = entry?;
                let row: NoteRow = serde_json::from_slice(value.value())?;
                if row.content.contains(substring) {
                    matched.push(key.value());
                }
            }
            matched
        };
        self.delete_by_ids(&ids)
    }

    /// `(id, content)` for every note created within the last `days` days.
    pub fn get_documents_since(&self, days: i64) -> Result<Vec<(u64, String)>> {
        let cutoff = Utc::now() - Duration::days(days);
        let tx = self.db.begin_read()?;
        let rows = tx.open_table(ROWS)?;
        let mut out = Vec::new();
        for entry in rows.iter()? {
            let (key, value) = entry?;
            let row: NoteRow = serde_json::from_slice(value.value())?;
            if row.created_at >= cutoff {
                out.push((key.value(), row.content));
            }
        }
        Ok(out)
    }

    /// Bulk export of every note's text.
    pub fn get_all_document_texts(&self) -> Result<Vec<String>> {
        let tx = self.db.begin_read()?;
        let rows = tx.open_table(ROWS)?;
        let mut out = Vec::new();
        for entry in rows.iter()? {
            let (_, value) = entry?;
            let row: NoteRow = serde_json::from_slice(value.value())?;
            out.push(row.content);
        }
        Ok(out)
    }

    /// Row count (the index length always matches).
    pub fn len(&self) -> Result<usize> {
        Ok(self
            .index
            .lock()
            .expect("episodic index lock poisoned")
            .len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Ids currently held by the in-RAM index (for consistency checks).
    pub fn index_ids(&self) -> Vec<u64> {
        self.index
            .lock()
            .expect("episodic index lock poisoned")
            .ids()
    }

    /// Row ids currently persisted (for consistency checks).
    pub fn row_ids(&self) -> Result<Vec<u64>> {
        let tx = self.db.begin_read()?;
        let rows = tx.open_table(ROWS)?;
        let mut out = Vec::new();
        for entry in rows.iter()? {
            let (key, _) = entry?;
            out.push(key.value());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn store(dir: &tempfile::TempDir) -> VectorStore {
        VectorStore::open(dir.path().join("memory.redb"), testing::profiles(&[])).unwrap()
    }

    #[tokio::test]
    async fn add_then_search_returns_it_at_distance_zero() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);

        s.add("the capital of australia is canberra").await.unwrap();
        s.add("rust has a borrow checker").await.unwrap();

        let hits = s.search("the capital of australia is canberra", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "the capital of australia is canberra");
        assert!(hits[0].distance < 1e-6);
    }

    #[tokio::test]
    async fn empty_store_search_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        assert!(s.search("anything", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_returns_at_most_k_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        for text in ["alpha", "beta", "gamma", "delta"] {
            s.add(text).await.unwrap();
        }

        let hits = s.search("alpha", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[tokio::test]
    async fn index_and_rows_stay_one_to_one() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let a = s.add("one").await.unwrap();
        let _b = s.add("two").await.unwrap();
        s.delete_by_ids(&[a]).unwrap();

        let mut index_ids = s.index_ids();
        let mut row_ids = s.row_ids().unwrap();
        index_ids.sort_unstable();
        row_ids.sort_unstable();
        assert_eq!(index_ids, row_ids);
    }

    #[tokio::test]
    async fn delete_by_content_reports_count() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.add("note about ferris the crab").await.unwrap();
        s.add("note about oxidation").await.unwrap();
        s.add("unrelated").await.unwrap();

        assert_eq!(s.delete_by_content("note about").unwrap(), 2);
        assert_eq!(s.len().unwrap(), 1);
        assert_eq!(s.delete_by_content("nothing matches this").unwrap(), 0);
    }

    #[tokio::test]
    async fn index_rebuilds_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.redb");
        {
            let s = VectorStore::open(&path, testing::profiles(&[])).unwrap();
            s.add("persistent fact").await.unwrap();
        }

        let reopened = VectorStore::open(&path, testing::profiles(&[])).unwrap();
        assert_eq!(reopened.len().unwrap(), 1);
        let hits = reopened.search("persistent fact", 1).await.unwrap();
        assert_eq!(hits[0].content, "persistent fact");
    }

    #[tokio::test]
    async fn dimension_mismatch_refuses_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.redb");
        {
            let _ = VectorStore::open(&path, testing::profiles(&[])).unwrap();
        }

        // Reopen with a profile claiming a different dimension.
        let llm = testing::ScriptedLlm::new(&[]);
        let wrong = Arc::new(minerva_llm::LlmProfiles::new(
            llm.clone(),
            llm.clone(),
            llm,
            testing::TEST_DIM + 1,
        ));
        let err = VectorStore::open(&path, wrong).unwrap_err();
        assert!(err.downcast_ref::<DimensionMismatch>().is_some());
    }

    #[tokio::test]
    async fn get_documents_since_filters_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.add("fresh note").await.unwrap();
        let docs = s.get_documents_since(1).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].1, "fresh note");
    }
}
