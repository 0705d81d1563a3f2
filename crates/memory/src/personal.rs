//! Topic-tagged personal notes: a JSON metadata file, a sidecar embedding
//! file, an in-RAM flat index, and a persisted research queue.
//!
//! Every `add` appends `"[topic] text\n"` to the research queue unless the
//! caller opts out — the proactive assistant sets `skip_queue` when writing
//! back results it has already consumed, so topics do not re-enqueue.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use minerva_llm::LlmProfiles;

use crate::flat_index::FlatIndex;
use crate::{blob_to_vec, vec_to_blob};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalNote {
    pub id: Uuid,
    pub text: String,
    pub topic: String,
    #[serde(default)]
    pub extra: serde_json::Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

struct Inner {
    notes: Vec<PersonalNote>,
    /// Embeddings aligned with `notes` by position; index ids are ordinals.
    vectors: Vec<Vec<f32>>,
    index: FlatIndex,
}

impl Inner {
    fn rebuild_index(&mut self, dim: usize) {
        let mut index = FlatIndex::new(dim);
        for (ordinal, vector) in self.vectors.iter().enumerate() {
            let _ = index.insert(ordinal as u64, vector.clone());
        }
        self.index = index;
    }
}

pub struct PersonalVectorStore {
    meta_path: PathBuf,
    vectors_path: PathBuf,
    queue_path: PathBuf,
    llm: Arc<LlmProfiles>,
    inner: Mutex<Inner>,
}

impl PersonalVectorStore {
    /// Open the store rooted at `dir`. The metadata file is authoritative; a
    /// missing or misaligned embedding file triggers a full re-embed.
    pub async fn open(dir: impl AsRef<Path>, llm: Arc<LlmProfiles>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let store = Self {
            meta_path: dir.join("meta.json"),
            vectors_path: dir.join("index.bin"),
            queue_path: dir.join("research_queue.txt"),
            llm,
            inner: Mutex::new(Inner {
                notes: Vec::new(),
                vectors: Vec::new(),
                index: FlatIndex::new(0),
            }),
        };

        let notes: Vec<PersonalNote> = match fs::read_to_string(&store.meta_path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", store.meta_path.display()))?,
            Err(_) => Vec::new(),
        };
        let vectors = store.load_vectors(notes.len());

        {
            let mut inner = store.inner.lock().expect("personal store lock poisoned");
            inner.notes = notes;
            inner.vectors = vectors;
        }

        let dim = store.llm.dim();
        let aligned = {
            let inner = store.inner.lock().expect("personal store lock poisoned");
            inner.vectors.len() == inner.notes.len()
                && inner.vectors.iter().all(|v| v.len() == dim)
        };
        if aligned {
            let mut inner = store.inner.lock().expect("personal store lock poisoned");
            inner.rebuild_index(dim);
            info!(notes = inner.notes.len(), "personal store loaded");
        } else {
            let rebuilt = store.rebuild_from_meta().await?;
            info!(notes = rebuilt, "personal store re-embedded from metadata");
        }

        Ok(store)
    }

    fn load_vectors(&self, expected: usize) -> Vec<Vec<f32>> {
        let Ok(raw) = fs::read(&self.vectors_path) else {
            return Vec::new();
        };
        if raw.len() < 4 {
            return Vec::new();
        }
        let dim = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        if dim == 0 {
            return Vec::new();
        }
        let body = &raw[4..];
        let stride = dim * 4;
        if body.len() != expected * stride {
            return Vec::new();
        }
        body.chunks_exact(stride).map(blob_to_vec).collect()
    }

    fn save(&self, inner: &Inner) -> Result<()> {
        let rendered = serde_json::to_string_pretty(&inner.notes)?;
        fs::write(&self.meta_path, rendered)?;

        let dim = self.llm.dim() as u32;
        let mut blob = dim.to_le_bytes().to_vec();
        for vector in &inner.vectors {
            blob.extend_from_slice(&vec_to_blob(vector));
        }
        fs::write(&self.vectors_path, blob)?;
        Ok(())
    }

    /// Add a note. Appends to the research queue unless `skip_queue`.
    pub async fn add(
        &self,
        text: &str,
        topic: &str,
        extra: serde_json::Map<String, Value>,
        skip_queue: bool,
    ) -> Result<Uuid> {
        let text = text.trim();
        if text.is_empty() {
            bail!("note text cannot be empty");
        }

        let embedding = self.llm.embed(text).await?;
        let now = Utc::now();
        let note = PersonalNote {
            id: Uuid::new_v4(),
            text: text.to_string(),
            topic: topic.to_string(),
            extra,
            created_at: now,
            last_accessed_at: now,
        };
        let id = note.id;

        {
            let mut inner = self.inner.lock().expect("personal store lock poisoned");
            let ordinal = inner.notes.len() as u64;
            inner.notes.push(note);
            inner.vectors.push(embedding.clone());
            if inner.index.dim() != self.llm.dim() {
                inner.rebuild_index(self.llm.dim());
            } else {
                inner.index.insert(ordinal, embedding)?;
            }
            self.save(&inner)?;
        }

        if !skip_queue {
            if let Err(err) = self.enqueue_research(topic, text) {
                warn!(%err, "failed to append to research queue");
            }
        }
        debug!(%id, topic, "personal note added");
        Ok(id)
    }

    fn enqueue_research(&self, topic: &str, text: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.queue_path)?;
        writeln!(file, "[{topic}] {text}")?;
        Ok(())
    }

    /// Read and truncate the research queue. Lines are `[topic] text`.
    pub fn drain_research_queue(&self) -> Result<Vec<(String, String)>> {
        let raw = match fs::read_to_string(&self.queue_path) {
            Ok(raw) => raw,
            Err(_) => return Ok(Vec::new()),
        };
        let mut entries = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                if let Some((topic, text)) = rest.split_once(']') {
                    entries.push((topic.to_string(), text.trim().to_string()));
                    continue;
                }
            }
            entries.push(("general".to_string(), line.to_string()));
        }
        fs::write(&self.queue_path, "")?;
        Ok(entries)
    }

    /// Nearest notes to `query`, optionally filtered by topic. A topic filter
    /// widens the candidate pool (k * 5) before filtering so the filter does
    /// not starve results.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        topic_filter: Option<&str>,
    ) -> Result<Vec<(PersonalNote, f32)>> {
        {
            let inner = self.inner.lock().expect("personal store lock poisoned");
            if inner.notes.is_empty() {
                return Ok(Vec::new());
            }
        }
        let q = self.llm.embed(query).await?;

        let mut inner = self.inner.lock().expect("personal store lock poisoned");
        let pool = if topic_filter.is_some() { k * 5 } else { k };
        let hits = inner.index.search(&q, pool.min(inner.notes.len()));

        let now = Utc::now();
        let mut results = Vec::new();
        let mut touched = false;
        for (ordinal, distance) in hits {
            let Some(note) = inner.notes.get_mut(ordinal as usize) else {
                continue;
            };
            if let Some(topic) = topic_filter {
                if note.topic != topic {
                    continue;
                }
            }
            note.last_accessed_at = now;
            touched = true;
            results.push((note.clone(), distance));
            if results.len() == k {
                break;
            }
        }
        if touched {
            self.save(&inner)?;
        }
        Ok(results)
    }

    /// Sorted unique topics.
    pub fn topics(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("personal store lock poisoned");
        let mut topics: Vec<String> = inner.notes.iter().map(|n| n.topic.clone()).collect();
        topics.sort();
        topics.dedup();
        topics
    }

    pub fn notes_by_topic(&self, topic: &str) -> Vec<PersonalNote> {
        let inner = self.inner.lock().expect("personal store lock poisoned");
        inner
            .notes
            .iter()
            .filter(|n| n.topic == topic)
            .cloned()
            .collect()
    }

    /// Delete every note under `topic`. Returns whether anything was removed.
    pub fn delete_by_topic(&self, topic: &str) -> Result<bool> {
        self.delete_where(|note| note.topic == topic)
    }

    /// Delete one note by id. Returns whether it existed.
    pub fn delete_by_id(&self, id: Uuid) -> Result<bool> {
        self.delete_where(|note| note.id == id)
    }

    fn delete_where(&self, predicate: impl Fn(&PersonalNote) -> bool) -> Result<bool> {
        let mut inner = self.inner.lock().expect("personal store lock poisoned");
        let before = inner.notes.len();

        let old_notes = std::mem::take(&mut inner.notes);
        let old_vectors = std::mem::take(&mut inner.vectors);
        let mut notes = Vec::with_capacity(before);
        let mut vectors = Vec::with_capacity(before);
        for (note, vector) in old_notes.into_iter().zip(old_vectors) {
            if !predicate(&note) {
                notes.push(note);
                vectors.push(vector);
            }
        }
        inner.notes = notes;
        inner.vectors = vectors;

        let removed = inner.notes.len() < before;
        if removed {
            inner.rebuild_index(self.llm.dim());
            self.save(&inner)?;
        }
        Ok(removed)
    }

    /// Re-embed every note from the metadata file. Used when `meta.json` has
    /// been edited out-of-band. Returns the note count.
    pub async fn rebuild_from_meta(&self) -> Result<usize> {
        let notes: Vec<PersonalNote> = match fs::read_to_string(&self.meta_path) {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(_) => Vec::new(),
        };

        let mut vectors = Vec::with_capacity(notes.len());
        for note in &notes {
            vectors.push(self.llm.embed(&note.text).await?);
        }

        let mut inner = self.inner.lock().expect("personal store lock poisoned");
        inner.notes = notes;
        inner.vectors = vectors;
        inner.rebuild_index(self.llm.dim());
        self.save(&inner)?;
        Ok(inner.notes.len())
    }

    pub fn get_all_document_texts(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("personal store lock poisoned");
        inner.notes.iter().map(|n| n.text.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("personal store lock poisoned")
            .notes
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
