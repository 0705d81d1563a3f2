//! Triplet knowledge graph over redb.
//!
//! Uniqueness on `(subject, relation, object)` is enforced by the table key;
//! re-inserting an existing triplet is silently ignored, preserving the
//! earliest `created_at`.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use minerva_llm::LlmProfiles;

/// `subject \x1F relation \x1F object → json(TripletMeta)`.
const TRIPLETS: TableDefinition<&str, &[u8]> = TableDefinition::new("triplets");

const FIELD_SEP: char = '\u{1F}';

#[derive(Debug, Serialize, Deserialize)]
struct TripletMeta {
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    last_accessed_at: DateTime<Utc>,
}

/// A `(subject, relation, object)` candidate for insertion, typically
/// produced by the LLM extractor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TripletCandidate {
    pub subject: String,
    pub relation: String,
    pub object: String,
}

/// A stored triplet with its timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Triplet {
    pub subject: String,
    pub relation: String,
    pub object: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

pub struct KnowledgeGraph {
    db: Database,
    llm: Arc<LlmProfiles>,
}

impl KnowledgeGraph {
    pub fn open(path: impl AsRef<Path>, llm: Arc<LlmProfiles>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)
            .with_context(|| format!("opening knowledge graph at {}", path.display()))?;
        {
            let tx = db.begin_write()?;
            tx.open_table(TRIPLETS)?;
            tx.commit()?;
        }
        Ok(Self { db, llm })
    }

    /// Bulk insert. Existing `(s, r, o)` keys are left untouched. Returns the
    /// number of rows actually inserted.
    pub fn add_triplets(&self, candidates: &[TripletCandidate]) -> Result<usize> {
        if candidates.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let meta_bytes = serde_json::to_vec(&TripletMeta {
            created_at: now,
            last_accessed_at: now,
        })?;

        let mut inserted = 0usize;
        {
            let tx = self.db.begin_write()?;
            {
                let mut table = tx.open_table(TRIPLETS)?;
                for c in candidates {
                    if c.subject.is_empty() || c.relation.is_empty() || c.object.is_empty() {
                        continue;
                    }
                    let key = triplet_key(&c.subject, &c.relation, &c.object);
                    if table.get(key.as_str())?.is_some() {
                        continue;
                    }
                    table.insert(key.as_str(), meta_bytes.as_slice())?;
                    inserted += 1;
                }
            }
            tx.commit()?;
        }
        debug!(inserted, offered = candidates.len(), "triplets added");
        Ok(inserted)
    }

    /// Every triplet whose subject OR object contains `keyword`
    /// (case-insensitive). Returned rows get `last_accessed_at` refreshed.
    pub fn query(&self, keyword: &str) -> Result<Vec<Triplet>> {
        let needle = keyword.to_lowercase();
        let mut matched: Vec<(String, Triplet)> = Vec::new();
        {
            let tx = self.db.begin_read()?;
            let table = tx.open_table(TRIPLETS)?;
            for entry in table.iter()? {
                let (key, value) = entry?;
                let key_str = key.value().to_string();
                let Some((subject, relation, object)) = split_key(&key_str) else {
                    continue;
                };
                if subject.to_lowercase().contains(&needle)
                    || object.to_lowercase().contains(&needle)
                {
                    let meta: TripletMeta = serde_json::from_slice(value.value())?;
                    matched.push((
                        key_str.clone(),
                        Triplet {
                            subject: subject.to_string(),
                            relation: relation.to_string(),
                            object: object.to_string(),
                            created_at: meta.created_at,
                            last_accessed_at: meta.last_accessed_at,
                        },
                    ));
                }
            }
        }

        if !matched.is_empty() {
            let now = Utc::now();
            let tx = self.db.begin_write()?;
            {
                let mut table = tx.open_table(TRIPLETS)?;
                for (key, triplet) in &matched {
                    let meta_bytes = serde_json::to_vec(&TripletMeta {
                        created_at: triplet.created_at,
                        last_accessed_at: now,
                    })?;
                    table.insert(key.as_str(), meta_bytes.as_slice())?;
                }
            }
            tx.commit()?;
        }

        Ok(matched.into_iter().map(|(_, t)| t).collect())
    }

    /// Ask the LLM for 1–2 keywords from `prompt`, union their query results,
    /// and render as `- subject relation object.` lines. Failures degrade to
    /// an empty string.
    pub async fn query_as_text(&self, prompt: &str) -> String {
        let keyword_prompt = format!(
            "Extract the 1-2 most important keywords or entity names from the text below. \
             Reply with only the keywords, comma-separated.\nText: '{prompt}'"
        );
        let keywords_raw = match self.llm.complete(&keyword_prompt, 32).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(%err, "keyword extraction failed");
                return String::new();
            }
        };
        let keywords: Vec<String> = keywords_raw
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .take(2)
            .collect();
        if keywords.is_empty() {
            return String::new();
        }

        let mut lines = BTreeSet::new();
        for keyword in &keywords {
            match self.query(keyword) {
                Ok(triplets) => {
                    for t in triplets {
                        lines.insert(format!("- {} {} {}.", t.subject, t.relation, t.object));
                    }
                }
                Err(err) => warn!(%err, keyword, "knowledge graph query failed"),
            }
        }
        lines.into_iter().collect::<Vec<_>>().join("\n")
    }

    /// Total number of stored triplets.
    pub fn len(&self) -> Result<usize> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(TRIPLETS)?;
        let mut count = 0usize;
        for entry in table.iter()? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn triplet_key(subject: &str, relation: &str, object: &str) -> String {
    format!("{subject}{FIELD_SEP}{relation}{FIELD_SEP}{object}")
}

fn split_key(key: &str) -> Option<(&str, &str, &str)> {
    let mut parts = key.splitn(3, FIELD_SEP);
    Some((parts.next()?, parts.next()?, parts.next()?))
}
