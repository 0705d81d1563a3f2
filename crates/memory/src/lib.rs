//! The dual memory substrate: vector-indexed episodic memory, a triplet
//! knowledge graph, a persona trait store, and a topic-tagged personal store.
//!
//! Every store is internally thread-safe and shared by `Arc`. Durable state
//! lives in [`redb`] tables or JSON files; embeddings persist as raw
//! little-endian `f32` blobs of exactly `D * 4` bytes.

pub mod consolidate;
pub mod episodic;
pub mod extractor;
pub mod flat_index;
pub mod graph;
pub mod persona;
pub mod personal;

pub use consolidate::{ConsolidationReport, consolidate};
pub use episodic::{DimensionMismatch, SearchHit, VectorStore};
pub use extractor::extract_triplets;
pub use flat_index::FlatIndex;
pub use graph::{KnowledgeGraph, Triplet, TripletCandidate};
pub use persona::{PersonaStore, PersonaTrait, TraitOutcome};
pub use personal::{PersonalNote, PersonalVectorStore};

/// Cosine similarity between two equal-length vectors. Zero-magnitude or
/// length-mismatched inputs score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

/// Serialise an embedding as a little-endian `f32` blob.
pub(crate) fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Deserialise a little-endian `f32` blob back into an embedding.
pub(crate) fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
