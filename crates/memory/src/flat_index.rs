//! Exact in-RAM nearest-neighbour index over fixed-dimension embeddings.
//!
//! A flat id-mapped index: every entry is `(id, vector)` and search is a full
//! scan by squared Euclidean distance. Exact-match inserts therefore come
//! back at distance 0, and deletions are O(n) with no index degradation,
//! which is what the write-through stores need.

use anyhow::{Result, bail};

#[derive(Debug)]
pub struct FlatIndex {
    dim: usize,
    entries: Vec<(u64, Vec<f32>)>,
}

impl FlatIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            entries: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All ids currently present, in insertion order.
    pub fn ids(&self) -> Vec<u64> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    pub fn insert(&mut self, id: u64, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dim {
            bail!(
                "vector dimension {} does not match index dimension {}",
                vector.len(),
                self.dim
            );
        }
        self.entries.push((id, vector));
        Ok(())
    }

    /// Remove every entry whose id is in `ids`. Returns the removed count.
    pub fn remove(&mut self, ids: &[u64]) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(id, _)| !ids.contains(id));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Top-`k` nearest entries by squared L2 distance, ordered by
    /// non-decreasing distance. Equal distances tie-break on the lower id.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(u64, f32)> {
        if query.len() != self.dim || k == 0 {
            return Vec::new();
        }

        let mut scored: Vec<(u64, f32)> = self
            .entries
            .iter()
            .map(|(id, v)| (*id, squared_l2(query, v)))
            .collect();
        scored.sort_by(|(a_id, a_d), (b_id, b_d)| {
            a_d.total_cmp(b_d).then_with(|| a_id.cmp(b_id))
        });
        scored.truncate(k);
        scored
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_index_returns_nothing() {
        let index = FlatIndex::new(3);
        assert!(index.search(&[0.0, 0.0, 0.0], 5).is_empty());
    }

    #[test]
    fn exact_match_has_distance_zero() {
        let mut index = FlatIndex::new(3);
        index.insert(1, vec![0.1, 0.2, 0.3]).unwrap();
        index.insert(2, vec![0.9, 0.8, 0.7]).unwrap();

        let hits = index.search(&[0.1, 0.2, 0.3], 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 1);
        assert!(hits[0].1 < 1e-9);
    }

    #[test]
    fn results_are_ordered_by_distance() {
        let mut index = FlatIndex::new(2);
        index.insert(1, vec![0.0, 0.0]).unwrap();
        index.insert(2, vec![1.0, 0.0]).unwrap();
        index.insert(3, vec![2.0, 0.0]).unwrap();

        let hits = index.search(&[0.1, 0.0], 3);
        let ids: Vec<u64> = hits.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(hits.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn equal_distances_tie_break_on_lower_id() {
        let mut index = FlatIndex::new(2);
        index.insert(7, vec![1.0, 0.0]).unwrap();
        index.insert(3, vec![-1.0, 0.0]).unwrap();

        let hits = index.search(&[0.0, 0.0], 2);
        assert_eq!(hits[0].0, 3);
        assert_eq!(hits[1].0, 7);
    }

    #[test]
    fn search_returns_at_most_k() {
        let mut index = FlatIndex::new(1);
        for id in 0..10 {
            index.insert(id, vec![id as f32]).unwrap();
        }
        assert_eq!(index.search(&[0.0], 4).len(), 4);
    }

    #[test]
    fn remove_drops_only_named_ids() {
        let mut index = FlatIndex::new(1);
        for id in 0..5 {
            index.insert(id, vec![id as f32]).unwrap();
        }
        assert_eq!(index.remove(&[1, 3, 99]), 2);
        assert_eq!(index.len(), 3);
        assert_eq!(index.ids(), vec![0, 2, 4]);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut index = FlatIndex::new(3);
        assert!(index.insert(1, vec![0.0, 0.0]).is_err());
    }
}
