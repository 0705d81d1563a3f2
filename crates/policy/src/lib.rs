//! Learned action selection: a persistent ε-greedy contextual bandit (one
//! instance for tools, one for prompt templates) and the reward shaper that
//! feeds it.

pub mod bandit;
pub mod reward;

pub use bandit::{ArmState, BanditPolicy, UpdateRule};
pub use reward::{Feedback, RewardShaper};

/// Cosine similarity used for centroid scoring. Zero on degenerate input.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
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
