//! Persistent ε-greedy contextual bandit.
//!
//! Each arm carries a running reward estimate and an exponentially smoothed
//! context-embedding centroid. Selection exploits
//! `q + β · cos(context, centroid)` unless exploration triggers. State is
//! rewritten to a JSON file on every update, via write-then-rename so a
//! crash mid-write cannot tear the file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cosine_similarity;

/// How an arm's q-value moves toward an observed reward.
#[derive(Debug, Clone, Copy)]
pub enum UpdateRule {
    /// `q += (r − q) / n` — the sample mean (tool policy).
    RunningAverage,
    /// `q = max(floor, q + α · (r − q))` — fixed learning rate with a lower
    /// bound (prompt policy).
    Fixed { alpha: f32, floor: f32 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArmState {
    pub q_value: f32,
    pub visit_count: u32,
    pub context_centroid: Option<Vec<f32>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    arms: HashMap<String, ArmState>,
}

pub struct BanditPolicy {
    path: PathBuf,
    epsilon: f32,
    beta: f32,
    centroid_alpha: f32,
    rule: UpdateRule,
    arms: HashMap<String, ArmState>,
}

impl BanditPolicy {
    /// Tool-selection profile: running-average q, centroid EMA α = 0.2.
    pub fn tool_policy(
        path: impl AsRef<Path>,
        arm_names: impl IntoIterator<Item = String>,
        epsilon: f32,
    ) -> Self {
        Self::new(path, arm_names, epsilon, 1.0, 0.2, UpdateRule::RunningAverage)
    }

    /// Prompt-selection profile: fixed α = 0.1 clamped at −1, centroid EMA
    /// α = 0.05.
    pub fn prompt_policy(
        path: impl AsRef<Path>,
        arm_names: impl IntoIterator<Item = String>,
        epsilon: f32,
    ) -> Self {
        Self::new(
            path,
            arm_names,
            epsilon,
            1.0,
            0.05,
            UpdateRule::Fixed {
                alpha: 0.1,
                floor: -1.0,
            },
        )
    }

    fn new(
        path: impl AsRef<Path>,
        arm_names: impl IntoIterator<Item = String>,
        epsilon: f32,
        beta: f32,
        centroid_alpha: f32,
        rule: UpdateRule,
    ) -> Self {
        let path = path.as_ref().to_path_buf();
        let arms = Self::load(&path);
        let mut policy = Self {
            path,
            epsilon,
            beta,
            centroid_alpha,
            rule,
            arms,
        };
        policy.ensure_arms(arm_names);
        policy
    }

    /// Load persisted state. Missing or corrupt files start empty.
    fn load(path: &Path) -> HashMap<String, ArmState> {
        match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<PersistedState>(&raw) {
                Ok(state) => state.arms,
                Err(err) => {
                    warn!(%err, path = %path.display(), "corrupt policy state, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        }
    }

    /// Register any unseen arms with zeroed state.
    pub fn ensure_arms(&mut self, names: impl IntoIterator<Item = String>) {
        for name in names {
            self.arms.entry(name).or_default();
        }
    }

    pub fn arm(&self, name: &str) -> Option<&ArmState> {
        self.arms.get(name)
    }

    pub fn arm_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.arms.keys().cloned().collect();
        names.sort();
        names
    }

    /// Pick an arm. With probability ε a uniform random arm; otherwise the
    /// arm maximising `q + β · cos(context, centroid)`. Without a context or
    /// before any centroid exists, falls back to the highest q-value.
    pub fn select(&self, context: Option<&[f32]>) -> Option<String> {
        if self.arms.is_empty() {
            return None;
        }
        let names: Vec<&String> = self.arms.keys().collect();

        let mut rng = rand::thread_rng();
        if rng.gen_range(0.0f32..1.0) < self.epsilon {
            return names.choose(&mut rng).map(|n| n.to_string());
        }

        let have_centroids = self.arms.values().any(|a| a.context_centroid.is_some());
        let context = match context {
            Some(ctx) if have_centroids => ctx,
            _ => {
                return self
                    .arms
                    .iter()
                    .max_by(|(an, a), (bn, b)| {
                        a.q_value.total_cmp(&b.q_value).then_with(|| bn.cmp(an))
                    })
                    .map(|(name, _)| name.clone());
            }
        };

        self.arms
            .iter()
            .map(|(name, arm)| {
                let sim = arm
                    .context_centroid
                    .as_deref()
                    .map(|c| cosine_similarity(context, c))
                    .unwrap_or(0.0);
                (name, arm.q_value + self.beta * sim)
            })
            .max_by(|(an, a), (bn, b)| a.total_cmp(b).then_with(|| bn.cmp(an)))
            .map(|(name, _)| name.clone())
    }

    /// Apply a reward to `arm` and fold the context into its centroid, then
    /// persist the whole state.
    pub fn update(&mut self, arm_name: &str, reward: f32, context: Option<&[f32]>) -> Result<()> {
        let centroid_alpha = self.centroid_alpha;
        let rule = self.rule;
        let arm = self.arms.entry(arm_name.to_string()).or_default();

        arm.visit_count += 1;
        match rule {
            UpdateRule::RunningAverage => {
                arm.q_value += (reward - arm.q_value) / arm.visit_count as f32;
            }
            UpdateRule::Fixed { alpha, floor } => {
                arm.q_value = (arm.q_value + alpha * (reward - arm.q_value)).max(floor);
            }
        }

        if let Some(ctx) = context {
            match &mut arm.context_centroid {
                Some(centroid) if centroid.len() == ctx.len() => {
                    for (c, x) in centroid.iter_mut().zip(ctx.iter()) {
                        *c = (1.0 - centroid_alpha) * *c + centroid_alpha * x;
                    }
                }
                _ => arm.context_centroid = Some(ctx.to_vec()),
            }
        }

        debug!(
            arm = arm_name,
            q = arm.q_value,
            visits = arm.visit_count,
            reward,
            "policy updated"
        );
        self.save()
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let state = PersistedState {
            arms: self.arms.clone(),
        };
        let rendered = serde_json::to_string_pretty(&state)?;

        // Write-then-rename guards against torn writes.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, rendered)
            .with_context(|| format!("writing policy state to {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming policy state into {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(dir: &tempfile::TempDir, epsilon: f32) -> BanditPolicy {
        BanditPolicy::tool_policy(
            dir.path().join("tool_policy.json"),
            ["alpha".to_string(), "beta".to_string()],
            epsilon,
        )
    }

    #[test]
    fn running_average_converges_to_reward_mean() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = policy(&dir, 0.0);

        p.update("alpha", 1.0, None).unwrap();
        p.update("alpha", 0.0, None).unwrap();
        let arm = p.arm("alpha").unwrap();
        assert_eq!(arm.visit_count, 2);
        assert!((arm.q_value - 0.5).abs() < 1e-6);
    }

    #[test]
    fn visit_count_is_monotonic_and_q_stays_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = policy(&dir, 0.0);

        let mut last_visits = 0;
        for reward in [-1.0f32, 1.0, -1.0, -1.0, 1.0, 0.0] {
            p.update("alpha", reward, None).unwrap();
            let arm = p.arm("alpha").unwrap();
            assert!(arm.visit_count > last_visits);
            last_visits = arm.visit_count;
            assert!(arm.q_value >= -1.0 && arm.q_value <= 1.0);
        }
    }

    #[test]
    fn prompt_rule_clamps_at_floor() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = BanditPolicy::prompt_policy(
            dir.path().join("prompt_policy.json"),
            ["default".to_string()],
            0.0,
        );
        for _ in 0..200 {
            p.update("default", -50.0, None).unwrap();
        }
        assert!(p.arm("default").unwrap().q_value >= -1.0);
    }

    #[test]
    fn exploit_picks_highest_q_without_context() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = policy(&dir, 0.0);
        p.update("alpha", 0.2, None).unwrap();
        p.update("beta", 0.9, None).unwrap();

        assert_eq!(p.select(None).as_deref(), Some("beta"));
    }

    #[test]
    fn context_similarity_can_flip_the_choice() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = policy(&dir, 0.0);
        // beta has the higher q but its centroid points away from the query;
        // alpha's centroid matches the query exactly.
        p.update("alpha", 0.2, Some(&[1.0, 0.0])).unwrap();
        p.update("beta", 0.5, Some(&[0.0, 1.0])).unwrap();

        assert_eq!(p.select(Some(&[1.0, 0.0])).as_deref(), Some("alpha"));
    }

    #[test]
    fn epsilon_one_always_explores() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = policy(&dir, 1.0);
        p.update("alpha", 1.0, None).unwrap();

        // With ε = 1 both arms must show up over enough draws.
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(p.select(None).unwrap());
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn centroid_moves_toward_new_context() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = policy(&dir, 0.0);
        p.update("alpha", 0.5, Some(&[1.0, 0.0])).unwrap();
        p.update("alpha", 0.5, Some(&[0.0, 1.0])).unwrap();

        let centroid = p.arm("alpha").unwrap().context_centroid.clone().unwrap();
        assert!((centroid[0] - 0.8).abs() < 1e-6);
        assert!((centroid[1] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn state_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut p = policy(&dir, 0.0);
            p.update("alpha", 0.7, Some(&[0.5, 0.5])).unwrap();
        }
        let reloaded = policy(&dir, 0.0);
        let arm = reloaded.arm("alpha").unwrap();
        assert_eq!(arm.visit_count, 1);
        assert!((arm.q_value - 0.7).abs() < 1e-6);
        assert!(arm.context_centroid.is_some());
    }

    #[test]
    fn corrupt_state_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool_policy.json");
        std::fs::write(&path, "{not json").unwrap();

        let p = BanditPolicy::tool_policy(&path, ["alpha".to_string()], 0.0);
        assert_eq!(p.arm("alpha").unwrap().visit_count, 0);
    }

    #[test]
    fn empty_policy_selects_none() {
        let dir = tempfile::tempdir().unwrap();
        let p = BanditPolicy::tool_policy(dir.path().join("p.json"), [], 0.0);
        assert!(p.select(None).is_none());
    }
}
