//! Scalar reward shaping from turn-level signals: user feedback, latency,
//! tool errors, retry count and (disabled by default) text sentiment.

use std::time::Duration;

/// Explicit user feedback on a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    ThumbsUp,
    ThumbsDown,
    None,
}

/// Combines sub-signals into one scalar with fixed weights. Feedback
/// dominates, errors are punished hard, latency is a mild nudge, and
/// sentiment is computed but weighted to zero.
#[derive(Debug, Clone)]
pub struct RewardShaper {
    pub w_feedback: f32,
    pub w_error: f32,
    pub w_retry: f32,
    pub w_latency: f32,
    pub w_sentiment: f32,
}

impl Default for RewardShaper {
    fn default() -> Self {
        Self {
            w_feedback: 2.0,
            w_error: 1.5,
            w_retry: 1.0,
            w_latency: 0.5,
            w_sentiment: 0.0,
        }
    }
}

const POSITIVE_WORDS: &[&str] = &["good", "great", "thanks", "success", "perfect", "👍"];
const NEGATIVE_WORDS: &[&str] = &["bad", "error", "failed", "wrong", "crash", "👎"];

impl RewardShaper {
    pub fn from_feedback(&self, feedback: Feedback) -> f32 {
        match feedback {
            Feedback::ThumbsUp => 1.0,
            Feedback::ThumbsDown => -1.0,
            Feedback::None => 0.0,
        }
    }

    /// Under 5 s is rewarded, under 15 s is neutral, anything slower is
    /// penalised.
    pub fn from_latency(&self, elapsed: Duration) -> f32 {
        let secs = elapsed.as_secs_f32();
        if secs < 5.0 {
            0.5
        } else if secs < 15.0 {
            0.0
        } else {
            -0.5
        }
    }

    pub fn from_error(&self, error: Option<&str>) -> f32 {
        match error {
            Some(_) => -1.0,
            None => 0.0,
        }
    }

    /// `1 − 2·min(retries/max, 1)`: zero retries → +1, the full budget → −1.
    pub fn from_retries(&self, retries: u32, max_retries: u32) -> f32 {
        if retries == 0 {
            return 1.0;
        }
        let penalty = (retries as f32 / max_retries.max(1) as f32).min(1.0);
        1.0 - 2.0 * penalty
    }

    /// Keyword sentiment in `[-0.5, 0.5]`. Carried for completeness; its
    /// weight defaults to zero.
    pub fn from_sentiment(&self, text: &str) -> f32 {
        let lower = text.to_lowercase();
        let mut score = 0.0f32;
        for word in POSITIVE_WORDS {
            if lower.contains(word) {
                score += 0.5;
            }
        }
        for word in NEGATIVE_WORDS {
            if lower.contains(word) {
                score -= 0.5;
            }
        }
        score.clamp(-0.5, 0.5)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn total_reward(
        &self,
        feedback: Feedback,
        elapsed: Duration,
        error: Option<&str>,
        user_text: &str,
        retries: u32,
        max_retries: u32,
    ) -> f32 {
        self.from_feedback(feedback) * self.w_feedback
            + self.from_latency(elapsed) * self.w_latency
            + self.from_error(error) * self.w_error
            + self.from_retries(retries, max_retries) * self.w_retry
            + self.from_sentiment(user_text) * self.w_sentiment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shaper() -> RewardShaper {
        RewardShaper::default()
    }

    #[test]
    fn latency_brackets() {
        let s = shaper();
        assert_eq!(s.from_latency(Duration::from_secs(2)), 0.5);
        assert_eq!(s.from_latency(Duration::from_secs(10)), 0.0);
        assert_eq!(s.from_latency(Duration::from_secs(30)), -0.5);
    }

    #[test]
    fn retry_rule_endpoints() {
        let s = shaper();
        assert_eq!(s.from_retries(0, 3), 1.0);
        assert_eq!(s.from_retries(3, 3), -1.0);
        assert_eq!(s.from_retries(6, 3), -1.0); // clamped
        assert!((s.from_retries(1, 3) - (1.0 - 2.0 / 3.0)).abs() < 1e-6);
    }

    #[test]
    fn sentiment_is_clamped_and_weightless_by_default() {
        let s = shaper();
        assert_eq!(s.from_sentiment("great success thanks"), 0.5);
        assert_eq!(s.from_sentiment("bad error crash"), -0.5);
        assert_eq!(s.w_sentiment, 0.0);
    }

    #[test]
    fn successful_fast_turn_scores_high() {
        let s = shaper();
        let total = s.total_reward(
            Feedback::ThumbsUp,
            Duration::from_secs(2),
            None,
            "thanks",
            0,
            3,
        );
        // 1*2 + 0.5*0.5 + 0*1.5 + 1*1 = 3.25
        assert!((total - 3.25).abs() < 1e-6);
    }

    #[test]
    fn failing_slow_turn_scores_low() {
        let s = shaper();
        let total = s.total_reward(
            Feedback::ThumbsDown,
            Duration::from_secs(30),
            Some("boom"),
            "",
            3,
            3,
        );
        // -1*2 + -0.5*0.5 + -1*1.5 + -1*1 = -4.75
        assert!((total + 4.75).abs() < 1e-6);
    }
}
