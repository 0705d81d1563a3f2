//! Intent detection: a regex fast path for bare greetings, then embedding
//! similarity against per-intent example utterances.

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use tokio::sync::OnceCell;
use tracing::warn;

use minerva_llm::LlmProfiles;
use minerva_memory::cosine_similarity;

/// Which top-level strategy handles the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Planner,
    Reactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentSource {
    Regex,
    Embedding,
    Default,
}

#[derive(Debug, Clone)]
pub struct IntentInfo {
    pub intent: String,
    pub strategy: Strategy,
    pub confidence: f32,
    pub source: IntentSource,
}

/// One labelled example utterance.
#[derive(Debug, Clone)]
pub struct IntentExample {
    pub intent: &'static str,
    pub strategy: Strategy,
    pub example: &'static str,
}

/// Matches above this cosine similarity are trusted; anything below falls to
/// the default reactive strategy.
const CONFIDENCE_THRESHOLD: f32 = 0.70;

fn greeting_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^\s*(hi|hello|hey|good morning|good evening|merhaba|selam|naber|nasılsın|günaydın)\s*$")
            .unwrap()
    })
}

/// The built-in example set. Multi-step and research goals route to the
/// planner; conversational goals stay reactive.
fn builtin_examples() -> Vec<IntentExample> {
    let table: &[(&str, Strategy, &str)] = &[
        ("chat", Strategy::Reactive, "how are you doing today"),
        ("chat", Strategy::Reactive, "tell me something interesting"),
        ("question", Strategy::Reactive, "what is the capital of france"),
        ("question", Strategy::Reactive, "explain how tcp handshakes work"),
        (
            "research",
            Strategy::Planner,
            "research the latest developments in quantum computing and summarize them",
        ),
        (
            "research",
            Strategy::Planner,
            "find information about electric cars and write a report",
        ),
        (
            "multi_step_task",
            Strategy::Planner,
            "search for rust web frameworks and save the comparison to a file",
        ),
        (
            "multi_step_task",
            Strategy::Planner,
            "collect the quarterly numbers and then analyze the trend",
        ),
    ];
    table
        .iter()
        .map(|(intent, strategy, example)| IntentExample {
            intent,
            strategy: *strategy,
            example,
        })
        .collect()
}

pub struct IntentDetector {
    llm: Arc<LlmProfiles>,
    examples: Vec<IntentExample>,
    /// `(intent, strategy, embedding)` per example, computed once.
    embedded: OnceCell<Vec<(&'static str, Strategy, Vec<f32>)>>,
}

impl IntentDetector {
    pub fn new(llm: Arc<LlmProfiles>, examples: Vec<IntentExample>) -> Self {
        Self {
            llm,
            examples,
            embedded: OnceCell::new(),
        }
    }

    pub fn builtin(llm: Arc<LlmProfiles>) -> Self {
        Self::new(llm, builtin_examples())
    }

    async fn example_embeddings(&self) -> &[(&'static str, Strategy, Vec<f32>)] {
        self.embedded
            .get_or_init(|| async {
                let mut out = Vec::with_capacity(self.examples.len());
                for example in &self.examples {
                    match self.llm.embed(example.example).await {
                        Ok(embedding) => out.push((example.intent, example.strategy, embedding)),
                        Err(err) => warn!(%err, example = example.example, "intent example embedding failed"),
                    }
                }
                out
            })
            .await
    }

    /// Classify `input`. Never fails: embedding errors degrade to the default
    /// reactive strategy.
    pub async fn detect(&self, input: &str) -> IntentInfo {
        if greeting_pattern().is_match(input) {
            return IntentInfo {
                intent: "chat".to_string(),
                strategy: Strategy::Reactive,
                confidence: 0.95,
                source: IntentSource::Regex,
            };
        }

        let examples = self.example_embeddings().await;
        if examples.is_empty() {
            return IntentInfo {
                intent: "unknown".to_string(),
                strategy: Strategy::Reactive,
                confidence: 0.1,
                source: IntentSource::Default,
            };
        }

        let query = match self.llm.embed(input).await {
            Ok(embedding) => embedding,
            Err(err) => {
                warn!(%err, "intent embedding failed");
                return IntentInfo {
                    intent: "unknown".to_string(),
                    strategy: Strategy::Reactive,
                    confidence: 0.3,
                    source: IntentSource::Default,
                };
            }
        };

        let mut best: Option<(&str, Strategy, f32)> = None;
        for (intent, strategy, embedding) in examples {
            let score = cosine_similarity(&query, embedding);
            if best.map(|(_, _, b)| score > b).unwrap_or(true) {
                best = Some((intent, *strategy, score));
            }
        }

        match best {
            Some((intent, strategy, score)) if score > CONFIDENCE_THRESHOLD => IntentInfo {
                intent: intent.to_string(),
                strategy,
                confidence: score,
                source: IntentSource::Embedding,
            },
            _ => IntentInfo {
                intent: "unknown".to_string(),
                strategy: Strategy::Reactive,
                confidence: 0.3,
                source: IntentSource::Default,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[tokio::test]
    async fn bare_greetings_take_the_regex_path() {
        let detector = IntentDetector::new(testing::pattern_llm(&[]).1, Vec::new());
        for greeting in ["hi", "  hello ", "merhaba", "Günaydın"] {
            let info = detector.detect(greeting).await;
            assert_eq!(info.source, IntentSource::Regex, "greeting: {greeting}");
            assert_eq!(info.intent, "chat");
            assert_eq!(info.strategy, Strategy::Reactive);
        }
    }

    #[tokio::test]
    async fn greeting_inside_a_sentence_is_not_fast_pathed() {
        let detector = IntentDetector::new(testing::pattern_llm(&[]).1, Vec::new());
        let info = detector.detect("hello, please research rust for me").await;
        assert_ne!(info.source, IntentSource::Regex);
    }

    #[tokio::test]
    async fn no_examples_fall_back_to_reactive_default() {
        let detector = IntentDetector::new(testing::pattern_llm(&[]).1, Vec::new());
        let info = detector.detect("do something complicated").await;
        assert_eq!(info.source, IntentSource::Default);
        assert_eq!(info.strategy, Strategy::Reactive);
    }

    #[tokio::test]
    async fn exact_example_match_selects_its_strategy() {
        let examples = vec![IntentExample {
            intent: "research",
            strategy: Strategy::Planner,
            example: "research rust frameworks",
        }];
        let detector = IntentDetector::new(testing::pattern_llm(&[]).1, examples);

        // Identical text embeds identically, so similarity is 1.0.
        let info = detector.detect("research rust frameworks").await;
        assert_eq!(info.source, IntentSource::Embedding);
        assert_eq!(info.strategy, Strategy::Planner);
        assert!(info.confidence > CONFIDENCE_THRESHOLD);
    }
}
