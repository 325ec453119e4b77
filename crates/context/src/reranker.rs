//! Candidate reranking
//!
//! Scores `(query, content)` pairs with a cross-encoder on the blocking pool
//! and keeps the best `top_n`. Any scoring failure fails open: the first
//! `top_n` candidates are returned in their original order.

use ragforge_common::errors::{AppError, Result};
use ragforge_common::metrics;
use ragforge_common::models::RetrievalCandidate;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Synchronous relevance scorer
///
/// Implementations may be CPU-heavy; [`Reranker`] always calls them from
/// `spawn_blocking`.
pub trait CrossEncoder: Send + Sync {
    /// Relevance of `text` to `query`, higher is better
    fn score(&self, query: &str, text: &str) -> Result<f32>;

    /// Score many pairs at once
    fn score_pairs(&self, pairs: &[(String, String)]) -> Result<Vec<f32>> {
        pairs.iter().map(|(q, t)| self.score(q, t)).collect()
    }

    fn name(&self) -> &str;
}

/// Jaccard overlap of significant words
///
/// A lexical stand-in for a trained cross-encoder.
#[derive(Debug, Clone, Copy)]
pub struct LexicalOverlapScorer {
    min_word_len: usize,
}

impl Default for LexicalOverlapScorer {
    fn default() -> Self {
        Self { min_word_len: 3 }
    }
}

impl LexicalOverlapScorer {
    pub fn new(min_word_len: usize) -> Self {
        Self { min_word_len }
    }

    fn words(&self, text: &str) -> HashSet<String> {
        text.split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
            .filter(|w| w.chars().count() >= self.min_word_len)
            .collect()
    }
}

impl CrossEncoder for LexicalOverlapScorer {
    fn score(&self, query: &str, text: &str) -> Result<f32> {
        let words_a = self.words(query);
        let words_b = self.words(text);
        if words_a.is_empty() || words_b.is_empty() {
            return Ok(0.0);
        }

        let intersection = words_a.intersection(&words_b).count();
        let union = words_a.union(&words_b).count();
        Ok(intersection as f32 / union as f32)
    }

    fn name(&self) -> &str {
        "lexical-overlap"
    }
}

/// Cross-encoder reranker with fail-open semantics
#[derive(Clone)]
pub struct Reranker {
    encoder: Arc<dyn CrossEncoder>,
}

impl Reranker {
    pub fn new(encoder: Arc<dyn CrossEncoder>) -> Self {
        Self { encoder }
    }

    /// Reorder `candidates` by cross-encoder score and keep `top_n`
    ///
    /// Never fails.
    #[instrument(skip(self, query, candidates), fields(encoder = self.encoder.name(), candidates = candidates.len()))]
    pub async fn rerank(&self, query: &str, candidates: Vec<RetrievalCandidate>, top_n: usize) -> Vec<RetrievalCandidate> {
        if candidates.is_empty() || top_n == 0 {
            return Vec::new();
        }

        match self.score(query, &candidates).await {
            Ok(scores) => {
                let mut scored: Vec<RetrievalCandidate> = candidates
                    .into_iter()
                    .zip(scores)
                    .map(|(mut candidate, score)| {
                        candidate.rerank_score = Some(score);
                        candidate
                    })
                    .collect();
                scored.sort_by(|a, b| b.effective_score().total_cmp(&a.effective_score()));
                scored.truncate(top_n);
                debug!(kept = scored.len(), "Reranking complete");
                scored
            }
            Err((reason, e)) => {
                warn!(reason, error = %e, "Reranking failed, keeping retrieval order");
                metrics::record_rerank_fail_open(reason);
                candidates.into_iter().take(top_n).collect()
            }
        }
    }

    async fn score(
        &self,
        query: &str,
        candidates: &[RetrievalCandidate],
    ) -> std::result::Result<Vec<f32>, (&'static str, AppError)> {
        let pairs: Vec<(String, String)> = candidates
            .iter()
            .map(|c| (query.to_string(), c.content.clone()))
            .collect();
        let expected = pairs.len();
        let encoder = Arc::clone(&self.encoder);

        let scores = tokio::task::spawn_blocking(move || encoder.score_pairs(&pairs))
            .await
            .map_err(|e| {
                (
                    "worker_panic",
                    AppError::Rerank {
                        message: e.to_string(),
                    },
                )
            })?
            .map_err(|e| ("error", e))?;

        if scores.len() != expected {
            return Err((
                "count_mismatch",
                AppError::Rerank {
                    message: format!("expected {} scores, got {}", expected, scores.len()),
                },
            ));
        }
        if scores.iter().any(|s| !s.is_finite()) {
            return Err((
                "non_finite",
                AppError::Rerank {
                    message: "non-finite score".to_string(),
                },
            ));
        }
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedScores(Vec<f32>);

    impl CrossEncoder for FixedScores {
        fn score(&self, _query: &str, _text: &str) -> Result<f32> {
            Ok(0.0)
        }

        fn score_pairs(&self, _pairs: &[(String, String)]) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    struct Failing;

    impl CrossEncoder for Failing {
        fn score(&self, _query: &str, _text: &str) -> Result<f32> {
            Err(AppError::Rerank {
                message: "model not loaded".into(),
            })
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    struct Panicking;

    impl CrossEncoder for Panicking {
        fn score(&self, _query: &str, _text: &str) -> Result<f32> {
            panic!("scorer crashed")
        }

        fn name(&self) -> &str {
            "panicking"
        }
    }

    fn candidates() -> Vec<RetrievalCandidate> {
        vec![
            RetrievalCandidate::new("a", "alpha", 0.9),
            RetrievalCandidate::new("b", "beta", 0.8),
            RetrievalCandidate::new("c", "gamma", 0.7),
            RetrievalCandidate::new("d", "delta", 0.6),
        ]
    }

    fn ids(list: &[RetrievalCandidate]) -> Vec<&str> {
        list.iter().map(|c| c.chunk_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_sorts_by_rerank_score_and_truncates() {
        let reranker = Reranker::new(Arc::new(FixedScores(vec![0.1, 0.7, 0.3, 0.9])));
        let result = reranker.rerank("q", candidates(), 3).await;

        assert_eq!(ids(&result), vec!["d", "b", "c"]);
        assert_eq!(result[0].rerank_score, Some(0.9));
    }

    #[tokio::test]
    async fn test_error_fails_open() {
        let reranker = Reranker::new(Arc::new(Failing));
        let result = reranker.rerank("q", candidates(), 2).await;

        assert_eq!(ids(&result), vec!["a", "b"]);
        assert!(result.iter().all(|c| c.rerank_score.is_none()));
    }

    #[tokio::test]
    async fn test_panic_fails_open() {
        let reranker = Reranker::new(Arc::new(Panicking));
        let result = reranker.rerank("q", candidates(), 3).await;
        assert_eq!(ids(&result), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_count_mismatch_and_nan_fail_open() {
        let short = Reranker::new(Arc::new(FixedScores(vec![0.5])));
        assert_eq!(ids(&short.rerank("q", candidates(), 2).await), vec!["a", "b"]);

        let nan = Reranker::new(Arc::new(FixedScores(vec![0.1, f32::NAN, 0.3, 0.2])));
        assert_eq!(ids(&nan.rerank("q", candidates(), 2).await), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let reranker = Reranker::new(Arc::new(Failing));
        assert!(reranker.rerank("q", Vec::new(), 3).await.is_empty());
        assert!(reranker.rerank("q", candidates(), 0).await.is_empty());
    }

    #[tokio::test]
    async fn test_lexical_scorer_prefers_overlap() {
        let reranker = Reranker::new(Arc::new(LexicalOverlapScorer::default()));
        let list = vec![
            RetrievalCandidate::new("off", "Cooking pasta needs salted water.", 0.9),
            RetrievalCandidate::new("on", "Entropy measures disorder in thermodynamics.", 0.1),
        ];
        let result = reranker.rerank("What does entropy measure in thermodynamics?", list, 2).await;

        assert_eq!(ids(&result), vec!["on", "off"]);
        assert!(result[0].rerank_score.unwrap() > 0.0);
        assert_eq!(result[1].rerank_score, Some(0.0));
    }

    #[test]
    fn test_lexical_scorer_ignores_punctuation_and_case() {
        let scorer = LexicalOverlapScorer::default();
        assert_eq!(scorer.score("Photon!", "photon").unwrap(), 1.0);
        assert_eq!(scorer.score("a an", "the photon").unwrap(), 0.0);
    }
}
