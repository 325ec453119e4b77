use super::Metadata;
use serde::{Deserialize, Serialize};

/// A chunk returned by retrieval for one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalCandidate {
    /// Id of the matching chunk
    pub chunk_id: String,

    /// Chunk text
    pub content: String,

    /// Chunk metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// First-stage similarity score
    pub score: f32,

    /// Cross-encoder score, set by the reranker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

impl RetrievalCandidate {
    pub fn new(chunk_id: impl Into<String>, content: impl Into<String>, score: f32) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            content: content.into(),
            metadata: Metadata::new(),
            score,
            rerank_score: None,
        }
    }

    /// Rerank score when present, retrieval score otherwise
    pub fn effective_score(&self) -> f32 {
        self.rerank_score.unwrap_or(self.score)
    }

    /// String metadata field, if present
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}
