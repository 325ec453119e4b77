//! Vector index abstraction
//!
//! The retrieval pipeline talks to a partitioned vector index through
//! [`VectorIndex`]. [`InMemoryVectorIndex`] is a brute-force cosine
//! implementation used by the binary and by tests.

use crate::errors::{AppError, Result};
use crate::models::{Chunk, Filter, RetrievalCandidate};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Partitioned similarity index over chunks
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Return at most `top_k` chunks of `partition` matching `filter`,
    /// ordered by similarity descending
    async fn search(
        &self,
        embedding: &[f32],
        top_k: usize,
        partition: &str,
        filter: &Filter,
    ) -> Result<Vec<RetrievalCandidate>>;

    /// Insert or replace chunks by id
    async fn upsert(&self, chunks: &[Chunk], partition: &str) -> Result<()>;

    /// Delete chunks by id, returning how many existed
    async fn delete(&self, ids: &[String], partition: &str) -> Result<usize>;

    /// Delete every chunk of one parent document
    async fn delete_by_parent(&self, parent_id: &str, partition: &str) -> Result<usize>;

    /// Drop a whole partition
    async fn delete_partition(&self, partition: &str) -> Result<usize>;
}

/// Cosine similarity; 0.0 when either vector has zero magnitude or the
/// dimensions differ
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// In-memory index: partition -> chunk id -> chunk
#[derive(Debug, Default)]
pub struct InMemoryVectorIndex {
    partitions: RwLock<HashMap<String, HashMap<String, Chunk>>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunks stored in a partition
    pub async fn len(&self, partition: &str) -> usize {
        self.partitions
            .read()
            .await
            .get(partition)
            .map(|p| p.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn search(
        &self,
        embedding: &[f32],
        top_k: usize,
        partition: &str,
        filter: &Filter,
    ) -> Result<Vec<RetrievalCandidate>> {
        let partitions = self.partitions.read().await;
        let Some(store) = partitions.get(partition) else {
            debug!(partition, "Search on unknown partition");
            return Ok(Vec::new());
        };

        let mut scored: Vec<RetrievalCandidate> = store
            .values()
            .filter(|chunk| filter.matches(&chunk.metadata))
            .map(|chunk| RetrievalCandidate {
                chunk_id: chunk.id.clone(),
                content: chunk.content.clone(),
                metadata: chunk.metadata.clone(),
                score: cosine_similarity(&chunk.embedding, embedding),
                rerank_score: None,
            })
            .collect();

        // Tie-break on id so equal scores come back in a stable order
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn upsert(&self, chunks: &[Chunk], partition: &str) -> Result<()> {
        if let Some(chunk) = chunks.iter().find(|c| c.embedding.is_empty()) {
            return Err(AppError::VectorIndex {
                message: format!("chunk '{}' has no embedding", chunk.id),
            });
        }

        let mut partitions = self.partitions.write().await;
        let store = partitions.entry(partition.to_string()).or_default();
        for chunk in chunks {
            store.insert(chunk.id.clone(), chunk.clone());
        }
        debug!(partition, count = chunks.len(), "Chunks upserted");
        Ok(())
    }

    async fn delete(&self, ids: &[String], partition: &str) -> Result<usize> {
        let mut partitions = self.partitions.write().await;
        let Some(store) = partitions.get_mut(partition) else {
            return Ok(0);
        };
        Ok(ids.iter().filter(|id| store.remove(*id).is_some()).count())
    }

    async fn delete_by_parent(&self, parent_id: &str, partition: &str) -> Result<usize> {
        let mut partitions = self.partitions.write().await;
        let Some(store) = partitions.get_mut(partition) else {
            return Ok(0);
        };
        let before = store.len();
        store.retain(|_, chunk| chunk.parent_id != parent_id);
        Ok(before - store.len())
    }

    async fn delete_partition(&self, partition: &str) -> Result<usize> {
        let mut partitions = self.partitions.write().await;
        Ok(partitions.remove(partition).map(|p| p.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metadata;
    use serde_json::json;

    fn chunk(id: &str, parent: &str, embedding: Vec<f32>, domain: &str) -> Chunk {
        let mut metadata = Metadata::new();
        metadata.insert("domain".to_string(), json!(domain));
        Chunk {
            id: id.to_string(),
            parent_id: parent.to_string(),
            content: format!("content of {}", id),
            metadata,
            chunk_index: 0,
            total_chunks: 1,
            embedding,
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_search_orders_and_filters() {
        let index = InMemoryVectorIndex::new();
        index
            .upsert(
                &[
                    chunk("a", "doc1", vec![1.0, 0.0], "physics"),
                    chunk("b", "doc1", vec![0.7, 0.7], "physics"),
                    chunk("c", "doc2", vec![0.9, 0.1], "math"),
                ],
                "p1",
            )
            .await
            .unwrap();

        let all = index.search(&[1.0, 0.0], 10, "p1", &Filter::new()).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);

        let physics = index
            .search(&[1.0, 0.0], 10, "p1", &Filter::new().with("domain", "physics"))
            .await
            .unwrap();
        assert_eq!(physics.len(), 2);

        let other = index.search(&[1.0, 0.0], 10, "p2", &Filter::new()).await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_deletes() {
        let index = InMemoryVectorIndex::new();
        index
            .upsert(
                &[
                    chunk("a", "doc1", vec![1.0], "x"),
                    chunk("b", "doc1", vec![1.0], "x"),
                    chunk("c", "doc2", vec![1.0], "x"),
                ],
                "p1",
            )
            .await
            .unwrap();

        assert_eq!(index.delete(&["c".to_string(), "zz".to_string()], "p1").await.unwrap(), 1);
        assert_eq!(index.delete_by_parent("doc1", "p1").await.unwrap(), 2);
        assert_eq!(index.len("p1").await, 0);
        assert_eq!(index.delete_partition("p1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upsert_requires_embedding() {
        let index = InMemoryVectorIndex::new();
        let result = index.upsert(&[chunk("a", "doc1", vec![], "x")], "p1").await;
        assert!(matches!(result, Err(AppError::VectorIndex { .. })));
    }
}
