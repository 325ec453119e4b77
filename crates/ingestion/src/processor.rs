//! Ingestion processor
//!
//! Core logic for turning documents into indexed chunks: validation, text
//! extraction, chunking, embedding and upsert, followed by invalidation of
//! the partition's cached answers.

use crate::chunker::Chunker;
use crate::extract::extract_text;
use ragforge_common::cache::{keys, CacheStore};
use ragforge_common::config::ChunkingConfig;
use ragforge_common::embeddings::ResilientEmbedder;
use ragforge_common::errors::{AppError, Result};
use ragforge_common::index::VectorIndex;
use ragforge_common::metrics;
use ragforge_common::models::Document;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

/// Summary of one ingested document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub document_id: String,
    pub chunk_ids: Vec<String>,
    pub chunks_created: usize,
}

/// Ingestion processor
pub struct Ingestor {
    chunker: Chunker,
    embedder: ResilientEmbedder,
    index: Arc<dyn VectorIndex>,
    store: Arc<CacheStore>,
}

impl Ingestor {
    pub fn new(
        chunking: &ChunkingConfig,
        embedder: ResilientEmbedder,
        index: Arc<dyn VectorIndex>,
        store: Arc<CacheStore>,
    ) -> Self {
        Self {
            chunker: Chunker::new(chunking),
            embedder,
            index,
            store,
        }
    }

    fn validate(document: &Document) -> Result<()> {
        document.validate().map_err(|e| AppError::InvalidDocument {
            id: document.id.clone(),
            message: e.to_string(),
        })
    }

    /// Chunk, embed and index one document
    #[instrument(skip(self, document), fields(document_id = %document.id))]
    pub async fn ingest(&self, document: Document, partition: &str) -> Result<IngestReport> {
        Self::validate(&document)?;
        let report = self.process(document, partition).await?;
        self.invalidate_partition_cache(partition).await;
        Ok(report)
    }

    /// Ingest documents in order
    ///
    /// The whole batch is rejected before any work if one document is invalid.
    pub async fn ingest_batch(&self, documents: Vec<Document>, partition: &str) -> Result<Vec<IngestReport>> {
        for document in &documents {
            Self::validate(document)?;
        }

        let mut reports = Vec::with_capacity(documents.len());
        let mut failure = None;
        for document in documents {
            match self.process(document, partition).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        // Earlier documents are already indexed even when a later one failed
        if !reports.is_empty() {
            self.invalidate_partition_cache(partition).await;
        }
        if let Some(e) = failure {
            return Err(e);
        }
        info!(
            partition,
            documents = reports.len(),
            chunks = reports.iter().map(|r| r.chunks_created).sum::<usize>(),
            "Batch ingested"
        );
        Ok(reports)
    }

    async fn process(&self, mut document: Document, partition: &str) -> Result<IngestReport> {
        let start = Instant::now();

        document.content = extract_text(&document.content, document.format);
        let mut chunks = self.chunker.chunk(&document);
        if chunks.is_empty() {
            warn!(document_id = %document.id, "Document produced no chunks");
            return Err(AppError::InvalidDocument {
                id: document.id,
                message: "no text content after extraction".to_string(),
            });
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await;
        for (chunk, embedding) in chunks.iter_mut().zip(embeddings) {
            chunk.embedding = embedding;
            chunk.metadata.insert("partition_key".to_string(), json!(partition));
        }

        self.index.upsert(&chunks, partition).await?;

        let chunk_ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        metrics::record_ingestion(start.elapsed().as_secs_f64(), chunk_ids.len(), partition);
        info!(
            document_id = %document.id,
            partition,
            chunks = chunk_ids.len(),
            "Document ingested"
        );

        Ok(IngestReport {
            document_id: document.id,
            chunks_created: chunk_ids.len(),
            chunk_ids,
        })
    }

    /// Delete chunks by id
    pub async fn delete_documents(&self, ids: &[String], partition: &str) -> Result<usize> {
        let deleted = self.index.delete(ids, partition).await?;
        self.invalidate_partition_cache(partition).await;
        info!(partition, requested = ids.len(), deleted, "Chunks deleted");
        Ok(deleted)
    }

    /// Delete every chunk of a source document
    pub async fn delete_parent(&self, document_id: &str, partition: &str) -> Result<usize> {
        let parent_id = self.chunker.parent_id(document_id);
        let deleted = self.index.delete_by_parent(&parent_id, partition).await?;
        self.invalidate_partition_cache(partition).await;
        info!(partition, parent_id = %parent_id, deleted, "Document deleted");
        Ok(deleted)
    }

    pub async fn delete_partition(&self, partition: &str) -> Result<usize> {
        let deleted = self.index.delete_partition(partition).await?;
        self.invalidate_partition_cache(partition).await;
        info!(partition, deleted, "Partition deleted");
        Ok(deleted)
    }

    /// Drop every cached answer of a partition
    pub async fn invalidate_partition_cache(&self, partition: &str) -> usize {
        let cached = self.store.scan(&keys::query_prefix(partition)).await;
        if cached.is_empty() {
            return 0;
        }

        let count = cached.len();
        let outcome = cached
            .iter()
            .fold(self.store.transaction(), |tx, key| tx.delete(key))
            .commit()
            .await;
        if !outcome.success {
            warn!(partition, keys = count, "Cache invalidation applied locally only");
        }
        debug!(partition, keys = count, "Partition cache invalidated");
        count
    }
}
