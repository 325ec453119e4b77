//! Embedding service abstraction
//!
//! Provides:
//! - A fallible provider trait for remote or local embedding models
//! - An OpenAI-compatible HTTP provider
//! - A deterministic hash-seeded provider for tests and offline runs
//! - `ResilientEmbedder`, which never fails and degrades to a seeded unit vector

use crate::config::EmbeddingConfig;
use crate::errors::{AppError, Result};
use crate::metrics;
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Trait for embedding generation
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts (batch)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the embedding dimension
    fn dimension(&self) -> usize;
}

const MAX_ATTEMPTS: u32 = 3;

/// OpenAI embedding client
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dimension: usize,
    base_url: String,
}

#[derive(Serialize)]
struct OpenAIRequest {
    input: Vec<String>,
    model: String,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    data: Vec<OpenAIEmbedding>,
}

#[derive(Deserialize)]
struct OpenAIEmbedding {
    embedding: Vec<f32>,
}

impl OpenAIEmbedder {
    /// Create a new OpenAI embedder
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or_else(|| AppError::Configuration {
            message: "embedding.api_key is required for the openai provider".to_string(),
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            dimension: config.dimension,
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        })
    }

    /// Make request with exponential backoff
    async fn request_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_elapsed_time: Some(Duration::from_secs(10)),
            ..ExponentialBackoff::default()
        };

        let mut attempt = 0u32;
        retry(policy, || {
            attempt += 1;
            let current = attempt;
            async move {
                self.make_request(texts).await.map_err(|e| {
                    if current >= MAX_ATTEMPTS {
                        backoff::Error::permanent(e)
                    } else {
                        warn!(
                            attempt = current,
                            max_attempts = MAX_ATTEMPTS,
                            error = %e,
                            "Embedding request failed, retrying"
                        );
                        backoff::Error::transient(e)
                    }
                })
            }
        })
        .await
    }

    async fn make_request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);

        let request = OpenAIRequest {
            input: texts.to_vec(),
            model: self.model.clone(),
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::EmbeddingError {
                message: format!("Request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::EmbeddingError {
                message: format!("API error {}: {}", status, body),
            });
        }

        let result: OpenAIResponse = response.json().await.map_err(|e| AppError::EmbeddingError {
            message: format!("Failed to parse response: {}", e),
        })?;

        Ok(result.data.into_iter().map(|e| e.embedding).collect())
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embeddings = self.request_with_retry(&[text.to_string()]).await?;
        embeddings.into_iter().next().ok_or_else(|| AppError::EmbeddingError {
            message: "Empty response".to_string(),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        const BATCH_SIZE: usize = 100;

        let mut all_embeddings = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(BATCH_SIZE) {
            let embeddings = self.request_with_retry(chunk).await?;
            all_embeddings.extend(embeddings);
        }

        Ok(all_embeddings)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Seeded pseudo-random unit vector for `text`
///
/// The seed is the SHA-256 digest of the text, so equal texts always map to
/// the same vector.
pub fn deterministic_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let seed: [u8; 32] = Sha256::digest(text.as_bytes()).into();
    let mut rng = StdRng::from_seed(seed);

    let mut embedding: Vec<f32> = (0..dimension).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    let magnitude = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for x in embedding.iter_mut() {
            *x /= magnitude;
        }
    }
    embedding
}

/// Run CPU-bound embedding work on the blocking pool
async fn run_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| AppError::EmbeddingError {
            message: format!("embedding worker failed: {}", e),
        })
}

/// Offline embedder producing deterministic vectors
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let text = text.to_string();
        let dimension = self.dimension;
        run_blocking(move || deterministic_embedding(&text, dimension)).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let texts = texts.to_vec();
        let dimension = self.dimension;
        run_blocking(move || {
            texts
                .iter()
                .map(|t| deterministic_embedding(t, dimension))
                .collect()
        })
        .await
    }

    fn model_name(&self) -> &str {
        "hash-embedding"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Embedder wrapper that never fails
///
/// Provider errors and timeouts degrade to [`deterministic_embedding`] so
/// retrieval quality drops instead of the request failing.
#[derive(Clone)]
pub struct ResilientEmbedder {
    inner: Arc<dyn Embedder>,
    dimension: usize,
    timeout: Duration,
    max_input_chars: usize,
}

impl ResilientEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, config: &EmbeddingConfig) -> Self {
        Self {
            dimension: inner.dimension(),
            inner,
            timeout: Duration::from_secs(config.timeout_secs),
            max_input_chars: config.max_input_chars,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn prepare<'a>(&self, text: &'a str) -> std::borrow::Cow<'a, str> {
        if text.chars().count() > self.max_input_chars {
            warn!(
                chars = text.chars().count(),
                limit = self.max_input_chars,
                "Text too long, truncating for embedding"
            );
            std::borrow::Cow::Owned(text.chars().take(self.max_input_chars).collect())
        } else {
            std::borrow::Cow::Borrowed(text)
        }
    }

    async fn fallback(&self, text: &str, reason: &str) -> Vec<f32> {
        warn!(
            model = self.inner.model_name(),
            reason,
            "Using deterministic fallback embedding"
        );
        metrics::record_embedding_fallback(self.inner.model_name());

        let owned = text.to_string();
        let dimension = self.dimension;
        match run_blocking(move || deterministic_embedding(&owned, dimension)).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(error = %e, "Blocking pool unavailable, embedding inline");
                deterministic_embedding(text, dimension)
            }
        }
    }

    /// Embed one text; never fails
    pub async fn embed(&self, text: &str) -> Vec<f32> {
        if text.trim().is_empty() {
            debug!("Empty text provided for embedding, returning zero vector");
            return vec![0.0; self.dimension];
        }

        let text = self.prepare(text);
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.inner.embed(&text)).await;

        match outcome {
            Ok(Ok(embedding)) => {
                metrics::record_embedding(start.elapsed().as_secs_f64(), self.inner.model_name(), 1, true);
                if embedding.len() != self.dimension {
                    warn!(
                        expected = self.dimension,
                        got = embedding.len(),
                        "Embedding dimension mismatch"
                    );
                    return self.fallback(&text, "dimension mismatch").await;
                }
                embedding
            }
            Ok(Err(e)) => {
                metrics::record_embedding(start.elapsed().as_secs_f64(), self.inner.model_name(), 1, false);
                self.fallback(&text, &e.to_string()).await
            }
            Err(_) => {
                metrics::record_embedding(start.elapsed().as_secs_f64(), self.inner.model_name(), 1, false);
                self.fallback(&text, "timeout").await
            }
        }
    }

    /// Embed many texts; a failed batch falls back to per-text embedding
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Vec<f32>> {
        let prepared: Vec<String> = texts.iter().map(|t| self.prepare(t).into_owned()).collect();
        let any_blank = prepared.iter().any(|t| t.trim().is_empty());

        if !any_blank {
            let start = Instant::now();
            let outcome = tokio::time::timeout(self.timeout, self.inner.embed_batch(&prepared)).await;
            match outcome {
                Ok(Ok(embeddings))
                    if embeddings.len() == prepared.len()
                        && embeddings.iter().all(|e| e.len() == self.dimension) =>
                {
                    metrics::record_embedding(
                        start.elapsed().as_secs_f64(),
                        self.inner.model_name(),
                        prepared.len(),
                        true,
                    );
                    return embeddings;
                }
                Ok(Ok(_)) => warn!("Batch embedding returned malformed result, embedding individually"),
                Ok(Err(e)) => warn!(error = %e, "Batch embedding failed, embedding individually"),
                Err(_) => warn!("Batch embedding timed out, embedding individually"),
            }
        }

        let mut embeddings = Vec::with_capacity(prepared.len());
        for text in &prepared {
            embeddings.push(self.embed(text).await);
        }
        embeddings
    }
}

/// Create an embedder based on configuration
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "hash" => Ok(Arc::new(HashEmbedder::new(config.dimension))),
        other => {
            warn!(provider = other, "Unknown embedding provider, using hash embedder");
            Ok(Arc::new(HashEmbedder::new(config.dimension)))
        }
    }
}
