//! RAG query engine
//!
//! `process_query` runs cache lookup, multi-hop retrieval, reranking, context
//! assembly and generation. Retrieval problems only ever degrade the answer;
//! a generation timeout is the one failure returned to the caller.

use crate::assembler::{cache_key, CacheKeyParams, ContextAssembler};
use crate::generator::{complete_with_timeout, ChatMessage, CompletionRequest, Generator, Role};
use crate::planner::{QueryPlanner, RetrievalScope};
use crate::reranker::{CrossEncoder, Reranker};
use ragforge_common::cache::CacheStore;
use ragforge_common::config::AppConfig;
use ragforge_common::embeddings::ResilientEmbedder;
use ragforge_common::errors::{AppError, Result};
use ragforge_common::index::VectorIndex;
use ragforge_common::metrics::{self, QueryMetrics};
use ragforge_common::models::{Filter, Metadata, RetrievalCandidate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};
use validator::Validate;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant with access to retrieved documents. \
Use the retrieved documents to answer the user's question. \
If the documents don't contain relevant information, say so honestly rather than making up information. \
When referencing information from the documents, refer to them by their numbers.";

pub const APOLOGY_RESPONSE: &str = "I apologize, but I'm having trouble generating a response at the moment. \
Could you please try again or rephrase your question?";

const NO_CONTEXT: &str = "No relevant documents found.";
const SOURCE_LIMIT: usize = 3;
const PREVIEW_CHARS: usize = 200;

fn default_partition() -> String {
    "default".to_string()
}

fn default_use_cache() -> bool {
    true
}

/// One question for the engine
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct QueryRequest {
    #[validate(length(min = 1, max = 10000))]
    pub query: String,

    /// Candidates to retrieve; planner default when absent
    #[serde(default)]
    #[validate(range(min = 1, max = 100))]
    pub top_k: Option<usize>,

    /// Candidates kept after reranking
    #[serde(default)]
    #[validate(range(min = 1, max = 20))]
    pub top_n: Option<usize>,

    #[serde(default)]
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: Option<f32>,

    #[serde(default = "default_partition")]
    pub partition_key: String,

    #[serde(default)]
    pub filter: Filter,

    #[serde(default = "default_use_cache")]
    pub use_cache: bool,

    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Earlier conversation turns, oldest first
    #[serde(default)]
    pub history: Vec<ChatMessage>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            top_k: None,
            top_n: None,
            temperature: None,
            partition_key: default_partition(),
            filter: Filter::new(),
            use_cache: true,
            system_prompt: None,
            history: Vec::new(),
        }
    }

    pub fn with_partition(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = partition_key.into();
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = Some(top_n);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }
}

/// Source reference returned with an answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub id: String,
    /// Content preview
    pub content: String,
    pub metadata: Metadata,
    /// Rerank score when present, retrieval score otherwise
    pub score: f32,
}

impl From<&RetrievalCandidate> for SourceRef {
    fn from(candidate: &RetrievalCandidate) -> Self {
        let mut content: String = candidate.content.chars().take(PREVIEW_CHARS).collect();
        content.push_str("...");
        Self {
            id: candidate.chunk_id.clone(),
            content,
            metadata: candidate.metadata.clone(),
            score: candidate.effective_score(),
        }
    }
}

/// Answer to a [`QueryRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub response: String,
    pub sources_used: Vec<SourceRef>,
    pub rag_enhanced: bool,
    /// Seconds spent; 0 for cache hits
    pub processing_time: f64,
    pub cached: bool,
    pub retrieval_count: usize,
    pub reranked_count: usize,
    pub partition_key: String,
    #[serde(default)]
    pub queries_used: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct EngineDefaults {
    top_k: usize,
    top_n: usize,
    temperature: f32,
    cache_ttl: Duration,
    generation_timeout: Duration,
    history_window: usize,
}

/// Retrieval-augmented generation engine
pub struct RagEngine {
    planner: QueryPlanner,
    reranker: Reranker,
    assembler: ContextAssembler,
    generator: Arc<dyn Generator>,
    store: Arc<CacheStore>,
    defaults: EngineDefaults,
}

impl RagEngine {
    pub fn new(
        config: &AppConfig,
        generator: Arc<dyn Generator>,
        embedder: ResilientEmbedder,
        index: Arc<dyn VectorIndex>,
        encoder: Arc<dyn CrossEncoder>,
        store: Arc<CacheStore>,
    ) -> Self {
        let generation_timeout = config.generation_timeout();
        Self {
            planner: QueryPlanner::new(
                Arc::clone(&generator),
                embedder,
                index,
                config.planner.clone(),
                generation_timeout,
            ),
            reranker: Reranker::new(encoder),
            assembler: ContextAssembler::new(&config.planner),
            generator,
            store,
            defaults: EngineDefaults {
                top_k: config.planner.top_k,
                top_n: config.rerank.top_n,
                temperature: config.generation.temperature,
                cache_ttl: config.cache_ttl(),
                generation_timeout,
                history_window: config.session.history_window,
            },
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Answer one query
    #[instrument(skip(self, request), fields(partition = %request.partition_key))]
    pub async fn process_query(&self, request: QueryRequest) -> Result<QueryResponse> {
        request.validate()?;
        if request.query.trim().is_empty() {
            return Err(AppError::Validation {
                message: "query must not be blank".to_string(),
                field: Some("query".to_string()),
            });
        }

        let start = Instant::now();
        let query_metrics = QueryMetrics::start(&request.partition_key);
        let top_k = request.top_k.unwrap_or(self.defaults.top_k).max(1);
        let top_n = request.top_n.unwrap_or(self.defaults.top_n).max(1);
        let temperature = request.temperature.unwrap_or(self.defaults.temperature);
        let history = recent_history(&request.history, self.defaults.history_window);

        let key = (request.use_cache && history.is_empty()).then(|| {
            cache_key(&CacheKeyParams {
                query: &request.query,
                top_k,
                top_n,
                temperature,
                partition: &request.partition_key,
                filter: &request.filter,
                system_prompt: request.system_prompt.as_deref(),
            })
        });

        if let Some(key) = &key {
            match self.store.get_json::<QueryResponse>(key).await {
                Ok(Some(mut cached)) => {
                    metrics::record_cache(true, "query");
                    query_metrics.finish("cache_hit");
                    cached.cached = true;
                    cached.processing_time = 0.0;
                    info!("Answer served from cache");
                    return Ok(cached);
                }
                Ok(None) => metrics::record_cache(false, "query"),
                Err(e) => {
                    warn!(error = %e, "Unreadable cache entry, recomputing");
                    metrics::record_cache(false, "query");
                }
            }
        }

        let scope = RetrievalScope::new(request.partition_key.clone(), top_k).with_filter(request.filter.clone());
        let plan = self.planner.plan_and_retrieve(&request.query, &scope, None).await;
        let retrieval_count = plan.contexts.len();

        let reranked = self.reranker.rerank(&request.query, plan.contexts, top_n).await;
        let context = self.assembler.assemble(&reranked);

        let mut messages = history;
        messages.push(ChatMessage::user(format!(
            "Context information:\n{}\n\nUser question: {}",
            if context.is_empty() { NO_CONTEXT } else { context.as_str() },
            request.query.trim()
        )));
        let completion = CompletionRequest::new(
            request.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT),
            messages,
        )
        .with_temperature(temperature)
        .with_timeout(self.defaults.generation_timeout);

        let mut response = QueryResponse {
            response: String::new(),
            sources_used: Vec::new(),
            rag_enhanced: false,
            processing_time: 0.0,
            cached: false,
            retrieval_count,
            reranked_count: reranked.len(),
            partition_key: request.partition_key.clone(),
            queries_used: plan.queries_used,
            error: None,
        };

        match complete_with_timeout(self.generator.as_ref(), completion).await {
            Ok(text) => {
                response.response = text;
                response.sources_used = reranked.iter().take(SOURCE_LIMIT).map(SourceRef::from).collect();
                response.rag_enhanced = !reranked.is_empty();
            }
            Err(e @ AppError::GenerationTimeout { .. }) => {
                query_metrics.finish("timeout");
                return Err(e);
            }
            Err(e) => {
                error!(error = %e, "Generation failed");
                response.response = APOLOGY_RESPONSE.to_string();
                response.error = Some(e.to_string());
                response.processing_time = start.elapsed().as_secs_f64();
                query_metrics.finish("generation_error");
                return Ok(response);
            }
        }

        response.processing_time = start.elapsed().as_secs_f64();
        if let Some(key) = &key {
            if let Err(e) = self.store.set_json(key, &response, Some(self.defaults.cache_ttl)).await {
                warn!(error = %e, "Failed to cache answer");
            }
        }

        info!(
            retrieval_count,
            reranked_count = response.reranked_count,
            rag_enhanced = response.rag_enhanced,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Query answered"
        );
        query_metrics.finish("success");
        Ok(response)
    }
}

/// Last `window` non-system messages, oldest first
fn recent_history(history: &[ChatMessage], window: usize) -> Vec<ChatMessage> {
    let turns: Vec<&ChatMessage> = history.iter().filter(|m| m.role != Role::System).collect();
    let skip = turns.len().saturating_sub(window);
    turns.into_iter().skip(skip).cloned().collect()
}
