//! Configuration management for RagForge services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Remote store (Redis) configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Local fallback configuration
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Document chunking configuration
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Multi-hop planner configuration
    #[serde(default)]
    pub planner: PlannerConfig,

    /// Reranking configuration
    #[serde(default)]
    pub rerank: RerankConfig,

    /// Answer generation configuration
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Query result cache configuration
    #[serde(default)]
    pub cache: QueryCacheConfig,

    /// Chat session configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    /// Redis URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Key prefix for namespacing
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-operation timeout in milliseconds
    #[serde(default = "default_op_timeout")]
    pub op_timeout_ms: u64,

    /// Maximum outstanding remote calls
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Seconds to wait before probing a failed remote again
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FallbackConfig {
    /// Maximum entries held by the in-memory fallback
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,

    /// Persist fallback writes and pending transactions to disk
    #[serde(default = "default_disk_enabled")]
    pub disk_enabled: bool,

    /// Directory for snapshots and the write-ahead log
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkingConfig {
    /// Target chunk size in characters
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Overlap between consecutive chunks, in paragraphs
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Hard ceiling imposed by the index's content field
    #[serde(default = "default_max_content_size")]
    pub max_content_size: usize,

    /// Maximum id length accepted by the index
    #[serde(default = "default_max_id_length")]
    pub max_id_length: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlannerConfig {
    /// Candidates retrieved per hop and kept after merging
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Maximum retrieval hops per request
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Stop once candidates reach `sufficiency_factor * top_k`
    #[serde(default = "default_sufficiency_factor")]
    pub sufficiency_factor: usize,

    /// Hits scoring below this are dropped
    #[serde(default)]
    pub similarity_threshold: f32,

    /// Maximum formatted context length in characters
    #[serde(default = "default_max_context_length")]
    pub max_context_length: usize,

    /// Include title/source headers in formatted context
    #[serde(default = "default_true")]
    pub include_metadata: bool,

    /// Skip search queries already issued in this request
    #[serde(default = "default_true")]
    pub dedupe_queries: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RerankConfig {
    /// Candidates kept after reranking
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerationConfig {
    /// Chat completions endpoint
    #[serde(default = "default_generation_endpoint")]
    pub endpoint: String,

    /// API key for the generation service
    pub api_key: Option<String>,

    /// Model to use
    #[serde(default = "default_generation_model")]
    pub model: String,

    /// Hard timeout for one generation call
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,

    /// Maximum output tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Default sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum retries for transient HTTP failures
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai, hash
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// API key for embedding service
    pub api_key: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    /// Inputs longer than this are truncated before embedding
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryCacheConfig {
    /// TTL for cached answers in seconds
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Sessions idle longer than this are removed by the cleanup task
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,

    /// Seconds between cleanup sweeps
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Keys examined per cleanup batch
    #[serde(default = "default_cleanup_batch")]
    pub cleanup_batch_size: usize,

    /// Messages forwarded to the generator as conversation history
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_true")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_true() -> bool { true }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_key_prefix() -> String { "ragforge".to_string() }
fn default_op_timeout() -> u64 { 2_000 }
fn default_max_concurrency() -> usize { 100 }
fn default_reconnect_interval() -> u64 { 5 }
fn default_memory_capacity() -> usize { 10_000 }
fn default_disk_enabled() -> bool { true }
fn default_data_dir() -> PathBuf { PathBuf::from("data/fallback") }
fn default_chunk_size() -> usize { 1000 }
fn default_chunk_overlap() -> usize { 1 }
fn default_max_content_size() -> usize { 65_000 }
fn default_max_id_length() -> usize { 36 }
fn default_top_k() -> usize { 10 }
fn default_max_iterations() -> usize { 3 }
fn default_sufficiency_factor() -> usize { 2 }
fn default_max_context_length() -> usize { 12_000 }
fn default_top_n() -> usize { 3 }
fn default_generation_endpoint() -> String { "https://api.openai.com/v1/chat/completions".to_string() }
fn default_generation_model() -> String { "gpt-4o-mini".to_string() }
fn default_generation_timeout() -> u64 { 30 }
fn default_max_tokens() -> usize { 1024 }
fn default_temperature() -> f32 { 0.7 }
fn default_generation_retries() -> u32 { 3 }
fn default_embedding_provider() -> String { "openai".to_string() }
fn default_embedding_model() -> String { "text-embedding-3-small".to_string() }
fn default_embedding_dimension() -> usize { 768 }
fn default_embedding_timeout() -> u64 { 30 }
fn default_max_input_chars() -> usize { 10_000 }
fn default_cache_ttl() -> u64 { 3600 }
fn default_session_ttl() -> u64 { 7 * 24 * 3600 }
fn default_cleanup_interval() -> u64 { 3600 }
fn default_cleanup_batch() -> usize { 100 }
fn default_history_window() -> usize { 5 }
fn default_log_level() -> String { "info".to_string() }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "ragforge".to_string() }

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            op_timeout_ms: default_op_timeout(),
            max_concurrency: default_max_concurrency(),
            reconnect_interval_secs: default_reconnect_interval(),
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            memory_capacity: default_memory_capacity(),
            disk_enabled: default_disk_enabled(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            max_content_size: default_max_content_size(),
            max_id_length: default_max_id_length(),
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_iterations: default_max_iterations(),
            sufficiency_factor: default_sufficiency_factor(),
            similarity_threshold: 0.0,
            max_context_length: default_max_context_length(),
            include_metadata: true,
            dedupe_queries: true,
        }
    }
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self { top_n: default_top_n() }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            endpoint: default_generation_endpoint(),
            api_key: None,
            model: default_generation_model(),
            timeout_secs: default_generation_timeout(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_retries: default_generation_retries(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_base: None,
            api_key: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_embedding_timeout(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self { ttl_secs: default_cache_ttl() }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            cleanup_interval_secs: default_cleanup_interval(),
            cleanup_batch_size: default_cleanup_batch(),
            history_window: default_history_window(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: true,
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__REDIS__URL=redis://cache:6379
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get the generation timeout as Duration
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation.timeout_secs)
    }

    /// Get the cache TTL as Duration
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }
}

impl RedisConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }
}
