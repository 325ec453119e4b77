//! RagForge Common Library
//!
//! Shared code for the RagForge crates including:
//! - Document, chunk, candidate and filter models
//! - Embedding provider abstraction with a never-failing wrapper
//! - Vector index abstraction
//! - The resilient cache store (Redis + local fallback + WAL)
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability

pub mod cache;
pub mod config;
pub mod embeddings;
pub mod errors;
pub mod index;
pub mod metrics;
pub mod models;

// Re-export commonly used types
pub use cache::{CacheStore, RemoteStore, StoreOp, TransactionOutcome};
pub use config::AppConfig;
pub use embeddings::{Embedder, ResilientEmbedder};
pub use errors::{AppError, Result};
pub use index::{InMemoryVectorIndex, VectorIndex};
pub use models::{Chunk, Document, Filter, Metadata, RetrievalCandidate, SourceFormat};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
