//! RagForge context engine
//!
//! Multi-hop retrieval planning, reranking, context assembly, answer
//! generation and chat sessions on top of `ragforge-common`.

pub mod assembler;
pub mod engine;
pub mod generator;
pub mod planner;
pub mod reranker;
pub mod service;
pub mod session;

pub use assembler::{cache_key, CacheKeyParams, ContextAssembler};
pub use engine::{QueryRequest, QueryResponse, RagEngine, SourceRef};
pub use generator::{ChatMessage, CompletionRequest, Generator, OpenAiGenerator, Role};
pub use planner::{PlanOutcome, QueryPlanner, RetrievalPlan, RetrievalScope};
pub use reranker::{CrossEncoder, LexicalOverlapScorer, Reranker};
pub use service::{Command, Reply, Service};
pub use session::{ChatSession, SessionMessage, SessionStore};
