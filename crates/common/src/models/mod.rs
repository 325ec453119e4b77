//! Core data model shared by ingestion, retrieval and generation

mod candidate;
mod document;
mod filter;

pub use candidate::RetrievalCandidate;
pub use document::{Chunk, Document, SourceFormat};
pub use filter::Filter;

/// Free-form metadata attached to documents, chunks and candidates
pub type Metadata = serde_json::Map<String, serde_json::Value>;
