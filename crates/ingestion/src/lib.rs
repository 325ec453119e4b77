//! RagForge ingestion
//!
//! Turns raw documents into bounded, embedded chunks in the vector index.

pub mod chunker;
pub mod extract;
pub mod processor;

pub use chunker::Chunker;
pub use extract::extract_text;
pub use processor::{IngestReport, Ingestor};
