//! Context assembly and query cache keys
//!
//! Formats ranked candidates into the prompt context, bounded by a character
//! budget, and derives the deterministic cache key for a query.

use ragforge_common::cache::keys;
use ragforge_common::config::PlannerConfig;
use ragforge_common::models::{Filter, RetrievalCandidate};
use sha2::{Digest, Sha256};

/// Joins formatted documents
pub const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Appended to context cut at the length budget
pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// Context formatter with a length budget
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    max_context_length: usize,
    include_metadata: bool,
}

impl ContextAssembler {
    pub fn new(config: &PlannerConfig) -> Self {
        Self {
            max_context_length: config.max_context_length,
            include_metadata: config.include_metadata,
        }
    }

    /// Format and bound the context for `candidates`
    pub fn assemble(&self, candidates: &[RetrievalCandidate]) -> String {
        truncate_context(
            format_contexts(candidates, self.include_metadata),
            self.max_context_length,
        )
    }
}

/// Render candidates as numbered documents
///
/// Each entry is `Document i[ - title]:\n<content>[\nSource: <source|url>]`.
pub fn format_contexts(candidates: &[RetrievalCandidate], include_metadata: bool) -> String {
    candidates
        .iter()
        .enumerate()
        .map(|(i, candidate)| {
            let mut entry = format!("Document {}", i + 1);
            if include_metadata {
                if let Some(title) = candidate.meta_str("title") {
                    entry.push_str(" - ");
                    entry.push_str(title);
                }
            }
            entry.push_str(":\n");
            entry.push_str(candidate.content.trim());

            if include_metadata {
                if let Some(source) = candidate.meta_str("source").or_else(|| candidate.meta_str("url")) {
                    entry.push_str("\nSource: ");
                    entry.push_str(source);
                }
            }
            entry
        })
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}

/// Cut `context` to at most `max_len` characters, marker included
pub fn truncate_context(context: String, max_len: usize) -> String {
    if context.chars().count() <= max_len {
        return context;
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    let keep = max_len.saturating_sub(marker_len);
    let mut truncated: String = context.chars().take(keep).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

/// Trimmed, whitespace-collapsed, lower-cased query text
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Every parameter that changes the answer to a query
#[derive(Debug, Clone)]
pub struct CacheKeyParams<'a> {
    pub query: &'a str,
    pub top_k: usize,
    pub top_n: usize,
    pub temperature: f32,
    pub partition: &'a str,
    pub filter: &'a Filter,
    pub system_prompt: Option<&'a str>,
}

/// Deterministic cache key, `rag:query:<partition>:<sha256>`
pub fn cache_key(params: &CacheKeyParams<'_>) -> String {
    let mut hasher = Sha256::new();
    let fields = [
        normalize_query(params.query),
        params.top_k.to_string(),
        params.top_n.to_string(),
        format!("{:.3}", params.temperature),
        params.partition.to_string(),
        params.filter.canonical(),
        params.system_prompt.map(str::trim).unwrap_or_default().to_string(),
    ];
    for field in &fields {
        hasher.update(field.as_bytes());
        // Unit separator keeps field boundaries unambiguous
        hasher.update([0x1f]);
    }
    keys::query(params.partition, &hex::encode(hasher.finalize()))
}
