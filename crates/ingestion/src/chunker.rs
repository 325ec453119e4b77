//! Text chunking module
//!
//! Splits documents on blank-line paragraph boundaries and packs paragraphs
//! greedily into chunks, carrying the last `chunk_overlap` paragraphs into the
//! next chunk. Every chunk is held to a hard content ceiling and gets an id
//! that fits the index id-length limit. All lengths are in characters.

use ragforge_common::config::ChunkingConfig;
use ragforge_common::models::{Chunk, Document, Metadata};
use regex_lite::Regex;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Joiner placed between paragraphs inside a chunk
const PARAGRAPH_SEPARATOR: &str = "\n\n";

/// Appended to content cut at the ceiling
pub const TRUNCATION_MARKER: &str = "\n\n[content truncated]";

fn paragraph_break() -> &'static Regex {
    static BREAK: OnceLock<Regex> = OnceLock::new();
    BREAK.get_or_init(|| Regex::new(r"\n\s*\n").expect("paragraph regex is valid"))
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Split text into trimmed, non-empty paragraphs
pub fn split_paragraphs(text: &str) -> Vec<&str> {
    paragraph_break()
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Fit `base + suffix` into `limit` characters
///
/// Over-long ids keep a prefix of `base`, then an 8-hex digest of the full
/// `base`, then the suffix. Returns the id and whether it was shortened.
pub fn fit_id(base: &str, suffix: &str, limit: usize) -> (String, bool) {
    if char_len(base) + char_len(suffix) <= limit {
        return (format!("{}{}", base, suffix), false);
    }

    let digest = hex::encode(Sha256::digest(base.as_bytes()));
    let hash = &digest[..8];
    let room = limit.saturating_sub(char_len(suffix) + hash.len() + 1);
    let id = if room == 0 {
        format!("{}{}", hash, suffix)
    } else {
        let prefix: String = base.chars().take(room).collect();
        format!("{}-{}{}", prefix, hash, suffix)
    };
    (id, true)
}

/// Cut `content` to `max_chars`, marker included
///
/// Returns `None` when the content already fits.
pub fn truncate_with_marker(content: &str, max_chars: usize) -> Option<String> {
    if char_len(content) <= max_chars {
        return None;
    }
    let marker_len = char_len(TRUNCATION_MARKER);
    if max_chars < marker_len {
        return Some(content.chars().take(max_chars).collect());
    }
    let mut truncated: String = content.chars().take(max_chars - marker_len).collect();
    truncated.push_str(TRUNCATION_MARKER);
    Some(truncated)
}

/// Paragraph chunker bound to one configuration
#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
    max_content_size: usize,
    max_id_length: usize,
}

impl Chunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.min(config.max_content_size).max(1),
            overlap: config.chunk_overlap,
            max_content_size: config.max_content_size.max(1),
            max_id_length: config.max_id_length,
        }
    }

    /// Index-safe id for a document id
    pub fn parent_id(&self, document_id: &str) -> String {
        fit_id(document_id, "", self.max_id_length).0
    }

    /// Split a document into chunks (empty content yields none)
    pub fn chunk(&self, document: &Document) -> Vec<Chunk> {
        let content = document.content.trim();
        if content.is_empty() {
            return Vec::new();
        }

        let groups: Vec<(String, usize)> = if char_len(content) <= self.chunk_size {
            vec![(content.to_string(), split_paragraphs(content).len().max(1))]
        } else {
            self.pack(&split_paragraphs(content))
        };

        let (parent_id, parent_shortened) = fit_id(&document.id, "", self.max_id_length);
        let total_chunks = groups.len();
        let mut chunks = Vec::with_capacity(total_chunks);

        for (index, (text, paragraph_count)) in groups.into_iter().enumerate() {
            let (id, id_shortened) =
                fit_id(&parent_id, &format!("-c{}", index + 1), self.max_id_length);

            let mut metadata: Metadata = document.metadata.clone();
            metadata.insert("parent_id".to_string(), json!(parent_id));
            metadata.insert("chunk_index".to_string(), json!(index));
            metadata.insert("total_chunks".to_string(), json!(total_chunks));
            metadata.insert("paragraph_count".to_string(), json!(paragraph_count));
            if parent_shortened || id_shortened {
                metadata.insert("original_id".to_string(), json!(document.id));
            }

            let content = match truncate_with_marker(&text, self.max_content_size) {
                Some(truncated) => {
                    warn!(
                        document_id = %document.id,
                        chunk_index = index,
                        original_len = char_len(&text),
                        truncated_len = char_len(&truncated),
                        "Chunk content truncated"
                    );
                    metadata.insert("original_content_length".to_string(), json!(char_len(&text)));
                    metadata.insert("content_truncated".to_string(), json!(true));
                    truncated
                }
                None => text,
            };

            chunks.push(Chunk {
                id,
                parent_id: parent_id.clone(),
                content,
                metadata,
                chunk_index: index,
                total_chunks,
                embedding: Vec::new(),
            });
        }

        debug!(
            document_id = %document.id,
            input_len = char_len(content),
            chunk_count = chunks.len(),
            chunk_size = self.chunk_size,
            "Document chunked"
        );

        chunks
    }

    /// Greedy paragraph packing; returns (joined text, paragraph count)
    fn pack(&self, paragraphs: &[&str]) -> Vec<(String, usize)> {
        let mut groups = Vec::new();
        let mut buffer: Vec<&str> = Vec::new();
        let mut buffer_len = 0usize;
        let separator_len = char_len(PARAGRAPH_SEPARATOR);

        for paragraph in paragraphs {
            let paragraph_len = char_len(paragraph);
            if !buffer.is_empty() && buffer_len + separator_len + paragraph_len > self.chunk_size {
                groups.push((buffer.join(PARAGRAPH_SEPARATOR), buffer.len()));

                let keep = self.overlap.min(buffer.len());
                buffer.drain(..buffer.len() - keep);
                buffer_len = joined_len(&buffer, separator_len);
            }

            if !buffer.is_empty() {
                buffer_len += separator_len;
            }
            buffer_len += paragraph_len;
            buffer.push(paragraph);
        }

        if !buffer.is_empty() {
            groups.push((buffer.join(PARAGRAPH_SEPARATOR), buffer.len()));
        }
        groups
    }
}

fn joined_len(parts: &[&str], separator_len: usize) -> usize {
    if parts.is_empty() {
        return 0;
    }
    parts.iter().map(|p| char_len(p)).sum::<usize>() + separator_len * (parts.len() - 1)
}
