//! Document and chunk models

use super::Metadata;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// A source document submitted for ingestion
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Document {
    /// Caller-supplied id (may exceed the index id limit)
    #[validate(length(min = 1, message = "document id must not be empty"))]
    #[serde(default = "generate_id")]
    pub id: String,

    /// Raw text content
    #[validate(custom(function = "not_blank"))]
    pub content: String,

    /// Free-form metadata (title, source, url, ...)
    #[serde(default)]
    pub metadata: Metadata,

    /// Markup of `content`
    #[serde(default)]
    pub format: SourceFormat,
}

/// Markup a document's content is written in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    #[default]
    Text,
    Markdown,
    Html,
}

fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut err = ValidationError::new("blank");
        err.message = Some("document content must not be blank".into());
        return Err(err);
    }
    Ok(())
}

impl Document {
    /// Create a document with a generated id
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            content: content.into(),
            metadata: Metadata::new(),
            format: SourceFormat::Text,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_format(mut self, format: SourceFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// A bounded segment of a document as stored in the vector index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Index-safe id, unique within a partition
    pub id: String,

    /// Index-safe id of the source document
    pub parent_id: String,

    /// Chunk text (never longer than the configured ceiling)
    pub content: String,

    /// Document metadata plus positional fields
    pub metadata: Metadata,

    /// Position within the parent (0-based)
    pub chunk_index: usize,

    /// Number of siblings produced from the parent
    pub total_chunks: usize,

    /// Vector attached at ingestion
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_content_rejected() {
        let doc = Document::new("   \n\n  ");
        let err = doc.validate().unwrap_err();
        assert!(err.field_errors().contains_key("content"));
    }

    #[test]
    fn test_empty_id_rejected() {
        let doc = Document::new("Some text").with_id("");
        assert!(doc.validate().is_err());
    }

    #[test]
    fn test_missing_id_is_generated() {
        let doc: Document = serde_json::from_str(r#"{"content": "hello"}"#).unwrap();
        assert_eq!(doc.id.len(), 36);
        assert_eq!(doc.format, SourceFormat::Text);
        assert!(doc.validate().is_ok());
    }

    #[test]
    fn test_format_parses_snake_case() {
        let doc: Document =
            serde_json::from_str(r##"{"id": "d1", "content": "# Title", "format": "markdown"}"##).unwrap();
        assert_eq!(doc.format, SourceFormat::Markdown);
    }
}
