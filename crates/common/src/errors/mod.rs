//! Error types for RagForge components
//!
//! Provides a single error enum with:
//! - Distinct variants for each failure mode of the RAG pipeline
//! - Machine-readable error codes
//! - Classification helpers used by the fallback layers

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    InvalidDocument,
    InvalidFormat,

    // Resource errors (4xxx)
    NotFound,
    SessionNotFound,

    // Store errors (7xxx)
    StoreError,
    StoreTimeout,
    TransactionError,
    WalError,

    // External service errors (8xxx)
    UpstreamError,
    EmbeddingError,
    EmbeddingTimeout,
    VectorIndexError,
    RerankError,
    GenerationError,
    GenerationTimeout,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 1001,
            ErrorCode::InvalidDocument => 1002,
            ErrorCode::InvalidFormat => 1003,

            ErrorCode::NotFound => 4001,
            ErrorCode::SessionNotFound => 4005,

            ErrorCode::StoreError => 7001,
            ErrorCode::StoreTimeout => 7002,
            ErrorCode::TransactionError => 7003,
            ErrorCode::WalError => 7004,

            ErrorCode::UpstreamError => 8001,
            ErrorCode::EmbeddingError => 8002,
            ErrorCode::EmbeddingTimeout => 8003,
            ErrorCode::VectorIndexError => 8004,
            ErrorCode::RerankError => 8005,
            ErrorCode::GenerationError => 8006,
            ErrorCode::GenerationTimeout => 8007,

            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Invalid document {id}: {message}")]
    InvalidDocument { id: String, message: String },

    #[error("Invalid format: {message}")]
    InvalidFormat { message: String },

    // Resource errors
    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound { resource_type: String, id: String },

    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    // Store errors
    #[error("Store error: {message}")]
    Store { message: String },

    #[error("Store operation timed out after {timeout_ms}ms")]
    StoreTimeout { timeout_ms: u64 },

    #[error("Transaction {id} failed: {message}")]
    Transaction { id: String, message: String },

    #[error("Write-ahead log error: {message}")]
    Wal { message: String },

    // External service errors
    #[error("Embedding service error: {message}")]
    EmbeddingError { message: String },

    #[error("Embedding timeout after {timeout_ms}ms")]
    EmbeddingTimeout { timeout_ms: u64 },

    #[error("Vector index error: {message}")]
    VectorIndex { message: String },

    #[error("Rerank error: {message}")]
    Rerank { message: String },

    #[error("Generation error: {message}")]
    Generation { message: String },

    #[error("Generation timed out after {timeout_secs}s")]
    GenerationTimeout { timeout_secs: u64 },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::InvalidDocument { .. } => ErrorCode::InvalidDocument,
            AppError::InvalidFormat { .. } => ErrorCode::InvalidFormat,
            AppError::NotFound { .. } => ErrorCode::NotFound,
            AppError::SessionNotFound { .. } => ErrorCode::SessionNotFound,
            AppError::Store { .. } => ErrorCode::StoreError,
            AppError::StoreTimeout { .. } => ErrorCode::StoreTimeout,
            AppError::Transaction { .. } => ErrorCode::TransactionError,
            AppError::Wal { .. } => ErrorCode::WalError,
            AppError::EmbeddingError { .. } => ErrorCode::EmbeddingError,
            AppError::EmbeddingTimeout { .. } => ErrorCode::EmbeddingTimeout,
            AppError::VectorIndex { .. } => ErrorCode::VectorIndexError,
            AppError::Rerank { .. } => ErrorCode::RerankError,
            AppError::Generation { .. } => ErrorCode::GenerationError,
            AppError::GenerationTimeout { .. } => ErrorCode::GenerationTimeout,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Transient backend failures that the fallback layers absorb
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Store { .. }
                | AppError::StoreTimeout { .. }
                | AppError::Transaction { .. }
                | AppError::EmbeddingError { .. }
                | AppError::EmbeddingTimeout { .. }
                | AppError::VectorIndex { .. }
                | AppError::HttpClient(_)
        )
    }

    /// Errors allowed to reach the request boundary
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            AppError::GenerationTimeout { .. }
                | AppError::NotFound { .. }
                | AppError::SessionNotFound { .. }
                | AppError::Validation { .. }
                | AppError::InvalidDocument { .. }
        )
    }
}

/// Structured error payload carried by responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&AppError> for ErrorDetails {
    fn from(err: &AppError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Wal {
            message: err.to_string(),
        }
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::Store {
            message: err.to_string(),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        let field = err.field_errors().keys().next().map(|f| f.to_string());
        AppError::Validation {
            message: err.to_string(),
            field,
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration {
            message: err.to_string(),
        }
    }
}
