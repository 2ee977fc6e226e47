//! Error types for the search engine

use std::time::Duration;

use thiserror::Error;

/// Failure of a single embedding provider call.
///
/// Every variant is recoverable by trying again later; the coordinator decides
/// whether and when.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("embedding provider rejected the credentials: {0}")]
    Unauthenticated(String),

    #[error("embedding provider rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    #[error("embedding provider unreachable: {0}")]
    Unreachable(String),

    #[error("malformed embedding response: {0}")]
    MalformedResponse(String),

    #[error("embedding request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl ProviderError {
    /// Transient failures worth another attempt within the same cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Unreachable(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("no active embedding model configured")]
    NoActiveEmbeddingModel,

    #[error("index inconsistency: chunk {chunk_id} (parent {parent_id}) is indexed but not stored")]
    IndexInconsistency { chunk_id: String, parent_id: String },

    #[error("another index maintenance operation is already running")]
    Busy,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("background task failed: {0}")]
    Task(String),
}

pub type SearchResult<T> = std::result::Result<T, SearchError>;
