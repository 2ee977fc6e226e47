//! notemind search module
//!
//! Hybrid retrieval over notes and chat conversations.
//!
//! ## Features
//!
//! - Markdown-aware note chunking and per-turn chat chunking
//! - BM25 lexical index
//! - Vector store fed by pluggable embedding providers (local server, OpenAI,
//!   Gemini, Cohere, any OpenAI-compatible endpoint)
//! - Hybrid ranking with independent score normalization
//! - Event-driven index synchronization
//!
//! ## Usage
//!
//! ```rust,ignore
//! use notemind_core::search::{EngineRequest, SearchConfig, SearchService};
//!
//! let config = SearchConfig::load()?;
//! let service = SearchService::from_config(&config)?;
//! let response = service
//!     .handle(EngineRequest::Search {
//!         query: "capital of France".into(),
//!         top_k: Some(5),
//!     })
//!     .await;
//! ```

mod chunk_store;
mod chunker;
mod config;
mod coordinator;
mod embedding;
mod error;
mod index_sync;
mod lexical;
mod messages;
mod metadata;
mod searcher;
mod types;
mod vector_store;

#[cfg(test)]
mod tests;

pub use chunk_store::ChunkStore;
pub use chunker::Chunker;
pub use config::{
    ChunkingConfig, EmbeddingConfig, IndexingConfig, PathsConfig, RankingConfig,
    ScoreNormalization, SearchConfig,
};
pub use coordinator::{EmbeddingTicket, IndexCoordinator, SaveOutcome};
pub use embedding::{Embedder, EmbeddingClient, EmbeddingModelConfig, EmbeddingProvider, HostedApi};
pub use error::{ProviderError, SearchError, SearchResult};
pub use index_sync::IndexSyncService;
pub use lexical::{tokenize, Bm25Params, LexicalIndex};
pub use messages::{EngineRequest, EngineResponse, SearchService};
pub use metadata::{IndexMetadata, IndexStamp};
pub use searcher::{normalize, HybridSearcher};
pub use types::*;
pub use vector_store::{cosine_similarity, DimensionMismatch, EmbeddingState, VectorStore};
