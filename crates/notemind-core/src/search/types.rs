//! Common types for search module

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::metadata::IndexStamp;
use crate::{DocumentKind, Role};

/// Parent document fields copied onto every chunk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentMeta {
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

/// Where a chunk sits inside its parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChunkLocation {
    Note {
        /// Ancestor heading texts, outermost first
        #[serde(rename = "headingPath", default)]
        heading_path: Vec<String>,
    },
    Chat {
        #[serde(rename = "turnIndex")]
        turn_index: usize,
        /// Last merged turn (inclusive); equals `turn_index` for a single turn
        #[serde(rename = "turnEnd")]
        turn_end: usize,
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
}

/// The smallest indexed unit of text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// `<kind>chunk_<parentId>_<ordinal>[_<part>]`, parent id escaped
    pub id: String,
    pub parent_id: String,
    pub kind: DocumentKind,
    /// Section index (notes) or first turn index (chats)
    pub ordinal: usize,
    pub content: String,
    pub char_count: usize,
    pub location: ChunkLocation,
    pub parent: ParentMeta,
}

impl Chunk {
    pub fn owner(&self) -> ChunkOwner {
        ChunkOwner::new(self.kind, self.parent_id.clone())
    }

    pub fn heading_path(&self) -> &[String] {
        match &self.location {
            ChunkLocation::Note { heading_path } => heading_path,
            ChunkLocation::Chat { .. } => &[],
        }
    }

    /// Text fed to both the lexical index and the embedding provider
    pub fn index_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(3 + self.parent.tags.len());
        if !self.parent.title.trim().is_empty() {
            parts.push(&self.parent.title);
        }
        parts.extend(self.parent.tags.iter().map(String::as_str));
        parts.extend(self.heading_path().iter().map(String::as_str));
        parts.push(&self.content);
        parts.join("\n")
    }
}

/// Build a chunk id. `_` and `%` in the parent id are percent-encoded so
/// that no two (parent, ordinal, part) triples share an id.
pub fn chunk_id(kind: DocumentKind, parent_id: &str, ordinal: usize, part: Option<usize>) -> String {
    let parent_id = escape_parent_id(parent_id);
    match part {
        Some(part) => format!("{}chunk_{}_{}_{}", kind, parent_id, ordinal, part),
        None => format!("{}chunk_{}_{}", kind, parent_id, ordinal),
    }
}

fn escape_parent_id(parent_id: &str) -> Cow<'_, str> {
    if !parent_id.contains(['_', '%']) {
        return Cow::Borrowed(parent_id);
    }
    let mut escaped = String::with_capacity(parent_id.len() + 8);
    for c in parent_id.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '_' => escaped.push_str("%5F"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

/// Chunker output for one document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkSet {
    pub chunks: Vec<Chunk>,
    pub chunk_ids: Vec<String>,
}

impl ChunkSet {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        let chunk_ids = chunks.iter().map(|c| c.id.clone()).collect();
        Self { chunks, chunk_ids }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }
}

/// The parent a chunk belongs to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkOwner {
    pub kind: DocumentKind,
    pub parent_id: String,
}

impl ChunkOwner {
    pub fn new(kind: DocumentKind, parent_id: impl Into<String>) -> Self {
        Self {
            kind,
            parent_id: parent_id.into(),
        }
    }
}

/// A ranked query result. Never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HybridRankedChunk {
    #[serde(flatten)]
    pub chunk: Chunk,
    /// Raw BM25 score (0 when the chunk matched only semantically)
    pub lexical_score: f32,
    /// Raw cosine similarity (0 when not computed)
    pub semantic_score: f32,
    pub hybrid_score: f32,
}

/// Outcome of an embedding maintenance cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    /// Chunks that received a vector
    pub embedded: usize,
    /// Chunks left MISSING after a provider failure
    pub failed: usize,
    /// Vectors discarded because their chunk changed or the model switched
    pub skipped_stale: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RebuildTarget {
    Lexical,
    Embeddings,
}

/// Maintenance state of the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "camelCase")]
pub enum CoordinatorState {
    #[default]
    Idle,
    Rebuilding(RebuildTarget),
    UpdatingMissing,
    Error(String),
}

/// Snapshot returned by `status()`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStatus {
    pub state: CoordinatorState,
    pub bm25_last_rebuild: IndexStamp,
    pub embeddings_last_rebuild: IndexStamp,
    pub embeddings_last_update: IndexStamp,
    /// Fingerprint of the active model
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_model: Option<String>,
    pub chunk_count: usize,
    pub vectorized_count: usize,
    pub missing_count: usize,
}

/// Discrepancies between the chunk store and the in-memory indexes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyReport {
    pub stored_chunks: usize,
    /// Indexed ids with no stored chunk
    pub orphaned: Vec<String>,
    /// Stored chunks absent from an index
    pub unindexed: Vec<String>,
    pub resynced_parents: Vec<ChunkOwner>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.orphaned.is_empty() && self.unindexed.is_empty()
    }
}
