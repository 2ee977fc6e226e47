//! In-memory vector store
//!
//! Every registered chunk is either MISSING or holds one vector of the store's
//! dimensionality. Durable copies live in the chunk store.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingState {
    Missing,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("vector has {actual} dimensions, store holds {expected}")]
pub struct DimensionMismatch {
    pub expected: usize,
    pub actual: usize,
}

#[derive(Debug, Clone)]
struct Entry {
    /// Bumped on every (re-)registration
    revision: u64,
    vector: Option<Vec<f32>>,
}

#[derive(Debug, Default)]
pub struct VectorStore {
    entries: HashMap<String, Entry>,
    /// Fixed by the first stored vector
    dimensions: Option<usize>,
    next_revision: u64,
}

impl VectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a chunk as MISSING. Returns its new revision.
    pub fn register(&mut self, chunk_id: &str) -> u64 {
        self.next_revision += 1;
        let revision = self.next_revision;
        self.entries.insert(
            chunk_id.to_string(),
            Entry {
                revision,
                vector: None,
            },
        );
        revision
    }

    /// Store a vector for a registered chunk regardless of revision.
    /// Returns false when the chunk is not registered.
    pub fn set(&mut self, chunk_id: &str, vector: Vec<f32>) -> Result<bool, DimensionMismatch> {
        self.check_dimensions(&vector)?;
        let Some(entry) = self.entries.get_mut(chunk_id) else {
            return Ok(false);
        };
        entry.vector = Some(vector);
        self.fix_dimensions();
        Ok(true)
    }

    /// Store a vector computed for `revision`. Refused (false) when the chunk
    /// was removed, re-registered since, or already has a vector.
    pub fn commit(
        &mut self,
        chunk_id: &str,
        revision: u64,
        vector: Vec<f32>,
    ) -> Result<bool, DimensionMismatch> {
        match self.entries.get(chunk_id) {
            Some(entry) if entry.revision == revision && entry.vector.is_none() => {}
            _ => return Ok(false),
        }
        self.set(chunk_id, vector)
    }

    pub fn remove(&mut self, chunk_id: &str) -> bool {
        self.entries.remove(chunk_id).is_some()
    }

    /// Sorted ids of chunks awaiting a vector
    pub fn missing_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.vector.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Missing chunks with the revision a vector must be committed against
    pub fn pending(&self) -> Vec<(String, u64)> {
        let mut pending: Vec<(String, u64)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.vector.is_none())
            .map(|(id, e)| (id.clone(), e.revision))
            .collect();
        pending.sort();
        pending
    }

    /// Clear everything and register `chunk_ids` as MISSING
    pub fn rebuild_all<I, S>(&mut self, chunk_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.entries.clear();
        self.dimensions = None;
        for id in chunk_ids {
            self.register(id.as_ref());
        }
    }

    /// Drop every vector but keep every registration (with fresh revisions)
    pub fn mark_all_missing(&mut self) {
        for entry in self.entries.values_mut() {
            self.next_revision += 1;
            entry.revision = self.next_revision;
            entry.vector = None;
        }
        self.dimensions = None;
    }

    /// Cosine similarity of the query against every stored vector.
    /// MISSING chunks are skipped; a query of the wrong dimensionality scores nothing.
    pub fn similarity(&self, query: &[f32]) -> HashMap<String, f32> {
        if self.dimensions.is_some_and(|d| d != query.len()) {
            log::warn!(
                "[VectorStore] Query has {} dimensions, store holds {:?}",
                query.len(),
                self.dimensions
            );
            return HashMap::new();
        }

        self.entries
            .iter()
            .filter_map(|(id, e)| {
                let vector = e.vector.as_deref()?;
                cosine_similarity(query, vector).map(|score| (id.clone(), score))
            })
            .collect()
    }

    pub fn state(&self, chunk_id: &str) -> Option<EmbeddingState> {
        self.entries.get(chunk_id).map(|e| match e.vector {
            Some(_) => EmbeddingState::Ready,
            None => EmbeddingState::Missing,
        })
    }

    pub fn vector(&self, chunk_id: &str) -> Option<&[f32]> {
        self.entries.get(chunk_id)?.vector.as_deref()
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.entries.contains_key(chunk_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn vectorized_count(&self) -> usize {
        self.entries.values().filter(|e| e.vector.is_some()).count()
    }

    pub fn missing_count(&self) -> usize {
        self.len() - self.vectorized_count()
    }

    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<(), DimensionMismatch> {
        match self.dimensions {
            Some(expected) if expected != vector.len() => Err(DimensionMismatch {
                expected,
                actual: vector.len(),
            }),
            _ => Ok(()),
        }
    }

    fn fix_dimensions(&mut self) {
        if self.dimensions.is_none() {
            self.dimensions = self
                .entries
                .values()
                .find_map(|e| e.vector.as_ref().map(Vec::len));
        }
    }
}

/// None when either vector has zero norm or the lengths differ
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}
