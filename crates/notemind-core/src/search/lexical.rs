//! BM25 lexical index over chunk text

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use super::types::{Chunk, ChunkOwner};

/// Ideographic and kana characters become one token each; other letter and
/// digit runs become one token per run.
static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"[\p{Han}\p{Hiragana}\p{Katakana}]|[[\p{L}\p{M}\p{N}]&&[^\p{Han}\p{Hiragana}\p{Katakana}]]+",
    )
    .expect("token pattern is valid")
});

/// Lowercased tokens with punctuation removed. Used for both indexing and
/// queries.
pub fn tokenize(text: &str) -> Vec<String> {
    TOKEN_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

#[derive(Debug, Clone)]
struct IndexedChunk {
    owner: ChunkOwner,
    length: usize,
    term_freqs: HashMap<String, u32>,
}

/// Term statistics per chunk. Not synchronized; the coordinator owns the lock.
#[derive(Debug, Clone, Default)]
pub struct LexicalIndex {
    params: Bm25Params,
    /// term -> chunk id -> term frequency
    postings: HashMap<String, HashMap<String, u32>>,
    chunks: HashMap<String, IndexedChunk>,
    total_length: usize,
}

impl LexicalIndex {
    pub fn new(params: Bm25Params) -> Self {
        Self {
            params,
            ..Default::default()
        }
    }

    /// Build a complete index from scratch
    pub fn build<'a>(params: Bm25Params, chunks: impl IntoIterator<Item = &'a Chunk>) -> Self {
        let mut index = Self::new(params);
        index.rebuild_all(chunks);
        index
    }

    pub fn params(&self) -> Bm25Params {
        self.params
    }

    /// Index a chunk, replacing any previous version with the same id
    pub fn add_or_replace(&mut self, chunk: &Chunk) {
        self.remove(&chunk.id);

        let tokens = tokenize(&chunk.index_text());
        let mut term_freqs: HashMap<String, u32> = HashMap::new();
        for token in tokens.iter() {
            *term_freqs.entry(token.clone()).or_insert(0) += 1;
        }

        for (term, tf) in &term_freqs {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(chunk.id.clone(), *tf);
        }

        self.total_length += tokens.len();
        self.chunks.insert(
            chunk.id.clone(),
            IndexedChunk {
                owner: chunk.owner(),
                length: tokens.len(),
                term_freqs,
            },
        );
    }

    /// Returns false when the id was not indexed
    pub fn remove(&mut self, chunk_id: &str) -> bool {
        let Some(indexed) = self.chunks.remove(chunk_id) else {
            return false;
        };

        for term in indexed.term_freqs.keys() {
            if let Some(posting) = self.postings.get_mut(term) {
                posting.remove(chunk_id);
                if posting.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        self.total_length -= indexed.length;
        true
    }

    /// Clear and re-index every chunk
    pub fn rebuild_all<'a>(&mut self, chunks: impl IntoIterator<Item = &'a Chunk>) {
        self.postings.clear();
        self.chunks.clear();
        self.total_length = 0;
        for chunk in chunks {
            self.add_or_replace(chunk);
        }
    }

    /// BM25 score of every chunk that contains at least one query term.
    /// Duplicate terms count once.
    pub fn score(&self, terms: &[String]) -> HashMap<String, f32> {
        let mut scores: HashMap<String, f32> = HashMap::new();
        if self.chunks.is_empty() {
            return scores;
        }

        let n = self.chunks.len() as f32;
        let avg_len = (self.total_length as f32 / n).max(f32::EPSILON);
        let Bm25Params { k1, b } = self.params;

        let unique: HashSet<&str> = terms.iter().map(String::as_str).collect();
        for term in unique {
            let Some(posting) = self.postings.get(term) else {
                continue;
            };
            let df = posting.len() as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();

            for (chunk_id, tf) in posting {
                let doc_len = self.chunks.get(chunk_id).map(|c| c.length).unwrap_or(0) as f32;
                let tf = *tf as f32;
                let score = idf * (tf * (k1 + 1.0)) / (tf + k1 * (1.0 - b + b * doc_len / avg_len));
                *scores.entry(chunk_id.clone()).or_insert(0.0) += score;
            }
        }

        scores
    }

    pub fn score_query(&self, query: &str) -> HashMap<String, f32> {
        self.score(&tokenize(query))
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.chunks.contains_key(chunk_id)
    }

    pub fn owner(&self, chunk_id: &str) -> Option<&ChunkOwner> {
        self.chunks.get(chunk_id).map(|c| &c.owner)
    }

    /// Every indexed id belonging to `owner`
    pub fn owned_by(&self, owner: &ChunkOwner) -> Vec<String> {
        self.chunks
            .iter()
            .filter(|(_, c)| &c.owner == owner)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.chunks.keys()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
