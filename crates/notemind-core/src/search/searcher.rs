//! Hybrid query engine
//!
//! Scores a query lexically (BM25) and semantically (cosine against stored
//! vectors), normalizes each list independently and ranks by a weighted sum.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use super::config::{RankingConfig, ScoreNormalization};
use super::coordinator::IndexCoordinator;
use super::error::SearchResult;
use super::lexical::tokenize;
use super::types::HybridRankedChunk;

pub struct HybridSearcher {
    coordinator: IndexCoordinator,
    ranking: RankingConfig,
}

/// A candidate before hydration
struct Scored {
    id: String,
    lexical: f32,
    semantic: f32,
    hybrid: f32,
}

impl HybridSearcher {
    pub fn new(coordinator: IndexCoordinator, ranking: RankingConfig) -> Self {
        Self {
            coordinator,
            ranking,
        }
    }

    /// Top `top_k` chunks for `query`. An empty query or corpus yields no
    /// results and makes no provider call.
    pub async fn search(&self, query: &str, top_k: usize) -> SearchResult<Vec<HybridRankedChunk>> {
        let query = query.trim();
        if query.is_empty() || top_k == 0 {
            return Ok(vec![]);
        }

        let terms = tokenize(query);
        let lexical = self.coordinator.lexical_scores(&terms);
        let semantic = self.semantic_scores(query).await;
        let ranked = self.rank(&lexical, &semantic, top_k);
        if ranked.is_empty() {
            return Ok(vec![]);
        }

        let ids: Vec<String> = ranked.iter().map(|s| s.id.clone()).collect();
        let mut chunks = self.coordinator.store().get_many(&ids)?;

        let mut results = Vec::with_capacity(ranked.len());
        for scored in ranked {
            let Some(chunk) = chunks.remove(&scored.id) else {
                // Deleted while the query was being embedded
                if !self.coordinator.is_indexed(&scored.id) {
                    log::debug!("[HybridSearcher] Skipping {}, removed during search", scored.id);
                    continue;
                }
                return Err(self.coordinator.resolve_inconsistency(&scored.id));
            };
            results.push(HybridRankedChunk {
                chunk,
                lexical_score: scored.lexical,
                semantic_score: scored.semantic,
                hybrid_score: scored.hybrid,
            });
        }

        log::debug!(
            "[HybridSearcher] \"{}\": {} lexical, {} semantic, {} returned",
            query,
            lexical.len(),
            semantic.len(),
            results.len()
        );
        Ok(results)
    }

    /// Cosine scores, or nothing when no model is active, no vector is
    /// stored yet, or the provider fails
    async fn semantic_scores(&self, query: &str) -> HashMap<String, f32> {
        let Some(model) = self.coordinator.active_model() else {
            return HashMap::new();
        };
        if self.coordinator.vectorized_count() == 0 {
            return HashMap::new();
        }

        let embedder = self.coordinator.embedder();
        match embedder.embed_query(query, &model).await {
            Ok(vector) => self.coordinator.semantic_scores(&vector),
            Err(e) => {
                log::warn!(
                    "[HybridSearcher] Query embedding failed, ranking lexically: {}",
                    e
                );
                HashMap::new()
            }
        }
    }

    fn rank(
        &self,
        lexical: &HashMap<String, f32>,
        semantic: &HashMap<String, f32>,
        top_k: usize,
    ) -> Vec<Scored> {
        let floor = self.ranking.semantic_floor;
        let semantic: HashMap<String, f32> = semantic
            .iter()
            .filter(|(id, score)| lexical.contains_key(*id) || **score > floor)
            .map(|(id, score)| (id.clone(), *score))
            .collect();

        let method = self.ranking.normalization;
        let lexical_norm = normalize(lexical, method);
        let semantic_norm = normalize(&semantic, method);

        let candidates: HashSet<&String> = lexical.keys().chain(semantic.keys()).collect();
        let mut scored: Vec<Scored> = candidates
            .into_iter()
            .map(|id| {
                let nl = lexical_norm.get(id).copied().unwrap_or(0.0);
                let ns = semantic_norm.get(id).copied().unwrap_or(0.0);
                Scored {
                    id: id.clone(),
                    lexical: lexical.get(id).copied().unwrap_or(0.0),
                    semantic: semantic.get(id).copied().unwrap_or(0.0),
                    hybrid: self.ranking.lexical_weight * nl + self.ranking.semantic_weight * ns,
                }
            })
            .collect();

        scored.sort_by(compare_scored);
        scored.truncate(top_k);
        scored
    }
}

/// Hybrid desc, then raw lexical desc, then id asc
fn compare_scored(a: &Scored, b: &Scored) -> Ordering {
    b.hybrid
        .total_cmp(&a.hybrid)
        .then_with(|| b.lexical.total_cmp(&a.lexical))
        .then_with(|| a.id.cmp(&b.id))
}

/// Rescale one score list into [0, 1]
pub fn normalize(scores: &HashMap<String, f32>, method: ScoreNormalization) -> HashMap<String, f32> {
    if scores.is_empty() {
        return HashMap::new();
    }

    match method {
        ScoreNormalization::MinMax => {
            let min = scores.values().copied().fold(f32::INFINITY, f32::min);
            let max = scores.values().copied().fold(f32::NEG_INFINITY, f32::max);
            let range = max - min;
            scores
                .iter()
                .map(|(id, score)| {
                    let normalized = if range > f32::EPSILON {
                        (score - min) / range
                    } else if *score > 0.0 {
                        1.0
                    } else {
                        0.0
                    };
                    (id.clone(), normalized)
                })
                .collect()
        }
        ScoreNormalization::Rank => {
            let mut sorted: Vec<f32> = scores.values().copied().collect();
            sorted.sort_by(|a, b| b.total_cmp(a));
            let n = sorted.len() as f32;
            scores
                .iter()
                .map(|(id, score)| {
                    let higher = sorted.partition_point(|s| s > score) as f32;
                    (id.clone(), 1.0 - higher / n)
                })
                .collect()
        }
    }
}
