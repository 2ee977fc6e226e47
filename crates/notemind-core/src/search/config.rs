//! Search configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::embedding::{EmbeddingModelConfig, EmbeddingProvider};
use super::error::{SearchError, SearchResult};
use super::lexical::Bm25Params;

/// Main search configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Embedding provider configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Chunking configuration
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Index maintenance configuration
    #[serde(default)]
    pub indexing: IndexingConfig,

    /// Query-time ranking configuration
    #[serde(default)]
    pub ranking: RankingConfig,

    /// Paths configuration
    #[serde(default)]
    pub paths: PathsConfig,
}

/// Embedding provider configuration.
///
/// No provider means no active embedding model: search falls back to lexical
/// ranking and embedding maintenance reports `NoActiveEmbeddingModel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider name: local, openai, gemini, cohere or custom
    #[serde(default)]
    pub provider: Option<EmbeddingProvider>,

    /// Model id (provider default when omitted)
    #[serde(default)]
    pub model: Option<String>,

    /// API base URL (provider default when omitted)
    #[serde(default)]
    pub api_base: Option<String>,

    /// API key (can also come from the provider's env var)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Expected embedding dimensions
    #[serde(default)]
    pub dimensions: Option<usize>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: None,
            api_base: None,
            api_key: None,
            dimensions: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    /// Resolve the configured model, if any
    pub fn active_model(&self) -> Option<EmbeddingModelConfig> {
        let provider = self.provider?;
        let model = self
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .or_else(|| provider.default_model().map(str::to_string))?;

        Some(EmbeddingModelConfig {
            provider,
            model,
            endpoint: self.api_base.clone().filter(|b| !b.is_empty()),
            api_key: self.api_key.clone().filter(|k| !k.is_empty()),
            dimensions: self.dimensions,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

fn default_timeout_secs() -> u64 {
    60
}

/// Chunking configuration (all sizes in characters)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,

    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,

    /// Trailing sub-split parts shorter than this merge into the previous part
    #[serde(default = "default_min_chunk_chars")]
    pub min_chunk_chars: usize,

    /// Chat turns shorter than this merge with an adjacent same-role turn
    #[serde(default = "default_min_turn_chars")]
    pub min_turn_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: default_max_chunk_chars(),
            overlap_chars: default_overlap_chars(),
            min_chunk_chars: default_min_chunk_chars(),
            min_turn_chars: default_min_turn_chars(),
        }
    }
}

fn default_max_chunk_chars() -> usize {
    1500
}

fn default_overlap_chars() -> usize {
    200
}

fn default_min_chunk_chars() -> usize {
    50
}

fn default_min_turn_chars() -> usize {
    20
}

/// Index maintenance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Texts per provider request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Provider requests in flight per cycle
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Background embedding jobs (after document saves) running at once
    #[serde(default = "default_background_workers")]
    pub background_workers: usize,

    /// Retries for rate-limited or unreachable requests
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Queue a full embeddings rebuild when the active model changes
    #[serde(default = "default_true")]
    pub rebuild_on_model_change: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            background_workers: default_background_workers(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            rebuild_on_model_change: true,
        }
    }
}

impl IndexingConfig {
    /// Delay before retry number `attempt` (0-based). A provider hint wins but
    /// is still capped.
    pub fn backoff(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let cap = Duration::from_millis(self.retry_max_ms);
        if let Some(hint) = hint {
            return hint.min(cap);
        }
        let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_base_ms.saturating_mul(factor)).min(cap)
    }
}

fn default_batch_size() -> usize {
    10 // several hosted APIs cap batch size at 10
}

fn default_concurrency() -> usize {
    3
}

fn default_background_workers() -> usize {
    2
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

/// How each score list is rescaled before the weighted merge
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScoreNormalization {
    /// (score - min) / (max - min)
    #[default]
    MinMax,
    /// 1 - rank / n, ties share a rank
    Rank,
}

/// Query-time ranking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,

    #[serde(default)]
    pub normalization: ScoreNormalization,

    #[serde(default = "default_weight")]
    pub lexical_weight: f32,

    #[serde(default = "default_weight")]
    pub semantic_weight: f32,

    /// Chunks matched only semantically need a cosine above this
    #[serde(default)]
    pub semantic_floor: f32,

    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f32,

    #[serde(default = "default_bm25_b")]
    pub bm25_b: f32,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_top_k(),
            normalization: ScoreNormalization::default(),
            lexical_weight: default_weight(),
            semantic_weight: default_weight(),
            semantic_floor: 0.0,
            bm25_k1: default_bm25_k1(),
            bm25_b: default_bm25_b(),
        }
    }
}

impl RankingConfig {
    pub fn bm25(&self) -> Bm25Params {
        Bm25Params {
            k1: self.bm25_k1,
            b: self.bm25_b,
        }
    }
}

fn default_top_k() -> usize {
    10
}

fn default_weight() -> f32 {
    0.5
}

fn default_bm25_k1() -> f32 {
    1.2
}

fn default_bm25_b() -> f32 {
    0.75
}

/// Paths configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// SQLite chunk store path
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Index metadata path
    #[serde(default)]
    pub index_metadata_path: Option<PathBuf>,
}

impl PathsConfig {
    /// Get chunk store path, using default if not specified
    pub fn get_db_path(&self) -> PathBuf {
        if let Some(ref path) = self.db_path {
            return path.clone();
        }
        SearchConfig::config_dir().join("chunks.db")
    }

    /// Get index metadata path
    pub fn get_index_metadata_path(&self) -> PathBuf {
        if let Some(ref path) = self.index_metadata_path {
            return path.clone();
        }
        SearchConfig::config_dir().join("index-metadata.json")
    }
}

/// Flat config.json written by the host's settings screen
#[derive(Debug, Clone, Default, Deserialize)]
struct HostJsonConfig {
    #[serde(rename = "EMBEDDING_PROVIDER")]
    embedding_provider: Option<String>,
    #[serde(rename = "EMBEDDING_MODEL")]
    embedding_model: Option<String>,
    #[serde(rename = "EMBEDDING_API_BASE")]
    embedding_api_base: Option<String>,
    #[serde(rename = "EMBEDDING_API_KEY")]
    embedding_api_key: Option<String>,
}

impl SearchConfig {
    /// Load configuration from files and environment.
    /// Priority: environment variables > config.json > config.toml > defaults
    pub fn load() -> SearchResult<Self> {
        let mut config = Self::default();

        // 1. config.toml
        let toml_path = Self::toml_config_path();
        if toml_path.exists() {
            let content = std::fs::read_to_string(&toml_path)?;
            match toml::from_str::<SearchConfig>(&content) {
                Ok(parsed) => config = parsed,
                Err(e) => log::warn!("[Config] Ignoring {}: {}", toml_path.display(), e),
            }
        }

        // 2. config.json from the host app
        let json_path = Self::json_config_path();
        if json_path.exists() {
            let content = std::fs::read_to_string(&json_path)?;
            match serde_json::from_str::<HostJsonConfig>(&content) {
                Ok(host) => config.merge_host(host)?,
                Err(e) => log::warn!("[Config] Ignoring {}: {}", json_path.display(), e),
            }
        }

        // 3. Environment variables
        config.merge_host(HostJsonConfig {
            embedding_provider: std::env::var("EMBEDDING_PROVIDER").ok(),
            embedding_model: std::env::var("EMBEDDING_MODEL").ok(),
            embedding_api_base: std::env::var("EMBEDDING_API_BASE").ok(),
            embedding_api_key: std::env::var("EMBEDDING_API_KEY").ok(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn merge_host(&mut self, host: HostJsonConfig) -> SearchResult<()> {
        if let Some(provider) = host.embedding_provider.filter(|p| !p.is_empty()) {
            self.embedding.provider = Some(provider.parse()?);
        }
        if let Some(model) = host.embedding_model.filter(|m| !m.is_empty()) {
            self.embedding.model = Some(model);
        }
        if let Some(base) = host.embedding_api_base.filter(|b| !b.is_empty()) {
            self.embedding.api_base = Some(base);
        }
        if let Some(key) = host.embedding_api_key.filter(|k| !k.is_empty()) {
            self.embedding.api_key = Some(key);
        }
        Ok(())
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> SearchResult<()> {
        let chunking = &self.chunking;
        if chunking.max_chunk_chars == 0 {
            return Err(SearchError::InvalidConfig(
                "chunking.max_chunk_chars must be positive".into(),
            ));
        }
        if chunking.overlap_chars >= chunking.max_chunk_chars {
            return Err(SearchError::InvalidConfig(format!(
                "chunking.overlap_chars ({}) must be smaller than max_chunk_chars ({})",
                chunking.overlap_chars, chunking.max_chunk_chars
            )));
        }
        if self.indexing.batch_size == 0 || self.indexing.concurrency == 0 {
            return Err(SearchError::InvalidConfig(
                "indexing.batch_size and indexing.concurrency must be positive".into(),
            ));
        }
        let ranking = &self.ranking;
        if !(ranking.lexical_weight >= 0.0 && ranking.semantic_weight >= 0.0) {
            return Err(SearchError::InvalidConfig(
                "ranking weights must be non-negative".into(),
            ));
        }
        if let Some(model) = self.embedding.active_model() {
            model.validate()?;
        }
        Ok(())
    }

    /// Base config directory
    pub fn config_dir() -> PathBuf {
        if let Ok(root) = std::env::var("NOTEMIND_ROOT") {
            return PathBuf::from(root);
        }

        dirs::home_dir()
            .map(|h| h.join(".notemind"))
            .unwrap_or_else(|| PathBuf::from(".notemind"))
    }

    /// Host settings file (config.json)
    pub fn json_config_path() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// Engine settings file (config.toml)
    pub fn toml_config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}
