//! Index metadata file (index-metadata.json)

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::embedding::EmbeddingModelConfig;
use super::error::SearchResult;

const ERROR_PREFIX: &str = "error: ";

/// When an index was last rebuilt or updated.
/// Stored as null, an RFC 3339 timestamp, or an `error: ...` marker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum IndexStamp {
    #[default]
    Never,
    At(DateTime<Utc>),
    Failed(String),
}

impl IndexStamp {
    pub fn now() -> Self {
        IndexStamp::At(Utc::now())
    }

    pub fn failed(message: impl fmt::Display) -> Self {
        IndexStamp::Failed(message.to_string())
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            IndexStamp::At(at) => Some(*at),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, IndexStamp::Failed(_))
    }
}

impl Serialize for IndexStamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            IndexStamp::Never => serializer.serialize_none(),
            IndexStamp::At(at) => serializer.serialize_some(&at.to_rfc3339()),
            IndexStamp::Failed(message) => {
                serializer.serialize_some(&format!("{ERROR_PREFIX}{message}"))
            }
        }
    }
}

impl<'de> Deserialize<'de> for IndexStamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let Some(value) = Option::<String>::deserialize(deserializer)? else {
            return Ok(IndexStamp::Never);
        };
        if let Ok(at) = DateTime::parse_from_rfc3339(&value) {
            return Ok(IndexStamp::At(at.with_timezone(&Utc)));
        }
        let message = value.strip_prefix(ERROR_PREFIX).unwrap_or(&value);
        Ok(IndexStamp::Failed(message.to_string()))
    }
}

/// Process-wide index bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMetadata {
    #[serde(default)]
    pub bm25_last_rebuild: IndexStamp,
    #[serde(default)]
    pub embeddings_last_rebuild: IndexStamp,
    #[serde(default)]
    pub embeddings_last_update: IndexStamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_model: Option<EmbeddingModelConfig>,
}

impl IndexMetadata {
    /// Read the metadata file; a missing or unreadable file yields defaults
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        let parsed = std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|content| serde_json::from_str(&content).map_err(|e| e.to_string()));
        match parsed {
            Ok(metadata) => metadata,
            Err(e) => {
                log::warn!("[IndexMetadata] Ignoring {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Write the metadata file. Credentials are never written.
    pub fn save(&self, path: &Path) -> SearchResult<()> {
        let mut on_disk = self.clone();
        if let Some(model) = on_disk.active_model.as_mut() {
            model.api_key = None;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&on_disk)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::embedding::EmbeddingProvider;

    #[test]
    fn test_stamp_serialization() {
        assert_eq!(serde_json::to_string(&IndexStamp::Never).unwrap(), "null");
        assert_eq!(
            serde_json::to_string(&IndexStamp::failed("no model")).unwrap(),
            "\"error: no model\""
        );

        let at: IndexStamp = serde_json::from_str("\"2025-03-01T10:00:00+00:00\"").unwrap();
        assert!(at.timestamp().is_some());
        let failed: IndexStamp = serde_json::from_str("\"error: boom\"").unwrap();
        assert_eq!(failed, IndexStamp::Failed("boom".into()));
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = IndexMetadata::load(&dir.path().join("absent.json"));
        assert_eq!(metadata, IndexMetadata::default());
    }

    #[test]
    fn test_save_and_load_strips_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("index-metadata.json");
        let metadata = IndexMetadata {
            bm25_last_rebuild: IndexStamp::now(),
            embeddings_last_rebuild: IndexStamp::failed("provider unreachable"),
            embeddings_last_update: IndexStamp::Never,
            active_model: Some(
                EmbeddingModelConfig::new(EmbeddingProvider::LocalServer, "nomic-embed-text")
                    .with_api_key("secret"),
            ),
        };
        metadata.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("secret"));
        assert!(raw.contains("bm25LastRebuild"));

        let loaded = IndexMetadata::load(&path);
        assert!(loaded.bm25_last_rebuild.timestamp().is_some());
        assert!(loaded.embeddings_last_rebuild.is_failed());
        assert_eq!(loaded.embeddings_last_update, IndexStamp::Never);
        assert_eq!(loaded.active_model.unwrap().model, "nomic-embed-text");
    }

    #[test]
    fn test_corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index-metadata.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(IndexMetadata::load(&path), IndexMetadata::default());
    }
}
