//! Request/response contract with the host application

use serde::{Deserialize, Serialize};

use super::config::SearchConfig;
use super::coordinator::IndexCoordinator;
use super::embedding::EmbeddingModelConfig;
use super::error::{SearchError, SearchResult};
use super::searcher::HybridSearcher;
use super::types::{HybridRankedChunk, IndexStatus, MaintenanceReport};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineRequest {
    RebuildLexicalIndex,
    RebuildAllEmbeddings,
    UpdateMissingEmbeddings,
    Search {
        query: String,
        #[serde(default, rename = "topK")]
        top_k: Option<usize>,
    },
    GetIndexStatus,
    SetEmbeddingModel {
        #[serde(default)]
        model: Option<EmbeddingModelConfig>,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<HybridRankedChunk>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<MaintenanceReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<IndexStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EngineResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

/// Dispatches host requests to the coordinator and the searcher
pub struct SearchService {
    coordinator: IndexCoordinator,
    searcher: HybridSearcher,
    default_top_k: usize,
}

impl SearchService {
    pub fn new(coordinator: IndexCoordinator, config: &SearchConfig) -> Self {
        Self {
            searcher: HybridSearcher::new(coordinator.clone(), config.ranking.clone()),
            default_top_k: config.ranking.default_top_k,
            coordinator,
        }
    }

    /// Load configuration and open the on-disk indexes
    pub fn from_config(config: &SearchConfig) -> SearchResult<Self> {
        let coordinator = IndexCoordinator::from_config(config)?;
        Ok(Self::new(coordinator, config))
    }

    pub fn coordinator(&self) -> &IndexCoordinator {
        &self.coordinator
    }

    pub fn searcher(&self) -> &HybridSearcher {
        &self.searcher
    }

    pub async fn handle(&self, request: EngineRequest) -> EngineResponse {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("[SearchService] Request failed: {}", e);
                EngineResponse::failure(e)
            }
        }
    }

    /// Same as [`handle`](Self::handle) over JSON text
    pub async fn handle_json(&self, request: &str) -> String {
        let response = match serde_json::from_str::<EngineRequest>(request) {
            Ok(request) => self.handle(request).await,
            Err(e) => EngineResponse::failure(SearchError::Json(e)),
        };
        serde_json::to_string(&response).unwrap_or_else(|e| {
            serde_json::json!({ "success": false, "error": e.to_string() }).to_string()
        })
    }

    async fn dispatch(&self, request: EngineRequest) -> SearchResult<EngineResponse> {
        match request {
            EngineRequest::RebuildLexicalIndex => {
                self.coordinator.rebuild_lexical()?;
                Ok(EngineResponse::ok())
            }
            EngineRequest::RebuildAllEmbeddings => {
                let report = self.coordinator.rebuild_embeddings().await?;
                Ok(EngineResponse {
                    report: Some(report),
                    ..EngineResponse::ok()
                })
            }
            EngineRequest::UpdateMissingEmbeddings => {
                let report = self.coordinator.update_missing_embeddings().await?;
                Ok(EngineResponse {
                    report: Some(report),
                    ..EngineResponse::ok()
                })
            }
            EngineRequest::Search { query, top_k } => {
                let top_k = top_k.unwrap_or(self.default_top_k);
                let results = self.searcher.search(&query, top_k).await?;
                Ok(EngineResponse {
                    results: Some(results),
                    ..EngineResponse::ok()
                })
            }
            EngineRequest::GetIndexStatus => Ok(EngineResponse {
                status: Some(self.coordinator.status()?),
                ..EngineResponse::ok()
            }),
            EngineRequest::SetEmbeddingModel { model } => {
                // The queued rebuild keeps running after the ticket is dropped
                self.coordinator.set_active_model(model)?;
                Ok(EngineResponse::ok())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request: EngineRequest =
            serde_json::from_str(r#"{"type":"Search","query":"capital","topK":5}"#).unwrap();
        assert_eq!(
            request,
            EngineRequest::Search {
                query: "capital".into(),
                top_k: Some(5)
            }
        );

        let request: EngineRequest =
            serde_json::from_str(r#"{"type":"UpdateMissingEmbeddings"}"#).unwrap();
        assert_eq!(request, EngineRequest::UpdateMissingEmbeddings);

        let request: EngineRequest = serde_json::from_str(
            r#"{"type":"SetEmbeddingModel","model":{"provider":"local","model":"nomic-embed-text"}}"#,
        )
        .unwrap();
        assert!(matches!(
            request,
            EngineRequest::SetEmbeddingModel { model: Some(_) }
        ));
    }

    #[test]
    fn test_response_skips_empty_fields() {
        let json = serde_json::to_value(EngineResponse {
            results: Some(vec![]),
            ..EngineResponse::ok()
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({ "success": true, "results": [] }));

        let json = serde_json::to_value(EngineResponse::failure(SearchError::Busy)).unwrap();
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("already running"));
    }
}
