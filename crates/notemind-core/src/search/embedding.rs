//! Embedding provider adapters
//!
//! [`Embedder`] is the seam the coordinator and the searcher talk to.
//! [`EmbeddingClient`] implements it over HTTP for every [`EmbeddingProvider`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};

use super::error::{ProviderError, SearchError, SearchResult};

/// Most embedding APIs cap input around 8K tokens; chars are a safe proxy
const MAX_INPUT_CHARS: usize = 8000;

/// Longest `Retry-After` honored, in seconds
const MAX_RETRY_AFTER_SECS: f64 = 86_400.0;

/// Hosted embedding APIs with their own wire format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostedApi {
    OpenAi,
    Gemini,
    Cohere,
}

/// Where embeddings come from. Parsed once from the configured provider name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EmbeddingProvider {
    /// Ollama-compatible server on the user's machine
    LocalServer,
    HostedApi(HostedApi),
    /// Any OpenAI-compatible endpoint
    Custom,
}

impl EmbeddingProvider {
    pub fn name(&self) -> &'static str {
        match self {
            EmbeddingProvider::LocalServer => "local",
            EmbeddingProvider::HostedApi(HostedApi::OpenAi) => "openai",
            EmbeddingProvider::HostedApi(HostedApi::Gemini) => "gemini",
            EmbeddingProvider::HostedApi(HostedApi::Cohere) => "cohere",
            EmbeddingProvider::Custom => "custom",
        }
    }

    pub fn default_endpoint(&self) -> Option<&'static str> {
        match self {
            EmbeddingProvider::LocalServer => Some("http://localhost:11434"),
            EmbeddingProvider::HostedApi(HostedApi::OpenAi) => Some("https://api.openai.com/v1"),
            EmbeddingProvider::HostedApi(HostedApi::Gemini) => {
                Some("https://generativelanguage.googleapis.com/v1beta")
            }
            EmbeddingProvider::HostedApi(HostedApi::Cohere) => Some("https://api.cohere.com/v1"),
            EmbeddingProvider::Custom => None,
        }
    }

    pub fn default_model(&self) -> Option<&'static str> {
        match self {
            EmbeddingProvider::LocalServer => Some("nomic-embed-text"),
            EmbeddingProvider::HostedApi(HostedApi::OpenAi) => Some("text-embedding-3-small"),
            EmbeddingProvider::HostedApi(HostedApi::Gemini) => Some("text-embedding-004"),
            EmbeddingProvider::HostedApi(HostedApi::Cohere) => Some("embed-english-v3.0"),
            EmbeddingProvider::Custom => None,
        }
    }

    fn api_key_env(&self) -> Option<&'static str> {
        match self {
            EmbeddingProvider::HostedApi(HostedApi::OpenAi) => Some("OPENAI_API_KEY"),
            EmbeddingProvider::HostedApi(HostedApi::Gemini) => Some("GEMINI_API_KEY"),
            EmbeddingProvider::HostedApi(HostedApi::Cohere) => Some("COHERE_API_KEY"),
            EmbeddingProvider::LocalServer | EmbeddingProvider::Custom => None,
        }
    }

    fn requires_api_key(&self) -> bool {
        matches!(self, EmbeddingProvider::HostedApi(_))
    }
}

impl FromStr for EmbeddingProvider {
    type Err = SearchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" | "local_server" | "ollama" => Ok(EmbeddingProvider::LocalServer),
            "openai" => Ok(EmbeddingProvider::HostedApi(HostedApi::OpenAi)),
            "gemini" | "google" => Ok(EmbeddingProvider::HostedApi(HostedApi::Gemini)),
            "cohere" => Ok(EmbeddingProvider::HostedApi(HostedApi::Cohere)),
            "custom" | "openai_compatible" => Ok(EmbeddingProvider::Custom),
            other => Err(SearchError::InvalidConfig(format!(
                "unknown embedding provider \"{other}\""
            ))),
        }
    }
}

impl TryFrom<String> for EmbeddingProvider {
    type Error = SearchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EmbeddingProvider> for String {
    fn from(provider: EmbeddingProvider) -> Self {
        provider.name().to_string()
    }
}

impl fmt::Display for EmbeddingProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The active embedding model: provider, model id, endpoint and credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingModelConfig {
    pub provider: EmbeddingProvider,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
}

impl EmbeddingModelConfig {
    pub fn new(provider: EmbeddingProvider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            endpoint: None,
            api_key: None,
            dimensions: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    pub fn validate(&self) -> SearchResult<()> {
        if self.model.trim().is_empty() {
            return Err(SearchError::InvalidConfig("embedding model id is empty".into()));
        }
        self.endpoint().map(|_| ())
    }

    /// Base URL without trailing slash
    pub fn endpoint(&self) -> SearchResult<String> {
        self.endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .or_else(|| self.provider.default_endpoint())
            .map(|e| e.trim().trim_end_matches('/').to_string())
            .ok_or_else(|| {
                SearchError::InvalidConfig(format!(
                    "provider \"{}\" needs an explicit endpoint",
                    self.provider
                ))
            })
    }

    /// Identity of the vector space. Vectors from different fingerprints are
    /// not comparable; the credential is deliberately not part of it.
    pub fn fingerprint(&self) -> String {
        let endpoint = self.endpoint().unwrap_or_default();
        match self.dimensions {
            Some(d) => format!("{}:{}@{}#{}", self.provider, self.model, endpoint, d),
            None => format!("{}:{}@{}", self.provider, self.model, endpoint),
        }
    }

    /// Get API key from config or environment
    pub fn api_key(&self) -> Option<String> {
        if let Some(ref key) = self.api_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }

        self.provider
            .api_key_env()
            .and_then(|name| std::env::var(name).ok())
            .or_else(|| std::env::var("EMBEDDING_API_KEY").ok())
            .filter(|key| !key.is_empty())
    }
}

/// Whether a text is indexed or used to search. Providers with asymmetric
/// models embed the two differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmbeddingPurpose {
    Document,
    Query,
}

impl EmbeddingPurpose {
    fn cohere_input_type(self) -> &'static str {
        match self {
            EmbeddingPurpose::Document => "search_document",
            EmbeddingPurpose::Query => "search_query",
        }
    }

    fn gemini_task_type(self) -> &'static str {
        match self {
            EmbeddingPurpose::Document => "RETRIEVAL_DOCUMENT",
            EmbeddingPurpose::Query => "RETRIEVAL_QUERY",
        }
    }
}

/// Uniform embedding capability over every provider.
///
/// Implementations never retry; callers own the retry policy.
pub trait Embedder: Send + Sync {
    /// One document vector per input text, in input order
    fn embed_batch<'a>(
        &'a self,
        texts: &'a [String],
        model: &'a EmbeddingModelConfig,
    ) -> BoxFuture<'a, Result<Vec<Vec<f32>>, ProviderError>>;

    fn embed<'a>(
        &'a self,
        text: &'a str,
        model: &'a EmbeddingModelConfig,
    ) -> BoxFuture<'a, Result<Vec<f32>, ProviderError>> {
        Box::pin(async move {
            let texts = [text.to_string()];
            let vectors = self.embed_batch(&texts, model).await?;
            vectors.into_iter().next().ok_or_else(|| {
                ProviderError::MalformedResponse("no embedding returned".to_string())
            })
        })
    }

    /// Embed a search query. Symmetric models fall back to [`embed`](Self::embed).
    fn embed_query<'a>(
        &'a self,
        query: &'a str,
        model: &'a EmbeddingModelConfig,
    ) -> BoxFuture<'a, Result<Vec<f32>, ProviderError>> {
        self.embed(query, model)
    }
}

// OpenAI-compatible wire format (OpenAI, custom endpoints)

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    input: &'a [String],
    /// Only sent for models that support it (e.g. text-embedding-3-*)
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbedding {
    embedding: Vec<f32>,
    index: usize,
}

// Ollama /api/embed

#[derive(Debug, Serialize)]
struct LocalRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct LocalResponse {
    embeddings: Vec<Vec<f32>>,
}

// Gemini batchEmbedContents

#[derive(Debug, Serialize)]
struct GeminiBatchRequest<'a> {
    requests: Vec<GeminiEmbedRequest<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiEmbedRequest<'a> {
    model: &'a str,
    content: GeminiContent<'a>,
    task_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_dimensionality: Option<usize>,
}

#[derive(Debug, Serialize)]
struct GeminiContent<'a> {
    parts: [GeminiPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GeminiBatchResponse {
    embeddings: Vec<GeminiEmbedding>,
}

#[derive(Debug, Deserialize)]
struct GeminiEmbedding {
    values: Vec<f32>,
}

// Cohere /embed

#[derive(Debug, Serialize)]
struct CohereRequest<'a> {
    model: &'a str,
    texts: &'a [String],
    input_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct CohereResponse {
    embeddings: Vec<Vec<f32>>,
}

/// HTTP embedding client for every [`EmbeddingProvider`]
pub struct EmbeddingClient {
    client: Client,
    /// Dimensions seen in the last successful response (0 = none yet)
    detected_dimensions: AtomicUsize,
}

impl EmbeddingClient {
    /// Create a new embedding client
    pub fn new(timeout: Duration) -> SearchResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(SearchError::Http)?;

        Ok(Self {
            client,
            detected_dimensions: AtomicUsize::new(0),
        })
    }

    async fn request_batch(
        &self,
        texts: &[String],
        model: &EmbeddingModelConfig,
        purpose: EmbeddingPurpose,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let endpoint = model
            .endpoint()
            .map_err(|e| ProviderError::Unreachable(e.to_string()))?;
        let api_key = model.api_key();
        if api_key.is_none() && model.provider.requires_api_key() {
            return Err(ProviderError::Unauthenticated(format!(
                "no API key configured for {}",
                model.provider
            )));
        }

        let inputs: Vec<String> = texts.iter().map(|t| truncate_input(t)).collect();

        let vectors = match model.provider {
            EmbeddingProvider::LocalServer => {
                self.local_server(&endpoint, model, &inputs).await?
            }
            EmbeddingProvider::HostedApi(HostedApi::OpenAi) | EmbeddingProvider::Custom => {
                self.openai_compatible(&endpoint, model, api_key.as_deref(), &inputs)
                    .await?
            }
            EmbeddingProvider::HostedApi(HostedApi::Gemini) => {
                self.gemini(&endpoint, model, api_key.as_deref(), &inputs, purpose)
                    .await?
            }
            EmbeddingProvider::HostedApi(HostedApi::Cohere) => {
                self.cohere(&endpoint, model, api_key.as_deref(), &inputs, purpose)
                    .await?
            }
        };

        let dimensions = validate_vectors(&vectors, texts.len(), model.dimensions)?;
        let previous = self.detected_dimensions.swap(dimensions, Ordering::Relaxed);
        if previous == 0 {
            log::info!("[Embedding] Detected embedding dimensions: {}", dimensions);
        } else if previous != dimensions {
            log::warn!(
                "[Embedding] Dimensions changed from {} to {} ({})",
                previous,
                dimensions,
                model.fingerprint()
            );
        }

        Ok(vectors)
    }

    async fn local_server(
        &self,
        endpoint: &str,
        model: &EmbeddingModelConfig,
        inputs: &[String],
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let request = LocalRequest {
            model: &model.model,
            input: inputs,
        };
        let body = self
            .send(self.client.post(format!("{endpoint}/api/embed")).json(&request))
            .await?;
        let response: LocalResponse = parse_body(&body)?;
        Ok(response.embeddings)
    }

    async fn openai_compatible(
        &self,
        endpoint: &str,
        model: &EmbeddingModelConfig,
        api_key: Option<&str>,
        inputs: &[String],
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        // Other APIs may not accept the dimensions parameter
        let dimensions = model
            .dimensions
            .filter(|_| model.model.starts_with("text-embedding-3"));
        let request = OpenAiRequest {
            model: &model.model,
            input: inputs,
            dimensions,
        };

        let mut builder = self
            .client
            .post(format!("{endpoint}/embeddings"))
            .json(&request);
        if let Some(key) = api_key {
            builder = builder.bearer_auth(key);
        }

        let body = self.send(builder).await?;
        let response: OpenAiResponse = parse_body(&body)?;

        // Sort by index to ensure correct order
        let mut data = response.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }

    async fn gemini(
        &self,
        endpoint: &str,
        model: &EmbeddingModelConfig,
        api_key: Option<&str>,
        inputs: &[String],
        purpose: EmbeddingPurpose,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let model_path = if model.model.starts_with("models/") {
            model.model.clone()
        } else {
            format!("models/{}", model.model)
        };
        let request = GeminiBatchRequest {
            requests: inputs
                .iter()
                .map(|text| GeminiEmbedRequest {
                    model: &model_path,
                    content: GeminiContent {
                        parts: [GeminiPart { text }],
                    },
                    task_type: purpose.gemini_task_type(),
                    output_dimensionality: model.dimensions,
                })
                .collect(),
        };

        let mut builder = self
            .client
            .post(format!("{endpoint}/{model_path}:batchEmbedContents"))
            .json(&request);
        if let Some(key) = api_key {
            builder = builder.header("x-goog-api-key", key);
        }

        let body = self.send(builder).await?;
        let response: GeminiBatchResponse = parse_body(&body)?;
        Ok(response.embeddings.into_iter().map(|e| e.values).collect())
    }

    async fn cohere(
        &self,
        endpoint: &str,
        model: &EmbeddingModelConfig,
        api_key: Option<&str>,
        inputs: &[String],
        purpose: EmbeddingPurpose,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let request = CohereRequest {
            model: &model.model,
            texts: inputs,
            input_type: purpose.cohere_input_type(),
        };

        let mut builder = self.client.post(format!("{endpoint}/embed")).json(&request);
        if let Some(key) = api_key {
            builder = builder.bearer_auth(key);
        }

        let body = self.send(builder).await?;
        let response: CohereResponse = parse_body(&body)?;
        Ok(response.embeddings)
    }

    /// Send a request and return the body of a successful response
    async fn send(&self, request: RequestBuilder) -> Result<String, ProviderError> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.map_err(transport_error)?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_status(status, retry_after, &body))
        }
    }
}

impl Embedder for EmbeddingClient {
    fn embed_batch<'a>(
        &'a self,
        texts: &'a [String],
        model: &'a EmbeddingModelConfig,
    ) -> BoxFuture<'a, Result<Vec<Vec<f32>>, ProviderError>> {
        Box::pin(self.request_batch(texts, model, EmbeddingPurpose::Document))
    }

    fn embed_query<'a>(
        &'a self,
        query: &'a str,
        model: &'a EmbeddingModelConfig,
    ) -> BoxFuture<'a, Result<Vec<f32>, ProviderError>> {
        Box::pin(async move {
            let texts = [query.to_string()];
            let vectors = self
                .request_batch(&texts, model, EmbeddingPurpose::Query)
                .await?;
            vectors.into_iter().next().ok_or_else(|| {
                ProviderError::MalformedResponse("no embedding returned".to_string())
            })
        })
    }
}

fn truncate_input(text: &str) -> String {
    if text.chars().count() > MAX_INPUT_CHARS {
        text.chars().take(MAX_INPUT_CHARS).collect()
    } else {
        text.to_string()
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, ProviderError> {
    serde_json::from_str(body).map_err(|e| ProviderError::MalformedResponse(e.to_string()))
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_decode() {
        ProviderError::MalformedResponse(err.to_string())
    } else {
        ProviderError::Unreachable(err.to_string())
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds = headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()?;
    if seconds.is_nan() || seconds < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(seconds.min(MAX_RETRY_AFTER_SECS)).ok()
}

/// Map a non-success HTTP status onto the provider error taxonomy
pub(crate) fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> ProviderError {
    let message = error_message(body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Unauthenticated(message),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after },
        s if s.is_server_error() => ProviderError::Unreachable(format!("{s}: {message}")),
        s => ProviderError::Rejected {
            status: s.as_u16(),
            message,
        },
    }
}

/// Pull a readable message out of the provider's error body
fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let message = value
            .pointer("/error/message")
            .or_else(|| value.get("error"))
            .or_else(|| value.get("message"))
            .and_then(|m| m.as_str());
        if let Some(message) = message {
            return message.to_string();
        }
    }
    body.chars().take(200).collect()
}

/// Check count, shape and values of a provider response. Returns the dimension.
pub(crate) fn validate_vectors(
    vectors: &[Vec<f32>],
    expected_count: usize,
    expected_dimensions: Option<usize>,
) -> Result<usize, ProviderError> {
    if vectors.len() != expected_count {
        return Err(ProviderError::MalformedResponse(format!(
            "embedding count mismatch: sent {} texts, got {} embeddings",
            expected_count,
            vectors.len()
        )));
    }

    let dimensions = vectors.first().map(Vec::len).unwrap_or(0);
    if dimensions == 0 {
        return Err(ProviderError::MalformedResponse("empty embedding".into()));
    }
    if let Some(expected) = expected_dimensions {
        if expected != dimensions {
            return Err(ProviderError::MalformedResponse(format!(
                "expected {expected} dimensions, got {dimensions}"
            )));
        }
    }
    for vector in vectors {
        if vector.len() != dimensions {
            return Err(ProviderError::MalformedResponse(
                "embeddings in one response have different dimensions".into(),
            ));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(ProviderError::MalformedResponse(
                "embedding contains non-finite values".into(),
            ));
        }
    }
    Ok(dimensions)
}
