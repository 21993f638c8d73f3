//! Embedding clients for generating vector representations
//!
//! Supports OpenAI (and compatible), Ollama and Cohere embedding APIs. Every
//! client implements [`EmbeddingProvider`] with a fixed declared width taken
//! from configuration; responses of any other width are rejected.

use async_trait::async_trait;
use minirag_core::{EmbeddingKind, EmbeddingProvider, LlmBackend, LlmConfig, RagError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const COHERE_EMBED_URL: &str = "https://api.cohere.com/v1/embed";

/// Trim a text to the provider's input limit
fn truncate_input(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect::<String>().trim().to_string()
}

/// Reject responses with a missing text or a vector of the wrong width
fn check_embeddings(
    provider: &str,
    expected: usize,
    width: usize,
    embeddings: Vec<Vec<f32>>,
) -> Result<Vec<Vec<f32>>> {
    if embeddings.len() != expected {
        return Err(RagError::LlmError(format!(
            "{provider} returned {} embeddings for {expected} texts",
            embeddings.len()
        )));
    }
    if let Some(bad) = embeddings.iter().find(|e| e.len() != width) {
        return Err(RagError::LlmError(format!(
            "{provider} returned width {}, expected {width}",
            bad.len()
        )));
    }
    Ok(embeddings)
}

// ============================================================================
// OpenAI Embedding Client
// ============================================================================

/// OpenAI embedding API client
pub struct OpenAiEmbedding {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    width: usize,
    max_input_characters: usize,
}

#[derive(Debug, Serialize)]
struct OpenAiEmbeddingRequest<'a> {
    input: Vec<String>,
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

impl OpenAiEmbedding {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, width: usize) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: OPENAI_BASE_URL.to_string(),
            model: model.into(),
            width,
            max_input_characters: 10_000,
        }
    }

    /// Create from config
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .openai_api_key
            .as_ref()
            .ok_or_else(|| RagError::ConfigError("OpenAI API key required".to_string()))?;

        let mut client = Self::new(
            api_key.clone(),
            config.embedding_model.clone(),
            config.embedding_size,
        );
        if let Some(url) = &config.openai_base_url {
            client.base_url = url.trim_end_matches('/').to_string();
        }
        client.max_input_characters = config.max_input_characters;
        Ok(client)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedding {
    async fn embed(&self, texts: &[String], _kind: EmbeddingKind) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = OpenAiEmbeddingRequest {
            input: texts
                .iter()
                .map(|t| truncate_input(t, self.max_input_characters))
                .collect(),
            model: &self.model,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| RagError::LlmError(format!("Embedding request failed: {e}")))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(RagError::LlmError(format!(
                "OpenAI embedding error: {error_text}"
            )));
        }

        let result: OpenAiEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| RagError::LlmError(format!("Failed to parse embedding response: {e}")))?;

        let mut data = result.data;
        data.sort_by_key(|e| e.index);
        check_embeddings(
            "OpenAI",
            texts.len(),
            self.width,
            data.into_iter().map(|e| e.embedding).collect(),
        )
    }

    fn width(&self) -> usize {
        self.width
    }
}

// ============================================================================
// Ollama Embedding Client
// ============================================================================

/// Ollama embedding API client
pub struct OllamaEmbedding {
    client: Client,
    base_url: String,
    model: String,
    width: usize,
    max_input_characters: usize,
}

#[derive(Debug, Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedding {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, width: usize) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            width,
            max_input_characters: 10_000,
        }
    }

    /// Create from config
    pub fn from_config(config: &LlmConfig) -> Self {
        let mut client = Self::new(
            config.ollama_url.clone(),
            config.embedding_model.clone(),
            config.embedding_size,
        );
        client.max_input_characters = config.max_input_characters;
        client
    }

    fn request<'a>(&'a self, texts: &[String]) -> OllamaEmbeddingRequest<'a> {
        OllamaEmbeddingRequest {
            model: &self.model,
            input: texts
                .iter()
                .map(|t| truncate_input(t, self.max_input_characters))
                .collect(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    async fn embed(&self, texts: &[String], _kind: EmbeddingKind) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&self.request(texts))
            .send()
            .await
            .map_err(|e| RagError::LlmError(format!("Ollama embedding request failed: {e}")))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(RagError::LlmError(format!(
                "Ollama embedding error: {error_text}"
            )));
        }

        let result: OllamaEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| RagError::LlmError(format!("Failed to parse embedding response: {e}")))?;

        check_embeddings("Ollama", texts.len(), self.width, result.embeddings)
    }

    fn width(&self) -> usize {
        self.width
    }
}

// ============================================================================
// Cohere Embedding Client
// ============================================================================

/// Cohere embedding API client
pub struct CohereEmbedding {
    client: Client,
    api_key: String,
    model: String,
    width: usize,
    max_input_characters: usize,
}

#[derive(Debug, Serialize)]
struct CohereEmbedRequest<'a> {
    model: &'a str,
    texts: Vec<String>,
    input_type: &'static str,
    embedding_types: [&'static str; 1],
}

#[derive(Debug, Deserialize)]
struct CohereEmbedResponse {
    embeddings: CohereEmbeddings,
}

#[derive(Debug, Deserialize)]
struct CohereEmbeddings {
    float: Vec<Vec<f32>>,
}

impl CohereEmbedding {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, width: usize) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            width,
            max_input_characters: 10_000,
        }
    }

    /// Create from config
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .cohere_api_key
            .as_ref()
            .ok_or_else(|| RagError::ConfigError("Cohere API key required".to_string()))?;

        let mut client = Self::new(
            api_key.clone(),
            config.embedding_model.clone(),
            config.embedding_size,
        );
        client.max_input_characters = config.max_input_characters;
        Ok(client)
    }
}

/// Cohere distinguishes stored documents from search queries
fn cohere_input_type(kind: EmbeddingKind) -> &'static str {
    match kind {
        EmbeddingKind::Document => "search_document",
        EmbeddingKind::Query => "search_query",
    }
}

#[async_trait]
impl EmbeddingProvider for CohereEmbedding {
    async fn embed(&self, texts: &[String], kind: EmbeddingKind) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = CohereEmbedRequest {
            model: &self.model,
            texts: texts
                .iter()
                .map(|t| truncate_input(t, self.max_input_characters))
                .collect(),
            input_type: cohere_input_type(kind),
            embedding_types: ["float"],
        };

        let response = self
            .client
            .post(COHERE_EMBED_URL)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| RagError::LlmError(format!("Cohere embedding request failed: {e}")))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(RagError::LlmError(format!(
                "Cohere embedding error: {error_text}"
            )));
        }

        let result: CohereEmbedResponse = response
            .json()
            .await
            .map_err(|e| RagError::LlmError(format!("Failed to parse embedding response: {e}")))?;

        check_embeddings("Cohere", texts.len(), self.width, result.embeddings.float)
    }

    fn width(&self) -> usize {
        self.width
    }
}

// ============================================================================
// Factory function
// ============================================================================

/// Create an embedding provider from config
pub fn create_embedding_provider(config: &LlmConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.embedding_backend {
        LlmBackend::OpenAI => Ok(Arc::new(OpenAiEmbedding::from_config(config)?)),
        LlmBackend::Ollama => Ok(Arc::new(OllamaEmbedding::from_config(config))),
        LlmBackend::Cohere => Ok(Arc::new(CohereEmbedding::from_config(config)?)),
    }
}

// ============================================================================
// Tests
// ============================================================================
