//! LLM Client implementations
//!
//! Chat-style generation clients for OpenAI (and compatible), Ollama and
//! Cohere. Each client sends the chat history followed by the prompt as the
//! final user turn.

use async_trait::async_trait;
use minirag_core::{ChatMessage, ChatRole, LlmBackend, LlmClient, LlmConfig, RagError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const COHERE_CHAT_URL: &str = "https://api.cohere.com/v1/chat";

fn truncate_prompt(prompt: &str, max_chars: usize) -> String {
    prompt.chars().take(max_chars).collect::<String>().trim().to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Message {
    role: String,
    content: String,
}

/// History plus the prompt as the last user message
fn chat_messages(prompt: String, history: &[ChatMessage]) -> Vec<Message> {
    history
        .iter()
        .map(|m| Message {
            role: m.role.to_string(),
            content: m.content.clone(),
        })
        .chain(std::iter::once(Message {
            role: ChatRole::User.to_string(),
            content: prompt,
        }))
        .collect()
}

// ============================================================================
// OpenAI Client
// ============================================================================

/// OpenAI API client
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    max_input_characters: usize,
}

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

impl OpenAiClient {
    /// Create a new OpenAI client
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: OPENAI_BASE_URL.to_string(),
            model: model.into(),
            max_tokens,
            temperature,
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
            config.generation_model.clone(),
            config.max_tokens,
            config.temperature,
        );
        if let Some(url) = &config.openai_base_url {
            client = client.with_base_url(url.trim_end_matches('/'));
        }
        client.max_input_characters = config.max_input_characters;
        Ok(client)
    }

    /// Set custom base URL (for compatible APIs)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate(&self, prompt: &str, history: &[ChatMessage]) -> Result<String> {
        let request = OpenAiRequest {
            model: &self.model,
            messages: chat_messages(truncate_prompt(prompt, self.max_input_characters), history),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| RagError::LlmError(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(RagError::LlmError(format!("OpenAI error: {error_text}")));
        }

        let result: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| RagError::LlmError(format!("Failed to parse response: {e}")))?;

        result
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|text| !text.is_empty())
            .ok_or_else(|| RagError::LlmError("No response generated".to_string()))
    }
}

// ============================================================================
// Ollama Client
// ============================================================================

/// Ollama API client
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
    temperature: f32,
    max_input_characters: usize,
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: Message,
}

impl OllamaClient {
    /// Create a new Ollama client
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            temperature: 0.1,
            max_input_characters: 10_000,
        }
    }

    /// Create from config
    pub fn from_config(config: &LlmConfig) -> Self {
        let mut client = Self::new(config.ollama_url.clone(), config.generation_model.clone());
        client.temperature = config.temperature;
        client.max_input_characters = config.max_input_characters;
        client
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(&self, prompt: &str, history: &[ChatMessage]) -> Result<String> {
        let request = OllamaRequest {
            model: &self.model,
            messages: chat_messages(truncate_prompt(prompt, self.max_input_characters), history),
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| RagError::LlmError(format!("Ollama request failed: {e}")))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(RagError::LlmError(format!("Ollama error: {error_text}")));
        }

        let result: OllamaResponse = response
            .json()
            .await
            .map_err(|e| RagError::LlmError(format!("Failed to parse Ollama response: {e}")))?;

        Ok(result.message.content)
    }
}

// ============================================================================
// Cohere Client
// ============================================================================

/// Cohere chat API client
pub struct CohereClient {
    client: Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    max_input_characters: usize,
}

#[derive(Debug, Serialize)]
struct CohereRequest<'a> {
    model: &'a str,
    message: String,
    chat_history: Vec<CohereTurn>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct CohereTurn {
    role: &'static str,
    message: String,
}

#[derive(Debug, Deserialize)]
struct CohereResponse {
    text: String,
}

impl CohereClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .cohere_api_key
            .as_ref()
            .ok_or_else(|| RagError::ConfigError("Cohere API key required".to_string()))?;

        Ok(Self {
            client: Client::new(),
            api_key: api_key.clone(),
            model: config.generation_model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            max_input_characters: config.max_input_characters,
        })
    }
}

fn cohere_role(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "SYSTEM",
        ChatRole::User => "USER",
        ChatRole::Assistant => "CHATBOT",
    }
}

#[async_trait]
impl LlmClient for CohereClient {
    async fn generate(&self, prompt: &str, history: &[ChatMessage]) -> Result<String> {
        let request = CohereRequest {
            model: &self.model,
            message: truncate_prompt(prompt, self.max_input_characters),
            chat_history: history
                .iter()
                .map(|m| CohereTurn {
                    role: cohere_role(m.role),
                    message: m.content.clone(),
                })
                .collect(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(COHERE_CHAT_URL)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| RagError::LlmError(format!("Cohere request failed: {e}")))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(RagError::LlmError(format!("Cohere error: {error_text}")));
        }

        let result: CohereResponse = response
            .json()
            .await
            .map_err(|e| RagError::LlmError(format!("Failed to parse Cohere response: {e}")))?;

        if result.text.is_empty() {
            return Err(RagError::LlmError("No response generated".to_string()));
        }
        Ok(result.text)
    }
}

// ============================================================================
// Factory function
// ============================================================================

/// Create an LLM client from config
pub fn create_llm_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    match config.generation_backend {
        LlmBackend::OpenAI => Ok(Arc::new(OpenAiClient::from_config(config)?)),
        LlmBackend::Ollama => Ok(Arc::new(OllamaClient::from_config(config))),
        LlmBackend::Cohere => Ok(Arc::new(CohereClient::from_config(config)?)),
    }
}

// ============================================================================
// Tests
// ============================================================================
