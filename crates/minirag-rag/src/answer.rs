//! Retrieval-augmented answers
//!
//! Retrieved chunks are rendered into the `rag/document_prompt` template,
//! followed by `rag/footer_prompt`. The system prompt travels as chat
//! history.

use crate::retrieval::RetrievalService;
use crate::templates::TemplateRegistry;
use minirag_core::{ChatMessage, LlmClient, RagError, Result};
use serde::Serialize;
use std::sync::Arc;

/// A generated answer with the exact prompt that produced it
#[derive(Debug, Clone, Serialize)]
pub struct RagAnswer {
    pub answer: String,
    pub full_prompt: String,
    pub chat_history: Vec<ChatMessage>,
}

pub struct AnswerService {
    retrieval: RetrievalService,
    llm: Arc<dyn LlmClient>,
    templates: TemplateRegistry,
    max_input_characters: usize,
}

impl AnswerService {
    pub fn new(
        retrieval: RetrievalService,
        llm: Arc<dyn LlmClient>,
        templates: TemplateRegistry,
    ) -> Self {
        Self {
            retrieval,
            llm,
            templates,
            max_input_characters: 10_000,
        }
    }

    pub fn with_max_input_characters(mut self, max_input_characters: usize) -> Self {
        self.max_input_characters = max_input_characters;
        self
    }

    fn template(&self, key: &str, vars: &[(&str, &str)]) -> Result<String> {
        self.templates
            .get("rag", key, vars)
            .ok_or_else(|| RagError::ConfigError(format!("missing template rag/{key}")))
    }

    fn truncate(&self, text: &str) -> String {
        text.chars().take(self.max_input_characters).collect()
    }

    /// Answer `query` from the project's documents; `None` if nothing matched
    pub async fn answer(&self, project_id: i64, query: &str, limit: usize) -> Result<Option<RagAnswer>> {
        let Some(documents) = self
            .retrieval
            .search(project_id, query, limit)
            .await?
            .into_matches()
        else {
            return Ok(None);
        };

        let system_prompt = self.template("system_prompt", &[])?;
        let document_prompts = documents
            .iter()
            .enumerate()
            .map(|(i, doc)| {
                let doc_num = (i + 1).to_string();
                let text = self.truncate(&doc.text);
                self.template(
                    "document_prompt",
                    &[("doc_num", doc_num.as_str()), ("chunk_text", text.as_str())],
                )
            })
            .collect::<Result<Vec<_>>>()?
            .join("\n");
        let footer_prompt = self.template("footer_prompt", &[("query", query)])?;

        let chat_history = vec![ChatMessage::system(system_prompt)];
        let full_prompt = [document_prompts, footer_prompt].join("\n\n");

        let answer = self.llm.generate(&full_prompt, &chat_history).await?;
        tracing::info!(project_id, documents = documents.len(), "Generated answer");

        Ok(Some(RagAnswer {
            answer,
            full_prompt,
            chat_history,
        }))
    }

    /// Turn a free-form document into task stories
    pub async fn generate_stories(&self, document: &str) -> Result<String> {
        let system_prompt = self.template("stories_prompt", &[])?;
        let document = self.truncate(document);
        let prompt = self.template("story_footer_prompt", &[("document_text", document.as_str())])?;

        self.llm
            .generate(&prompt, &[ChatMessage::system(system_prompt)])
            .await
    }
}
