//! minirag RAG - Indexing and retrieval orchestration
//!
//! This crate drives the vector store on behalf of a project:
//! - [`IndexingPipeline`] streams stored chunks through the embedding
//!   provider into the project's collection
//! - [`RetrievalService`] embeds a query and ranks matching chunks
//! - [`AnswerService`] renders retrieved chunks into prompt templates and
//!   calls the generation model

pub mod answer;
pub mod indexing;
pub mod llm;
pub mod retrieval;
pub mod templates;

pub use answer::{AnswerService, RagAnswer};
pub use indexing::{
    IndexRequest, IndexingPipeline, IndexingProgress, IndexingReport, PipelineConfig,
    ProgressCallback,
};
pub use llm::{create_llm_client, CohereClient, OllamaClient, OpenAiClient};
pub use retrieval::{RetrievalService, SearchOutcome, DEFAULT_SEARCH_LIMIT};
pub use templates::TemplateRegistry;
