//! minirag Core - Domain models, traits, and shared types
//!
//! This crate defines the core abstractions used throughout minirag:
//! - Vector store data model (collections, records, search results)
//! - Common error type
//! - Traits for the external collaborators (embedding, generation,
//!   chunk and asset stores, chunk sources)
//! - Configuration management
//! - Chunk/asset bookkeeping (PostgreSQL)

pub mod config;
pub mod metadata;

pub use config::{
    AppConfig, ConfigError, DatabaseConfig, DistanceMetric, IndexType, IndexingConfig, LlmBackend,
    LlmConfig, LoggingConfig, TemplateConfig, VectorBackend, VectorConfig,
};
pub use metadata::MetadataStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Core error type for minirag operations
#[derive(Error, Debug)]
pub enum RagError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("No files to process for project {project_id}")]
    NoFilesError { project_id: i64 },

    #[error("Unknown file id: {file_id}")]
    FileIdError { file_id: String },

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Vector store error: {0}")]
    VectorStoreError(String),

    #[error("Batch insert failed after {committed} committed records: {message}")]
    BatchInsertError { committed: usize, message: String },

    #[error("Indexing aborted after {inserted} records from {files_processed} files: {reason}")]
    IndexingAborted {
        inserted: usize,
        files_processed: usize,
        reason: String,
    },

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RagError {
    /// Whether the error was caused by malformed caller input.
    ///
    /// Validation errors are never retried and are surfaced verbatim.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::ValidationError(_) | Self::NoFilesError { .. } | Self::FileIdError { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RagError>;

// ============================================================================
// Collections
// ============================================================================

/// Prefix shared by every collection name
pub const COLLECTION_PREFIX: &str = "collection_";

/// Build the collection name for a project.
///
/// The format `collection_{width}_{project_id}` is a stable external
/// contract: two projects never share a namespace, and a change of
/// embedding width always lands in a fresh collection.
pub fn collection_name(project_id: i64, vector_width: usize) -> String {
    format!("{COLLECTION_PREFIX}{vector_width}_{project_id}")
}

/// Descriptive metadata about a collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionInfo {
    /// Collection name
    pub name: String,

    /// Declared vector width
    pub vector_width: usize,

    /// Distance metric fixed at creation
    pub metric: DistanceMetric,

    /// Number of stored records
    pub record_count: u64,

    /// Whether a secondary (ANN) index exists
    pub has_index: bool,

    /// Backend-specific details
    pub details: serde_json::Value,
}

// ============================================================================
// Records and Results
// ============================================================================

/// One indexed unit in a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Caller-supplied id, stable and unique within the collection
    pub external_id: i64,

    /// Originating chunk text
    pub text: String,

    /// Embedding vector
    pub vector: Vec<f32>,

    /// Opaque key/value payload
    pub metadata: Option<serde_json::Value>,
}

impl VectorRecord {
    /// Create a record without metadata
    pub fn new(external_id: i64, text: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            external_id,
            text: text.into(),
            vector,
            metadata: None,
        }
    }

    /// Attach metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Metadata as stored: absent metadata becomes an empty object
    pub fn metadata_or_default(&self) -> serde_json::Value {
        self.metadata
            .clone()
            .unwrap_or_else(|| serde_json::Value::Object(Default::default()))
    }
}

/// Validate records against a collection width and drop duplicate ids.
///
/// Every backend upserts on `external_id`, so only the last occurrence of an
/// id in `records` survives. Relative order of the survivors is preserved.
pub fn prepare_records(records: &[VectorRecord], vector_width: usize) -> Result<Vec<VectorRecord>> {
    if let Some(bad) = records.iter().find(|r| r.vector.len() != vector_width) {
        return Err(RagError::ValidationError(format!(
            "record {} has vector width {}, collection expects {}",
            bad.external_id,
            bad.vector.len(),
            vector_width
        )));
    }

    let mut seen = HashSet::with_capacity(records.len());
    let mut prepared: Vec<VectorRecord> = records
        .iter()
        .rev()
        .filter(|r| seen.insert(r.external_id))
        .cloned()
        .collect();
    prepared.reverse();

    Ok(prepared)
}

/// A single similarity match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Stored chunk text
    pub text: String,

    /// Similarity score (higher is better, for every backend)
    pub score: f32,

    /// Id of the matching record
    pub external_id: i64,
}

// ============================================================================
// Chunks and Assets
// ============================================================================

/// A stored chunk of project content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: i64,
    pub project_id: i64,
    pub asset_id: i64,
    /// 1-based position within its asset
    pub order: i32,
    pub text: String,
    pub metadata: Option<serde_json::Value>,
}

/// A chunk produced by a chunk source, before it is stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDraft {
    pub text: String,
    pub metadata: Option<serde_json::Value>,
}

impl ChunkDraft {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: None,
        }
    }
}

/// An uploaded file belonging to a project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub asset_id: i64,
    pub project_id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Asset {
    pub fn new(asset_id: i64, project_id: i64, name: impl Into<String>) -> Self {
        Self {
            asset_id,
            project_id,
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Embedding and Generation Types
// ============================================================================

/// Whether text is embedded for storage or for querying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingKind {
    Document,
    Query,
}

/// Role of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// A message in a chat history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Turns text into fixed-width vectors
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts; either every text is embedded or the call fails
    async fn embed(&self, texts: &[String], kind: EmbeddingKind) -> Result<Vec<Vec<f32>>>;

    /// Declared vector width
    fn width(&self) -> usize;
}

/// Trait for LLM clients
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a response to `prompt` following `history`
    async fn generate(&self, prompt: &str, history: &[ChatMessage]) -> Result<String>;
}

/// Upstream store of chunk records
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Fetch one page of a project's chunks; `page_no` starts at 1
    async fn get_page(&self, project_id: i64, page_no: u32, page_size: u32) -> Result<Vec<Chunk>>;

    /// Delete every chunk of a project, returning the number removed
    async fn delete_all_for_project(&self, project_id: i64) -> Result<u64>;

    /// Number of chunks stored for a project
    async fn count_for_project(&self, project_id: i64) -> Result<u64>;

    /// Number of chunks stored for one asset
    async fn count_for_asset(&self, project_id: i64, asset_id: i64) -> Result<u64>;

    /// Store the chunks of one asset, returning the number inserted
    async fn insert_many(&self, project_id: i64, asset_id: i64, drafts: &[ChunkDraft])
        -> Result<usize>;
}

/// Lookup of project assets
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Find an asset by its file name
    async fn get_asset(&self, project_id: i64, name: &str) -> Result<Option<Asset>>;

    /// All assets of a project
    async fn list_assets(&self, project_id: i64) -> Result<Vec<Asset>>;
}

/// Produces chunk drafts for an asset
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn load_chunks(&self, project_id: i64, asset: &Asset) -> Result<Vec<ChunkDraft>>;
}

// ============================================================================
// Tests
// ============================================================================
