//! Paginated indexing pipeline
//!
//! A run moves through:
//!
//! ```text
//! RESOLVE_TARGETS -> [RESET] -> INGEST -> CREATE_COLLECTION
//!     -> PAGE_FETCH <-> EMBED_AND_INSERT -> DONE
//! ```
//!
//! Pages are fetched from the chunk store until an empty page is returned.
//! Each page is embedded with a single provider call and inserted in
//! batches. Any embedding or insert failure stops the run and reports how
//! many records were already written.

use minirag_core::{
    collection_name, Asset, AssetStore, ChunkSource, ChunkStore, EmbeddingKind,
    EmbeddingProvider, IndexingConfig, RagError, Result, VectorConfig, VectorRecord,
};
use minirag_vector::VectorStore;
use serde::Serialize;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

/// What to index
#[derive(Debug, Clone)]
pub struct IndexRequest {
    pub project_id: i64,

    /// Restrict ingestion to one asset, by file name
    pub file_id: Option<String>,

    /// Drop the collection and the project's chunks first
    pub reset: bool,
}

impl IndexRequest {
    pub fn project(project_id: i64) -> Self {
        Self {
            project_id,
            file_id: None,
            reset: false,
        }
    }

    pub fn with_file(mut self, file_id: impl Into<String>) -> Self {
        self.file_id = Some(file_id.into());
        self
    }

    pub fn with_reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }
}

/// Outcome of a completed run
#[derive(Debug, Clone, Serialize)]
pub struct IndexingReport {
    pub run_id: Uuid,
    pub collection: String,
    pub inserted_items: usize,
    pub files_processed: usize,
    pub pages: u32,
}

/// Running counts handed to the progress callback after every page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexingProgress {
    pub pages: u32,
    pub inserted_items: usize,
    pub files_processed: usize,
}

pub type ProgressCallback = Arc<dyn Fn(IndexingProgress) + Send + Sync>;

/// Page and batch sizes
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub page_size: u32,
    pub batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            batch_size: 50,
        }
    }
}

impl PipelineConfig {
    pub fn from_config(indexing: &IndexingConfig, vector: &VectorConfig) -> Self {
        Self {
            page_size: indexing.page_size.max(1),
            batch_size: vector.batch_size,
        }
    }
}

/// Streams a project's chunks into its vector collection
pub struct IndexingPipeline {
    vector_store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunks: Arc<dyn ChunkStore>,
    assets: Arc<dyn AssetStore>,
    source: Arc<dyn ChunkSource>,
    config: PipelineConfig,
    progress: Option<ProgressCallback>,
}

impl IndexingPipeline {
    pub fn new(
        vector_store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        chunks: Arc<dyn ChunkStore>,
        assets: Arc<dyn AssetStore>,
        source: Arc<dyn ChunkSource>,
    ) -> Self {
        Self {
            vector_store,
            embedder,
            chunks,
            assets,
            source,
            config: PipelineConfig::default(),
            progress: None,
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Execute one indexing run
    pub async fn run(&self, request: IndexRequest) -> Result<IndexingReport> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("indexing", %run_id, project_id = request.project_id);
        self.run_inner(run_id, request).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, request: IndexRequest) -> Result<IndexingReport> {
        let project_id = request.project_id;
        let targets = self.resolve_targets(&request).await?;
        let collection = collection_name(project_id, self.embedder.width());
        tracing::info!(
            collection = %collection,
            targets = targets.len(),
            reset = request.reset,
            "Indexing started"
        );

        if request.reset {
            self.vector_store.delete_collection(&collection).await?;
            let removed = self.chunks.delete_all_for_project(project_id).await?;
            tracing::info!(removed, "Reset project chunks");
        }

        let files_processed = self.ingest(project_id, &targets).await;

        self.vector_store
            .create_collection(&collection, self.embedder.width(), false)
            .await?;

        let mut report = IndexingReport {
            run_id,
            collection,
            inserted_items: 0,
            files_processed,
            pages: 0,
        };

        let mut page_no = 1;
        loop {
            let page = self
                .chunks
                .get_page(project_id, page_no, self.config.page_size)
                .await?;
            if page.is_empty() {
                break;
            }

            let inserted = self.embed_and_insert(&report, &page).await?;
            report.inserted_items += inserted;
            report.pages += 1;
            tracing::debug!(page_no, inserted, total = report.inserted_items, "Indexed page");

            if let Some(callback) = &self.progress {
                callback(IndexingProgress {
                    pages: report.pages,
                    inserted_items: report.inserted_items,
                    files_processed: report.files_processed,
                });
            }
            page_no += 1;
        }

        tracing::info!(
            inserted_items = report.inserted_items,
            pages = report.pages,
            files_processed = report.files_processed,
            "Indexing finished"
        );
        Ok(report)
    }

    async fn resolve_targets(&self, request: &IndexRequest) -> Result<Vec<Asset>> {
        let targets = match &request.file_id {
            Some(file_id) => {
                let asset = self
                    .assets
                    .get_asset(request.project_id, file_id)
                    .await?
                    .ok_or_else(|| RagError::FileIdError {
                        file_id: file_id.clone(),
                    })?;
                vec![asset]
            }
            None => self.assets.list_assets(request.project_id).await?,
        };

        if targets.is_empty() {
            return Err(RagError::NoFilesError {
                project_id: request.project_id,
            });
        }
        Ok(targets)
    }

    /// Make sure every target has stored chunks; returns the number that do.
    ///
    /// An asset whose source yields no chunks is skipped like a failed one.
    async fn ingest(&self, project_id: i64, targets: &[Asset]) -> usize {
        let mut files_processed = 0;

        for asset in targets {
            match self.ingest_asset(project_id, asset).await {
                Ok(0) => {
                    tracing::warn!(asset = %asset.name, "Skipping asset: no chunks produced");
                }
                Ok(stored) => {
                    tracing::debug!(asset = %asset.name, stored, "Asset ready");
                    files_processed += 1;
                }
                Err(e) => {
                    tracing::warn!(asset = %asset.name, "Skipping asset: {e}");
                }
            }
        }

        files_processed
    }

    async fn ingest_asset(&self, project_id: i64, asset: &Asset) -> Result<u64> {
        let existing = self.chunks.count_for_asset(project_id, asset.asset_id).await?;
        if existing > 0 {
            return Ok(existing);
        }

        let drafts = self.source.load_chunks(project_id, asset).await?;
        let stored = self
            .chunks
            .insert_many(project_id, asset.asset_id, &drafts)
            .await?;
        Ok(stored as u64)
    }

    async fn embed_and_insert(
        &self,
        report: &IndexingReport,
        page: &[minirag_core::Chunk],
    ) -> Result<usize> {
        let abort = |inserted: usize, reason: String| {
            tracing::error!(inserted, "Indexing aborted: {reason}");
            RagError::IndexingAborted {
                inserted,
                files_processed: report.files_processed,
                reason,
            }
        };

        let texts: Vec<String> = page.iter().map(|c| c.text.clone()).collect();
        let vectors = self
            .embedder
            .embed(&texts, EmbeddingKind::Document)
            .await
            .map_err(|e| abort(report.inserted_items, e.to_string()))?;

        if vectors.len() != page.len() {
            return Err(abort(
                report.inserted_items,
                format!("{} embeddings returned for {} chunks", vectors.len(), page.len()),
            ));
        }

        let records: Vec<VectorRecord> = page
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| VectorRecord {
                external_id: chunk.chunk_id,
                text: chunk.text.clone(),
                vector,
                metadata: chunk.metadata.clone(),
            })
            .collect();

        self.vector_store
            .insert_many(&report.collection, &records, self.config.batch_size)
            .await
            .map_err(|e| match e {
                RagError::BatchInsertError { committed, message } => {
                    abort(report.inserted_items + committed, message)
                }
                other => abort(report.inserted_items, other.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_request_builder() {
        let request = IndexRequest::project(4).with_file("notes.txt").with_reset(true);
        assert_eq!(request.project_id, 4);
        assert_eq!(request.file_id.as_deref(), Some("notes.txt"));
        assert!(request.reset);
    }

    #[test]
    fn test_pipeline_config_from_app_config() {
        let indexing = IndexingConfig {
            page_size: 0,
            ..Default::default()
        };
        let vector = VectorConfig {
            batch_size: 25,
            ..Default::default()
        };
        let config = PipelineConfig::from_config(&indexing, &vector);
        assert_eq!(config.page_size, 1);
        assert_eq!(config.batch_size, 25);
    }
}
