//! Embedded vector store
//!
//! Adapts the process-local [`LocalEngine`] to the [`VectorStore`] contract.
//! The engine does its own locking; this adapter only moves calls onto the
//! blocking pool.

mod engine;
mod index;

pub use engine::{similarity, CollectionConfig, CollectionStats, LocalEngine};

use crate::{effective_batch_size, validate_collection_name, VectorStore};
use async_trait::async_trait;
use minirag_core::{
    prepare_records, CollectionInfo, DistanceMetric, RagError, Result, SearchResult,
    VectorBackend, VectorConfig, VectorRecord, COLLECTION_PREFIX,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Vector store backed by an in-process engine rooted at a directory
pub struct EmbeddedStore {
    path: PathBuf,
    metric: DistanceMetric,
    index_threshold: usize,
    engine: RwLock<Option<Arc<LocalEngine>>>,
}

impl EmbeddedStore {
    pub fn new(config: &VectorConfig) -> Self {
        Self {
            path: config.path.clone(),
            metric: config.distance,
            index_threshold: config.index_threshold,
            engine: RwLock::new(None),
        }
    }

    async fn engine(&self) -> Result<Arc<LocalEngine>> {
        self.engine.read().await.clone().ok_or_else(|| {
            RagError::VectorStoreError("embedded vector store is not connected".to_string())
        })
    }

    /// Run an engine call on the blocking pool
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&LocalEngine) -> Result<T> + Send + 'static,
    {
        let engine = self.engine().await?;
        tokio::task::spawn_blocking(move || f(&engine))
            .await
            .map_err(|e| RagError::VectorStoreError(format!("Engine task failed: {e}")))?
    }
}

#[async_trait]
impl VectorStore for EmbeddedStore {
    fn backend(&self) -> VectorBackend {
        VectorBackend::Embedded
    }

    fn metric(&self) -> DistanceMetric {
        self.metric
    }

    async fn connect(&self) -> Result<()> {
        let mut guard = self.engine.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let path = self.path.clone();
        let threshold = self.index_threshold;
        let engine = tokio::task::spawn_blocking(move || LocalEngine::open(path, threshold))
            .await
            .map_err(|e| RagError::VectorStoreError(format!("Engine task failed: {e}")))??;

        tracing::debug!(path = %self.path.display(), "Opened embedded engine");
        *guard = Some(Arc::new(engine));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.engine.write().await.take();
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.run(move |engine| engine.collection_exists(&name)).await
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let names = self.run(|engine| engine.list_collections()).await?;
        Ok(names
            .into_iter()
            .filter(|n| n.starts_with(COLLECTION_PREFIX))
            .collect())
    }

    async fn create_collection(
        &self,
        name: &str,
        vector_width: usize,
        reset: bool,
    ) -> Result<bool> {
        validate_collection_name(name)?;
        if vector_width == 0 {
            return Err(RagError::ValidationError(
                "vector width must be positive".to_string(),
            ));
        }

        if reset {
            self.delete_collection(name).await?;
        }

        let config = CollectionConfig {
            name: name.to_string(),
            vector_width,
            metric: self.metric,
        };
        let created = self.run(move |engine| engine.create_collection(config)).await?;
        if created {
            tracing::info!(collection = name, vector_width, "Created collection");
        }
        Ok(created)
    }

    async fn delete_collection(&self, name: &str) -> Result<bool> {
        let owned = name.to_string();
        let deleted = self
            .run(move |engine| engine.delete_collection(&owned))
            .await?;
        if deleted {
            tracing::info!(collection = name, "Deleted collection");
        }
        Ok(deleted)
    }

    async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>> {
        let owned = name.to_string();
        let Some(stats) = self.run(move |engine| engine.stats(&owned)).await? else {
            return Ok(None);
        };

        Ok(Some(CollectionInfo {
            name: stats.config.name,
            vector_width: stats.config.vector_width,
            metric: stats.config.metric,
            record_count: stats.points as u64,
            has_index: stats.indexed_points.is_some(),
            details: serde_json::json!({
                "path": stats.path.display().to_string(),
                "indexed_points": stats.indexed_points,
                "index_builds": stats.index_builds,
                "index_threshold": self.index_threshold,
            }),
        }))
    }

    async fn insert_many(
        &self,
        name: &str,
        records: &[VectorRecord],
        batch_size: usize,
    ) -> Result<usize> {
        let owned = name.to_string();
        let stats = self
            .run(move |engine| engine.stats(&owned))
            .await?
            .ok_or_else(|| RagError::NotFound(format!("collection {name}")))?;

        let records = prepare_records(records, stats.config.vector_width)?;
        let mut committed = 0;

        for batch in records.chunks(effective_batch_size(batch_size)) {
            let owned = name.to_string();
            let batch = batch.to_vec();
            match self
                .run(move |engine| engine.upsert_batch(&owned, &batch))
                .await
            {
                Ok(written) => committed += written,
                Err(e) => {
                    tracing::error!(collection = name, committed, "Batch insert failed: {e}");
                    return Err(RagError::BatchInsertError {
                        committed,
                        message: e.to_string(),
                    });
                }
            }
        }

        Ok(committed)
    }

    async fn delete_record(&self, name: &str, external_id: i64) -> Result<bool> {
        let owned = name.to_string();
        self.run(move |engine| engine.delete_point(&owned, external_id))
            .await
    }

    async fn search_by_vector(
        &self,
        name: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Option<Vec<SearchResult>>> {
        let owned = name.to_string();
        let query = query.to_vec();
        self.run(move |engine| engine.search(&owned, &query, limit))
            .await
    }
}
