//! minirag Vector - Vector store abstraction
//!
//! One [`VectorStore`] contract with three adapters:
//! - [`EmbeddedStore`]: process-local engine persisted under a directory
//! - [`PgVectorStore`]: one PostgreSQL table per collection (pgvector)
//! - [`QdrantStore`]: remote Qdrant server
//!
//! Callers hold an `Arc<dyn VectorStore>` obtained from
//! [`create_vector_store`] and never depend on a concrete adapter.

use async_trait::async_trait;
use minirag_core::{
    CollectionInfo, DistanceMetric, RagError, Result, SearchResult, VectorBackend, VectorConfig,
    VectorRecord,
};
use sqlx::PgPool;
use std::sync::Arc;

pub mod embedded;
pub mod embedding;
pub mod pgvector;
pub mod qdrant_store;

pub use embedded::EmbeddedStore;
pub use embedding::create_embedding_provider;
pub use pgvector::PgVectorStore;
pub use qdrant_store::QdrantStore;

/// Default number of records per insert batch
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Longest identifier PostgreSQL accepts without truncation
const MAX_NAME_LEN: usize = 63;

// ============================================================================
// VectorStore Trait
// ============================================================================

/// Uniform contract over every similarity-search backend
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Which backend this adapter talks to
    fn backend(&self) -> VectorBackend;

    /// Metric used for collections created by this store
    fn metric(&self) -> DistanceMetric;

    /// Acquire the backend session (idempotent)
    async fn connect(&self) -> Result<()>;

    /// Release the backend session (idempotent)
    async fn disconnect(&self) -> Result<()>;

    async fn collection_exists(&self, name: &str) -> Result<bool>;

    /// Names of every collection managed by this store
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Create a collection of `vector_width`.
    ///
    /// With `reset` an existing collection is dropped first. Returns `false`
    /// when the collection already existed and was left untouched.
    async fn create_collection(&self, name: &str, vector_width: usize, reset: bool)
        -> Result<bool>;

    /// Drop a collection and its secondary index; `false` if it was missing
    async fn delete_collection(&self, name: &str) -> Result<bool>;

    /// Describe a collection; `None` if it does not exist
    async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>>;

    /// Insert a single record
    async fn insert_one(&self, name: &str, record: VectorRecord) -> Result<()> {
        self.insert_many(name, &[record], 1).await.map(|_| ())
    }

    /// Insert records in batches of `batch_size`.
    ///
    /// Each batch is atomic. When batch *k* fails the error is
    /// [`RagError::BatchInsertError`] carrying the number of records in the
    /// batches committed before it.
    async fn insert_many(&self, name: &str, records: &[VectorRecord], batch_size: usize)
        -> Result<usize>;

    /// Remove one record by its external id; `false` if it was absent
    async fn delete_record(&self, name: &str, external_id: i64) -> Result<bool>;

    /// Top `limit` matches, best first.
    ///
    /// `None` means the collection is missing or holds no records.
    async fn search_by_vector(
        &self,
        name: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Option<Vec<SearchResult>>>;
}

/// Check that a collection name is safe to use as a table or directory name
pub fn validate_collection_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let starts_with_letter = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    let rest_ok = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if !starts_with_letter || !rest_ok || name.len() > MAX_NAME_LEN {
        return Err(RagError::ValidationError(format!(
            "invalid collection name: {name:?}"
        )));
    }
    Ok(())
}

fn effective_batch_size(batch_size: usize) -> usize {
    if batch_size == 0 {
        DEFAULT_BATCH_SIZE
    } else {
        batch_size
    }
}

// ============================================================================
// Factory function
// ============================================================================

/// Create the vector store selected by `config.backend`.
///
/// The pgvector backend shares the relational pool with the chunk store and
/// therefore requires `pool`.
pub async fn create_vector_store(
    config: &VectorConfig,
    pool: Option<PgPool>,
) -> Result<Arc<dyn VectorStore>> {
    let store: Arc<dyn VectorStore> = match config.backend {
        VectorBackend::Embedded => Arc::new(EmbeddedStore::new(config)),
        VectorBackend::PgVector => {
            let pool = pool.ok_or_else(|| {
                RagError::ConfigError("pgvector backend requires a database pool".to_string())
            })?;
            Arc::new(PgVectorStore::new(pool, config))
        }
        VectorBackend::Qdrant => Arc::new(QdrantStore::new(config)?),
    };

    store.connect().await?;
    tracing::info!(backend = %config.backend, "Vector store connected");
    Ok(store)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_collection_name() {
        assert!(validate_collection_name("collection_1536_42").is_ok());
        assert!(validate_collection_name("a").is_ok());

        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("1abc").is_err());
        assert!(validate_collection_name("Collection").is_err());
        assert!(validate_collection_name("x; DROP TABLE chunks").is_err());
        assert!(validate_collection_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_effective_batch_size() {
        assert_eq!(effective_batch_size(0), DEFAULT_BATCH_SIZE);
        assert_eq!(effective_batch_size(7), 7);
    }

    #[tokio::test]
    async fn test_pgvector_requires_pool() {
        let config = VectorConfig {
            backend: VectorBackend::PgVector,
            ..Default::default()
        };
        let err = create_vector_store(&config, None).await.err().unwrap();
        assert!(matches!(err, RagError::ConfigError(_)));
    }
}
