//! PostgreSQL + pgvector implementation of the vector store
//!
//! Every collection is a table:
//!
//! ```sql
//! CREATE TABLE {name} (
//!     id BIGSERIAL PRIMARY KEY,
//!     text TEXT NOT NULL,
//!     vector vector({width}) NOT NULL,
//!     metadata JSONB NOT NULL DEFAULT '{}',
//!     chunk_id BIGINT NOT NULL UNIQUE [REFERENCES chunks (chunk_id)]
//! )
//! ```
//!
//! The metric is kept as the table comment. An approximate index
//! (`{name}_vector_idx`) is created lazily once the table reaches the
//! configured row threshold.
//!
//! Two concurrent `create_collection(reset = true)` calls on one name may
//! interleave; existence checks are the only coordination.

use crate::{effective_batch_size, validate_collection_name, VectorStore};
use async_trait::async_trait;
use minirag_core::{
    prepare_records, CollectionInfo, DistanceMetric, IndexType, RagError, Result, SearchResult,
    VectorBackend, VectorConfig, VectorRecord, COLLECTION_PREFIX,
};
use sqlx::{PgPool, Postgres, QueryBuilder};

/// pgvector-backed vector store sharing the application pool
pub struct PgVectorStore {
    pool: PgPool,
    metric: DistanceMetric,
    index_threshold: usize,
    index_type: IndexType,
    link_chunks: bool,
}

/// Width and metric of an existing collection table
#[derive(Debug, Clone, Copy)]
struct TableMeta {
    vector_width: usize,
    metric: DistanceMetric,
}

impl PgVectorStore {
    pub fn new(pool: PgPool, config: &VectorConfig) -> Self {
        Self {
            pool,
            metric: config.distance,
            index_threshold: config.index_threshold,
            index_type: config.index_type,
            link_chunks: config.link_chunks,
        }
    }

    /// Drop the secondary index of a collection and re-evaluate the threshold
    pub async fn reset_vector_index(&self, name: &str) -> Result<()> {
        validate_collection_name(name)?;
        let Some(meta) = self.table_meta(name).await? else {
            return Err(RagError::NotFound(format!("collection {name}")));
        };

        sqlx::query(&format!("DROP INDEX IF EXISTS {}", index_name(name)))
            .execute(&self.pool)
            .await
            .map_err(|e| backend_error(name, "drop vector index", e))?;

        self.ensure_vector_index(name, meta.metric).await;
        Ok(())
    }

    async fn table_meta(&self, name: &str) -> Result<Option<TableMeta>> {
        let row: Option<(i32, Option<String>)> = sqlx::query_as(
            r#"
            SELECT a.atttypmod, obj_description(c.oid, 'pg_class')
            FROM pg_class c
            JOIN pg_attribute a ON a.attrelid = c.oid
            WHERE c.oid = to_regclass($1) AND a.attname = 'vector'
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend_error(name, "read collection metadata", e))?;

        Ok(row.map(|(typmod, comment)| TableMeta {
            vector_width: typmod.max(0) as usize,
            metric: comment
                .and_then(|c| c.parse().ok())
                .unwrap_or(self.metric),
        }))
    }

    async fn index_exists(&self, name: &str) -> Result<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM pg_indexes WHERE tablename = $1 AND indexname = $2)",
        )
        .bind(name)
        .bind(index_name(name))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| backend_error(name, "check vector index", e))
    }

    async fn row_count(&self, name: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {name}"))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| backend_error(name, "count records", e))?;
        Ok(count as u64)
    }

    /// Build the approximate index once the row count reaches the threshold.
    ///
    /// Failures are logged and never propagated to the insert path.
    async fn ensure_vector_index(&self, name: &str, metric: DistanceMetric) {
        match self.index_exists(name).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(collection = name, "Skipping index check: {e}");
                return;
            }
        }

        let count = match self.row_count(name).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(collection = name, "Skipping index check: {e}");
                return;
            }
        };
        if count < self.index_threshold as u64 {
            return;
        }

        tracing::info!(
            collection = name,
            records = count,
            index_type = ?self.index_type,
            "Creating vector index"
        );
        let sql = create_index_sql(name, self.index_type, metric);
        if let Err(e) = sqlx::query(&sql).execute(&self.pool).await {
            tracing::warn!(collection = name, "Vector index creation failed: {e}");
        }
    }

    async fn insert_batch(&self, name: &str, batch: &[VectorRecord]) -> Result<usize> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend_error(name, "begin transaction", e))?;

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO {name} (text, vector, metadata, chunk_id) "));
        builder.push_values(batch, |mut row, record| {
            row.push_bind(record.text.as_str())
                .push_bind(vector_literal(&record.vector))
                .push_unseparated("::vector")
                .push_bind(record.metadata_or_default())
                .push_bind(record.external_id);
        });
        builder.push(
            " ON CONFLICT (chunk_id) DO UPDATE SET \
             text = EXCLUDED.text, vector = EXCLUDED.vector, metadata = EXCLUDED.metadata",
        );

        builder
            .build()
            .execute(&mut *tx)
            .await
            .map_err(|e| backend_error(name, "insert batch", e))?;

        tx.commit()
            .await
            .map_err(|e| backend_error(name, "commit batch", e))?;

        Ok(batch.len())
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    fn backend(&self) -> VectorBackend {
        VectorBackend::PgVector
    }

    fn metric(&self) -> DistanceMetric {
        self.metric
    }

    async fn connect(&self) -> Result<()> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await
            .map_err(|e| RagError::DatabaseError(format!("Failed to enable pgvector: {e}")))?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        // The pool is owned by the application and closed there
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM pg_tables WHERE schemaname = current_schema() AND tablename = $1)",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| backend_error(name, "check collection", e))
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT tablename::text FROM pg_tables WHERE schemaname = current_schema() ORDER BY tablename",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RagError::VectorStoreError(format!("Failed to list collections: {e}")))?;

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
        if self.collection_exists(name).await? {
            return Ok(false);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend_error(name, "begin transaction", e))?;
        sqlx::query(&create_table_sql(name, vector_width, self.link_chunks))
            .execute(&mut *tx)
            .await
            .map_err(|e| backend_error(name, "create collection", e))?;
        sqlx::query(&format!("COMMENT ON TABLE {name} IS '{}'", self.metric))
            .execute(&mut *tx)
            .await
            .map_err(|e| backend_error(name, "record collection metric", e))?;
        tx.commit()
            .await
            .map_err(|e| backend_error(name, "create collection", e))?;

        tracing::info!(collection = name, vector_width, "Created collection");
        Ok(true)
    }

    async fn delete_collection(&self, name: &str) -> Result<bool> {
        validate_collection_name(name)?;
        if !self.collection_exists(name).await? {
            return Ok(false);
        }

        sqlx::query(&format!("DROP INDEX IF EXISTS {}", index_name(name)))
            .execute(&self.pool)
            .await
            .map_err(|e| backend_error(name, "drop vector index", e))?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {name}"))
            .execute(&self.pool)
            .await
            .map_err(|e| backend_error(name, "drop collection", e))?;

        tracing::info!(collection = name, "Deleted collection");
        Ok(true)
    }

    async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>> {
        validate_collection_name(name)?;
        if !self.collection_exists(name).await? {
            return Ok(None);
        }
        let Some(meta) = self.table_meta(name).await? else {
            return Ok(None);
        };

        let record_count = self.row_count(name).await?;
        let has_index = self.index_exists(name).await?;

        Ok(Some(CollectionInfo {
            name: name.to_string(),
            vector_width: meta.vector_width,
            metric: meta.metric,
            record_count,
            has_index,
            details: serde_json::json!({
                "table": name,
                "index_name": index_name(name),
                "index_type": index_method(self.index_type),
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
        validate_collection_name(name)?;
        let meta = self
            .table_meta(name)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("collection {name}")))?;
        let records = prepare_records(records, meta.vector_width)?;

        self.ensure_vector_index(name, meta.metric).await;

        let mut committed = 0;
        for batch in records.chunks(effective_batch_size(batch_size)) {
            match self.insert_batch(name, batch).await {
                Ok(written) => committed += written,
                Err(e) => {
                    return Err(RagError::BatchInsertError {
                        committed,
                        message: e.to_string(),
                    })
                }
            }
            self.ensure_vector_index(name, meta.metric).await;
        }

        tracing::debug!(collection = name, committed, "Inserted records");
        Ok(committed)
    }

    async fn delete_record(&self, name: &str, external_id: i64) -> Result<bool> {
        validate_collection_name(name)?;
        if !self.collection_exists(name).await? {
            return Ok(false);
        }

        let result = sqlx::query(&format!("DELETE FROM {name} WHERE chunk_id = $1"))
            .bind(external_id)
            .execute(&self.pool)
            .await
            .map_err(|e| backend_error(name, "delete record", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn search_by_vector(
        &self,
        name: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Option<Vec<SearchResult>>> {
        validate_collection_name(name)?;
        if !self.collection_exists(name).await? {
            return Ok(None);
        }
        let Some(meta) = self.table_meta(name).await? else {
            return Ok(None);
        };
        if query.len() != meta.vector_width {
            return Err(RagError::ValidationError(format!(
                "query width {} does not match collection {name} width {}",
                query.len(),
                meta.vector_width
            )));
        }

        let has_rows: bool = sqlx::query_scalar(&format!("SELECT EXISTS (SELECT 1 FROM {name})"))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| backend_error(name, "search", e))?;
        if !has_rows {
            return Ok(None);
        }

        let rows: Vec<(String, i64, f32)> = sqlx::query_as(&search_sql(name, meta.metric))
            .bind(vector_literal(query))
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| backend_error(name, "search", e))?;

        Ok(Some(
            rows.into_iter()
                .map(|(text, external_id, score)| SearchResult {
                    text,
                    score,
                    external_id,
                })
                .collect(),
        ))
    }
}

// ============================================================================
// SQL builders
// ============================================================================

fn index_name(collection: &str) -> String {
    format!("{collection}_vector_idx")
}

fn index_method(index_type: IndexType) -> &'static str {
    match index_type {
        IndexType::Hnsw => "hnsw",
        IndexType::IvfFlat => "ivfflat",
    }
}

fn operator_class(metric: DistanceMetric) -> &'static str {
    match metric {
        DistanceMetric::Cosine => "vector_cosine_ops",
        DistanceMetric::Dot => "vector_ip_ops",
    }
}

fn create_table_sql(name: &str, vector_width: usize, link_chunks: bool) -> String {
    let reference = if link_chunks {
        " REFERENCES chunks (chunk_id)"
    } else {
        ""
    };
    format!(
        "CREATE TABLE IF NOT EXISTS {name} (\
         id BIGSERIAL PRIMARY KEY, \
         text TEXT NOT NULL, \
         vector vector({vector_width}) NOT NULL, \
         metadata JSONB NOT NULL DEFAULT '{{}}', \
         chunk_id BIGINT NOT NULL UNIQUE{reference})"
    )
}

fn create_index_sql(name: &str, index_type: IndexType, metric: DistanceMetric) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {name} USING {} (vector {})",
        index_name(name),
        index_method(index_type),
        operator_class(metric)
    )
}

/// Query scoring rows so that a higher score is always more similar
fn search_sql(name: &str, metric: DistanceMetric) -> String {
    let (score, order) = match metric {
        DistanceMetric::Cosine => ("1 - (vector <=> $1::vector)", "vector <=> $1::vector"),
        DistanceMetric::Dot => ("-(vector <#> $1::vector)", "vector <#> $1::vector"),
    };
    format!("SELECT text, chunk_id, ({score})::real AS score FROM {name} ORDER BY {order} LIMIT $2")
}

/// `LIMIT` argument; PostgreSQL rejects negative limits
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// pgvector text form: `[1,2.5,-3]`
fn vector_literal(vector: &[f32]) -> String {
    let parts: Vec<String> = vector.iter().map(|x| x.to_string()).collect();
    format!("[{}]", parts.join(","))
}

fn backend_error(collection: &str, action: &str, err: sqlx::Error) -> RagError {
    tracing::error!(collection, "Failed to {action}: {err}");
    RagError::VectorStoreError(format!("Failed to {action} on {collection}: {err}"))
}

// ============================================================================
// Tests
// ============================================================================
