//! PostgreSQL chunk and asset store
//!
//! Provides the relational bookkeeping consumed by the indexing pipeline
//! (assets and their chunks) using SQLx and PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, QueryBuilder};

use crate::{Asset, AssetStore, Chunk, ChunkDraft, ChunkStore, RagError, Result};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS assets (
        asset_id BIGSERIAL PRIMARY KEY,
        asset_project_id BIGINT NOT NULL,
        asset_name TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (asset_project_id, asset_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        chunk_id BIGSERIAL PRIMARY KEY,
        chunk_project_id BIGINT NOT NULL,
        chunk_asset_id BIGINT NOT NULL REFERENCES assets (asset_id),
        chunk_order INTEGER NOT NULL,
        chunk_text TEXT NOT NULL,
        chunk_metadata JSONB,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS chunks_project_id_idx ON chunks (chunk_project_id)",
];

/// PostgreSQL chunk/asset store
#[derive(Clone)]
pub struct MetadataStore {
    pool: PgPool,
}

impl MetadataStore {
    /// Create a new store connection
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| RagError::DatabaseError(format!("PostgreSQL connection failed: {e}")))?;

        Ok(Self { pool })
    }

    /// Create from an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the assets and chunks tables if they are missing
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| RagError::DatabaseError(format!("Schema migration failed: {e}")))?;
        }
        Ok(())
    }

    /// Register an asset, returning the existing row if the name is taken
    pub async fn create_asset(&self, project_id: i64, name: &str) -> Result<Asset> {
        let row: AssetRow = sqlx::query_as(
            r#"
            INSERT INTO assets (asset_project_id, asset_name)
            VALUES ($1, $2)
            ON CONFLICT (asset_project_id, asset_name)
                DO UPDATE SET asset_name = EXCLUDED.asset_name
            RETURNING asset_id, asset_project_id, asset_name, created_at
            "#,
        )
        .bind(project_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RagError::DatabaseError(format!("Failed to create asset: {e}")))?;

        Ok(row.into())
    }
}

/// Asset row from database
#[derive(Debug, FromRow)]
struct AssetRow {
    asset_id: i64,
    asset_project_id: i64,
    asset_name: String,
    created_at: DateTime<Utc>,
}

impl From<AssetRow> for Asset {
    fn from(row: AssetRow) -> Self {
        Asset {
            asset_id: row.asset_id,
            project_id: row.asset_project_id,
            name: row.asset_name,
            created_at: row.created_at,
        }
    }
}

/// Chunk row from database
#[derive(Debug, FromRow)]
struct ChunkRow {
    chunk_id: i64,
    chunk_project_id: i64,
    chunk_asset_id: i64,
    chunk_order: i32,
    chunk_text: String,
    chunk_metadata: Option<serde_json::Value>,
}

impl From<ChunkRow> for Chunk {
    fn from(row: ChunkRow) -> Self {
        Chunk {
            chunk_id: row.chunk_id,
            project_id: row.chunk_project_id,
            asset_id: row.chunk_asset_id,
            order: row.chunk_order,
            text: row.chunk_text,
            metadata: row.chunk_metadata,
        }
    }
}

#[async_trait]
impl ChunkStore for MetadataStore {
    async fn get_page(&self, project_id: i64, page_no: u32, page_size: u32) -> Result<Vec<Chunk>> {
        let offset = i64::from(page_no.saturating_sub(1)) * i64::from(page_size);

        let rows: Vec<ChunkRow> = sqlx::query_as(
            r#"
            SELECT chunk_id, chunk_project_id, chunk_asset_id, chunk_order, chunk_text, chunk_metadata
            FROM chunks
            WHERE chunk_project_id = $1
            ORDER BY chunk_id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(project_id)
        .bind(i64::from(page_size))
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RagError::DatabaseError(format!("Failed to fetch chunk page: {e}")))?;

        Ok(rows.into_iter().map(Chunk::from).collect())
    }

    async fn delete_all_for_project(&self, project_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunks WHERE chunk_project_id = $1")
            .bind(project_id)
            .execute(&self.pool)
            .await
            .map_err(|e| RagError::DatabaseError(format!("Failed to delete chunks: {e}")))?;

        Ok(result.rows_affected())
    }

    async fn count_for_project(&self, project_id: i64) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE chunk_project_id = $1")
            .bind(project_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RagError::DatabaseError(format!("Failed to count chunks: {e}")))?;

        Ok(count as u64)
    }

    async fn count_for_asset(&self, project_id: i64, asset_id: i64) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks WHERE chunk_project_id = $1 AND chunk_asset_id = $2",
        )
        .bind(project_id)
        .bind(asset_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RagError::DatabaseError(format!("Failed to count chunks: {e}")))?;

        Ok(count as u64)
    }

    async fn insert_many(
        &self,
        project_id: i64,
        asset_id: i64,
        drafts: &[ChunkDraft],
    ) -> Result<usize> {
        if drafts.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RagError::DatabaseError(format!("Failed to begin transaction: {e}")))?;

        for (batch_no, batch) in drafts.chunks(100).enumerate() {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO chunks (chunk_project_id, chunk_asset_id, chunk_order, chunk_text, chunk_metadata) ",
            );
            builder.push_values(batch.iter().enumerate(), |mut row, (i, draft)| {
                let order = (batch_no * 100 + i + 1) as i32;
                row.push_bind(project_id)
                    .push_bind(asset_id)
                    .push_bind(order)
                    .push_bind(draft.text.as_str())
                    .push_bind(draft.metadata.clone());
            });

            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| RagError::DatabaseError(format!("Failed to insert chunks: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| RagError::DatabaseError(format!("Failed to commit chunks: {e}")))?;

        Ok(drafts.len())
    }
}

#[async_trait]
impl AssetStore for MetadataStore {
    async fn get_asset(&self, project_id: i64, name: &str) -> Result<Option<Asset>> {
        let row: Option<AssetRow> = sqlx::query_as(
            r#"
            SELECT asset_id, asset_project_id, asset_name, created_at
            FROM assets
            WHERE asset_project_id = $1 AND asset_name = $2
            "#,
        )
        .bind(project_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RagError::DatabaseError(format!("Failed to get asset: {e}")))?;

        Ok(row.map(Asset::from))
    }

    async fn list_assets(&self, project_id: i64) -> Result<Vec<Asset>> {
        let rows: Vec<AssetRow> = sqlx::query_as(
            r#"
            SELECT asset_id, asset_project_id, asset_name, created_at
            FROM assets
            WHERE asset_project_id = $1
            ORDER BY asset_id
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RagError::DatabaseError(format!("Failed to list assets: {e}")))?;

        Ok(rows.into_iter().map(Asset::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_row_conversion() {
        let row = ChunkRow {
            chunk_id: 9,
            chunk_project_id: 1,
            chunk_asset_id: 3,
            chunk_order: 2,
            chunk_text: "apple pie".to_string(),
            chunk_metadata: None,
        };

        let chunk = Chunk::from(row);
        assert_eq!(chunk.chunk_id, 9);
        assert_eq!(chunk.asset_id, 3);
        assert_eq!(chunk.text, "apple pie");
    }

    #[tokio::test]
    #[ignore] // Requires DATABASE_URL
    async fn test_chunk_paging_roundtrip() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let store = MetadataStore::new(&url, 2).await.unwrap();
        store.migrate().await.unwrap();

        let project_id = 900_001;
        store.delete_all_for_project(project_id).await.unwrap();
        let asset = store.create_asset(project_id, "paging.txt").await.unwrap();

        let drafts: Vec<ChunkDraft> = (0..5).map(|i| ChunkDraft::new(format!("c{i}"))).collect();
        assert_eq!(
            store.insert_many(project_id, asset.asset_id, &drafts).await.unwrap(),
            5
        );

        assert_eq!(store.get_page(project_id, 1, 2).await.unwrap().len(), 2);
        assert_eq!(store.get_page(project_id, 3, 2).await.unwrap().len(), 1);
        assert!(store.get_page(project_id, 4, 2).await.unwrap().is_empty());
        assert_eq!(store.count_for_asset(project_id, asset.asset_id).await.unwrap(), 5);
        assert_eq!(store.delete_all_for_project(project_id).await.unwrap(), 5);
    }
}
