//! Qdrant implementation of the vector store
//!
//! Each minirag collection maps to a Qdrant collection of the same name.
//! Points are keyed by the record's external id and carry
//! `{ text, metadata }` as payload. Qdrant maintains its own HNSW index.

use crate::{effective_batch_size, validate_collection_name, VectorStore};
use async_trait::async_trait;
use minirag_core::{
    prepare_records, CollectionInfo, DistanceMetric, RagError, Result, SearchResult,
    VectorBackend, VectorConfig, VectorRecord, COLLECTION_PREFIX,
};
use qdrant_client::qdrant::point_id::PointIdOptions;
use qdrant_client::qdrant::vectors_config::Config as VectorsConfigKind;
use qdrant_client::qdrant::{
    CountPointsBuilder, CreateCollectionBuilder, DeleteCollectionBuilder, DeletePointsBuilder,
    Distance, GetPointsBuilder, PointId, PointStruct, PointsIdsList, SearchPointsBuilder,
    UpsertPointsBuilder, Value, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use std::collections::HashMap;

/// Qdrant vector store implementation
pub struct QdrantStore {
    client: Qdrant,
    url: String,
    metric: DistanceMetric,
}

/// Width and metric read back from a Qdrant collection
struct RemoteCollection {
    vector_width: usize,
    metric: DistanceMetric,
    points_count: u64,
    indexed_vectors_count: u64,
    status: i32,
}

impl QdrantStore {
    /// Create a new Qdrant client (no I/O until [`VectorStore::connect`])
    pub fn new(config: &VectorConfig) -> Result<Self> {
        let client = Qdrant::from_url(&config.qdrant_url)
            .build()
            .map_err(|e| RagError::VectorStoreError(format!("Qdrant connection failed: {e}")))?;

        Ok(Self {
            client,
            url: config.qdrant_url.clone(),
            metric: config.distance,
        })
    }

    async fn list_all(&self) -> Result<Vec<String>> {
        let collections = self.client.list_collections().await.map_err(|e| {
            RagError::VectorStoreError(format!("Failed to list collections: {e}"))
        })?;

        Ok(collections
            .collections
            .into_iter()
            .map(|c| c.name)
            .collect())
    }

    async fn remote_collection(&self, name: &str) -> Result<Option<RemoteCollection>> {
        if !self.collection_exists(name).await? {
            return Ok(None);
        }

        let response = self
            .client
            .collection_info(name)
            .await
            .map_err(|e| qdrant_error(name, "read collection info", e))?;
        let Some(info) = response.result else {
            return Ok(None);
        };

        let params = info
            .config
            .as_ref()
            .and_then(|c| c.params.as_ref())
            .and_then(|p| p.vectors_config.as_ref())
            .and_then(|v| v.config.as_ref())
            .and_then(|c| match c {
                VectorsConfigKind::Params(params) => Some(params.clone()),
                VectorsConfigKind::ParamsMap(_) => None,
            })
            .ok_or_else(|| {
                RagError::VectorStoreError(format!("collection {name} has no single vector config"))
            })?;

        let metric = match Distance::try_from(params.distance) {
            Ok(Distance::Dot) => DistanceMetric::Dot,
            _ => DistanceMetric::Cosine,
        };

        let points_count = self
            .client
            .count(CountPointsBuilder::new(name).exact(true))
            .await
            .map_err(|e| qdrant_error(name, "count points", e))?
            .result
            .map(|r| r.count)
            .unwrap_or(0);

        Ok(Some(RemoteCollection {
            vector_width: params.size as usize,
            metric,
            points_count,
            indexed_vectors_count: info.indexed_vectors_count.unwrap_or(0),
            status: info.status,
        }))
    }
}

fn point_id(external_id: i64) -> Result<PointId> {
    u64::try_from(external_id)
        .map(PointId::from)
        .map_err(|_| {
            RagError::ValidationError(format!(
                "Qdrant point ids must be non-negative, got {external_id}"
            ))
        })
}

fn external_id(id: Option<PointId>) -> Option<i64> {
    match id?.point_id_options? {
        PointIdOptions::Num(n) => i64::try_from(n).ok(),
        PointIdOptions::Uuid(_) => None,
    }
}

fn to_point(record: &VectorRecord) -> Result<PointStruct> {
    let payload = serde_json::json!({
        "text": record.text,
        "metadata": record.metadata_or_default(),
    });

    let payload_map: HashMap<String, Value> = payload
        .as_object()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.into()))
        .collect();

    Ok(PointStruct::new(
        point_id(record.external_id)?,
        record.vector.clone(),
        payload_map,
    ))
}

fn qdrant_error(collection: &str, action: &str, err: impl std::fmt::Display) -> RagError {
    tracing::error!(collection, "Failed to {action}: {err}");
    RagError::VectorStoreError(format!("Failed to {action} on {collection}: {err}"))
}

#[async_trait]
impl VectorStore for QdrantStore {
    fn backend(&self) -> VectorBackend {
        VectorBackend::Qdrant
    }

    fn metric(&self) -> DistanceMetric {
        self.metric
    }

    async fn connect(&self) -> Result<()> {
        self.client.health_check().await.map_err(|e| {
            RagError::VectorStoreError(format!("Qdrant at {} is unreachable: {e}", self.url))
        })?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        Ok(self.list_all().await?.iter().any(|c| c == name))
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .list_all()
            .await?
            .into_iter()
            .filter(|n| n.starts_with(COLLECTION_PREFIX))
            .collect();
        names.sort();
        Ok(names)
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

        let distance = match self.metric {
            DistanceMetric::Cosine => Distance::Cosine,
            DistanceMetric::Dot => Distance::Dot,
        };
        self.client
            .create_collection(
                CreateCollectionBuilder::new(name)
                    .vectors_config(VectorParamsBuilder::new(vector_width as u64, distance)),
            )
            .await
            .map_err(|e| qdrant_error(name, "create collection", e))?;

        tracing::info!(collection = name, vector_width, "Created collection");
        Ok(true)
    }

    async fn delete_collection(&self, name: &str) -> Result<bool> {
        if !self.collection_exists(name).await? {
            return Ok(false);
        }

        self.client
            .delete_collection(DeleteCollectionBuilder::new(name))
            .await
            .map_err(|e| qdrant_error(name, "delete collection", e))?;

        tracing::info!(collection = name, "Deleted collection");
        Ok(true)
    }

    async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>> {
        let Some(remote) = self.remote_collection(name).await? else {
            return Ok(None);
        };

        Ok(Some(CollectionInfo {
            name: name.to_string(),
            vector_width: remote.vector_width,
            metric: remote.metric,
            record_count: remote.points_count,
            has_index: remote.indexed_vectors_count > 0,
            details: serde_json::json!({
                "url": self.url,
                "indexed_vectors_count": remote.indexed_vectors_count,
                "status": remote.status,
            }),
        }))
    }

    async fn insert_many(
        &self,
        name: &str,
        records: &[VectorRecord],
        batch_size: usize,
    ) -> Result<usize> {
        let remote = self
            .remote_collection(name)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("collection {name}")))?;
        let records = prepare_records(records, remote.vector_width)?;
        let points = records.iter().map(to_point).collect::<Result<Vec<_>>>()?;

        let mut committed = 0;
        for batch in points.chunks(effective_batch_size(batch_size)) {
            let result = self
                .client
                .upsert_points(UpsertPointsBuilder::new(name, batch.to_vec()).wait(true))
                .await;

            if let Err(e) = result {
                return Err(RagError::BatchInsertError {
                    committed,
                    message: qdrant_error(name, "upsert points", e).to_string(),
                });
            }
            committed += batch.len();
        }

        Ok(committed)
    }

    async fn delete_record(&self, name: &str, external_id: i64) -> Result<bool> {
        if !self.collection_exists(name).await? {
            return Ok(false);
        }
        let id = point_id(external_id)?;

        let existing = self
            .client
            .get_points(GetPointsBuilder::new(name, vec![id.clone()]))
            .await
            .map_err(|e| qdrant_error(name, "get point", e))?;
        if existing.result.is_empty() {
            return Ok(false);
        }

        self.client
            .delete_points(
                DeletePointsBuilder::new(name)
                    .points(PointsIdsList { ids: vec![id] })
                    .wait(true),
            )
            .await
            .map_err(|e| qdrant_error(name, "delete point", e))?;
        Ok(true)
    }

    async fn search_by_vector(
        &self,
        name: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Option<Vec<SearchResult>>> {
        let Some(remote) = self.remote_collection(name).await? else {
            return Ok(None);
        };
        if remote.points_count == 0 {
            return Ok(None);
        }
        if query.len() != remote.vector_width {
            return Err(RagError::ValidationError(format!(
                "query width {} does not match collection {name} width {}",
                query.len(),
                remote.vector_width
            )));
        }

        let results = self
            .client
            .search_points(
                SearchPointsBuilder::new(name, query.to_vec(), limit as u64).with_payload(true),
            )
            .await
            .map_err(|e| qdrant_error(name, "search", e))?;

        let matches = results
            .result
            .into_iter()
            .filter_map(|point| {
                let text = point
                    .payload
                    .get("text")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_default();

                Some(SearchResult {
                    text,
                    score: point.score,
                    external_id: external_id(point.id)?,
                })
            })
            .collect();

        Ok(Some(matches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_client_without_server() {
        let config = VectorConfig {
            backend: VectorBackend::Qdrant,
            qdrant_url: "http://localhost:6334".to_string(),
            distance: DistanceMetric::Dot,
            ..Default::default()
        };
        let store = QdrantStore::new(&config).unwrap();
        assert_eq!(store.backend(), VectorBackend::Qdrant);
        assert_eq!(store.metric(), DistanceMetric::Dot);
    }

    #[test]
    fn test_point_id_rejects_negative() {
        assert!(point_id(5).is_ok());
        assert!(point_id(-1).unwrap_err().is_validation());
    }

    #[test]
    fn test_external_id_roundtrip() {
        let id = point_id(42).unwrap();
        assert_eq!(external_id(Some(id)), Some(42));
        assert_eq!(external_id(None), None);
    }

    #[test]
    fn test_point_payload() {
        let record = VectorRecord::new(3, "apple pie", vec![1.0, 0.0])
            .with_metadata(serde_json::json!({"page": 1}));
        let point = to_point(&record).unwrap();

        assert_eq!(
            point.payload.get("text").and_then(|v| v.as_str()).map(|s| s.to_string()),
            Some("apple pie".to_string())
        );
        assert!(point.payload.contains_key("metadata"));
    }
}
