//! pgvector store integration tests
//!
//! Note: every test here is #[ignore] and needs a PostgreSQL server with the
//! pgvector extension available. Run with:
//! DATABASE_URL=postgres://... cargo test -p minirag-vector -- --ignored

use minirag_core::{RagError, VectorConfig, VectorRecord};
use minirag_vector::{PgVectorStore, VectorStore};
use sqlx::postgres::PgPoolOptions;

async fn open_store(index_threshold: usize) -> PgVectorStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .unwrap();

    let config = VectorConfig {
        index_threshold,
        link_chunks: false,
        ..Default::default()
    };
    let store = PgVectorStore::new(pool, &config);
    store.connect().await.unwrap();
    store
}

fn records(range: std::ops::Range<i64>, width: usize) -> Vec<VectorRecord> {
    range
        .map(|i| VectorRecord::new(i, format!("chunk {i}"), vec![1.0 + i as f32; width]))
        .collect()
}

fn at_cosine(cos: f32) -> Vec<f32> {
    vec![cos, (1.0 - cos * cos).sqrt()]
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with pgvector
async fn test_create_collection_is_idempotent() {
    let store = open_store(100).await;
    let name = "collection_4_910001";
    store.delete_collection(name).await.unwrap();

    assert!(store.create_collection(name, 4, false).await.unwrap());
    assert!(!store.create_collection(name, 8, false).await.unwrap());

    let info = store.collection_info(name).await.unwrap().unwrap();
    assert_eq!(info.vector_width, 4);
    assert_eq!(info.record_count, 0);
    assert!(!info.has_index);

    assert!(store.create_collection(name, 8, true).await.unwrap());
    let info = store.collection_info(name).await.unwrap().unwrap();
    assert_eq!(info.vector_width, 8);

    assert!(store.delete_collection(name).await.unwrap());
    assert!(store.collection_info(name).await.unwrap().is_none());
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with pgvector
async fn test_width_mismatch_leaves_table_unchanged() {
    let store = open_store(100).await;
    let name = "collection_3_910002";
    store.create_collection(name, 3, true).await.unwrap();
    store.insert_many(name, &records(0..2, 3), 50).await.unwrap();

    let mut batch = records(10..13, 3);
    batch[2].vector = vec![1.0];
    let err = store.insert_many(name, &batch, 50).await.unwrap_err();

    assert!(matches!(err, RagError::ValidationError(_)));
    let info = store.collection_info(name).await.unwrap().unwrap();
    assert_eq!(info.record_count, 2);
    store.delete_collection(name).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with pgvector
async fn test_failed_batch_keeps_committed_prefix() {
    let store = open_store(1000).await;
    let name = "collection_2_910003";
    store.create_collection(name, 2, true).await.unwrap();

    let mut batch = records(0..120, 2);
    batch[105].vector = vec![f32::NAN, 0.0];
    let err = store.insert_many(name, &batch, 50).await.unwrap_err();

    match err {
        RagError::BatchInsertError { committed, .. } => assert_eq!(committed, 100),
        other => panic!("unexpected error: {other}"),
    }
    let info = store.collection_info(name).await.unwrap().unwrap();
    assert_eq!(info.record_count, 100);
    store.delete_collection(name).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with pgvector
async fn test_index_is_created_at_threshold() {
    let store = open_store(100).await;
    let name = "collection_2_910004";
    store.create_collection(name, 2, true).await.unwrap();

    store.insert_many(name, &records(0..99, 2), 50).await.unwrap();
    assert!(!store.collection_info(name).await.unwrap().unwrap().has_index);

    store.insert_many(name, &records(99..100, 2), 50).await.unwrap();
    assert!(store.collection_info(name).await.unwrap().unwrap().has_index);

    store.insert_many(name, &records(100..150, 2), 50).await.unwrap();
    let info = store.collection_info(name).await.unwrap().unwrap();
    assert!(info.has_index);
    assert_eq!(info.record_count, 150);

    store.reset_vector_index(name).await.unwrap();
    assert!(store.collection_info(name).await.unwrap().unwrap().has_index);
    store.delete_collection(name).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with pgvector
async fn test_search_orders_by_similarity() {
    let store = open_store(100).await;
    let name = "collection_2_910005";
    store.create_collection(name, 2, true).await.unwrap();
    assert!(store
        .search_by_vector(name, &[1.0, 0.0], 2)
        .await
        .unwrap()
        .is_none());

    store
        .insert_many(
            name,
            &[
                VectorRecord::new(1, "low", at_cosine(0.1)),
                VectorRecord::new(2, "high", at_cosine(0.9)),
                VectorRecord::new(3, "mid", at_cosine(0.5)),
            ],
            50,
        )
        .await
        .unwrap();

    let results = store
        .search_by_vector(name, &[1.0, 0.0], 2)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].external_id, 2);
    assert_eq!(results[1].external_id, 3);
    assert!((results[0].score - 0.9).abs() < 1e-4);

    assert!(store.delete_record(name, 2).await.unwrap());
    store.delete_collection(name).await.unwrap();
}
