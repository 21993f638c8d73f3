//! Indexing, retrieval and answer scenarios
//!
//! Chunk/asset bookkeeping and the model services are in-memory stubs; the
//! vector store is the real embedded backend on a temporary directory.

use async_trait::async_trait;
use minirag_core::{
    Asset, AssetStore, ChatMessage, ChatRole, Chunk, ChunkDraft, ChunkSource, ChunkStore,
    EmbeddingKind, EmbeddingProvider, LlmClient, RagError, Result, VectorConfig,
};
use minirag_rag::{
    AnswerService, IndexRequest, IndexingPipeline, IndexingProgress, PipelineConfig,
    RetrievalService, SearchOutcome, TemplateRegistry,
};
use minirag_vector::{EmbeddedStore, VectorStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const PROJECT: i64 = 7;

// =============================================================================
// Stubs
// =============================================================================

#[derive(Default)]
struct MemoryChunkStore {
    chunks: Mutex<Vec<Chunk>>,
}

impl MemoryChunkStore {
    fn len(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn get_page(&self, project_id: i64, page_no: u32, page_size: u32) -> Result<Vec<Chunk>> {
        let chunks = self.chunks.lock().unwrap();
        let offset = (page_no.saturating_sub(1) * page_size) as usize;
        Ok(chunks
            .iter()
            .filter(|c| c.project_id == project_id)
            .skip(offset)
            .take(page_size as usize)
            .cloned()
            .collect())
    }

    async fn delete_all_for_project(&self, project_id: i64) -> Result<u64> {
        let mut chunks = self.chunks.lock().unwrap();
        let before = chunks.len();
        chunks.retain(|c| c.project_id != project_id);
        Ok((before - chunks.len()) as u64)
    }

    async fn count_for_project(&self, project_id: i64) -> Result<u64> {
        let chunks = self.chunks.lock().unwrap();
        Ok(chunks.iter().filter(|c| c.project_id == project_id).count() as u64)
    }

    async fn count_for_asset(&self, project_id: i64, asset_id: i64) -> Result<u64> {
        let chunks = self.chunks.lock().unwrap();
        Ok(chunks
            .iter()
            .filter(|c| c.project_id == project_id && c.asset_id == asset_id)
            .count() as u64)
    }

    async fn insert_many(
        &self,
        project_id: i64,
        asset_id: i64,
        drafts: &[ChunkDraft],
    ) -> Result<usize> {
        let mut chunks = self.chunks.lock().unwrap();
        let mut next_id = chunks.iter().map(|c| c.chunk_id).max().unwrap_or(0) + 1;
        for (i, draft) in drafts.iter().enumerate() {
            chunks.push(Chunk {
                chunk_id: next_id,
                project_id,
                asset_id,
                order: i as i32 + 1,
                text: draft.text.clone(),
                metadata: draft.metadata.clone(),
            });
            next_id += 1;
        }
        Ok(drafts.len())
    }
}

struct MemoryAssetStore {
    assets: Vec<Asset>,
}

impl MemoryAssetStore {
    fn with_files(names: &[&str]) -> Self {
        Self {
            assets: names
                .iter()
                .enumerate()
                .map(|(i, name)| Asset::new(i as i64 + 1, PROJECT, *name))
                .collect(),
        }
    }
}

#[async_trait]
impl AssetStore for MemoryAssetStore {
    async fn get_asset(&self, project_id: i64, name: &str) -> Result<Option<Asset>> {
        Ok(self
            .assets
            .iter()
            .find(|a| a.project_id == project_id && a.name == name)
            .cloned())
    }

    async fn list_assets(&self, project_id: i64) -> Result<Vec<Asset>> {
        Ok(self
            .assets
            .iter()
            .filter(|a| a.project_id == project_id)
            .cloned()
            .collect())
    }
}

/// Serves fixed chunk texts per file name; unknown names fail
struct StaticChunkSource {
    files: HashMap<String, Vec<String>>,
}

impl StaticChunkSource {
    fn new(files: Vec<(&str, Vec<&str>)>) -> Self {
        Self {
            files: files
                .into_iter()
                .map(|(name, texts)| {
                    (
                        name.to_string(),
                        texts.iter().map(|t| t.to_string()).collect(),
                    )
                })
                .collect(),
        }
    }
}

#[async_trait]
impl ChunkSource for StaticChunkSource {
    async fn load_chunks(&self, _project_id: i64, asset: &Asset) -> Result<Vec<ChunkDraft>> {
        let texts = self
            .files
            .get(&asset.name)
            .ok_or_else(|| RagError::NotFound(format!("file {}", asset.name)))?;
        Ok(texts.iter().map(ChunkDraft::new).collect())
    }
}

/// `[count("apple"), count("banana")]`; texts containing "poison" embed to NaN
#[derive(Default)]
struct KeywordEmbedder {
    calls: AtomicUsize,
    fail_on_call: Option<usize>,
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    async fn embed(&self, texts: &[String], _kind: EmbeddingKind) -> Result<Vec<Vec<f32>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_call == Some(call) {
            return Err(RagError::LlmError("embedding service unavailable".to_string()));
        }

        Ok(texts
            .iter()
            .map(|t| {
                if t.contains("poison") {
                    vec![f32::NAN, 0.0]
                } else {
                    vec![
                        t.matches("apple").count() as f32,
                        t.matches("banana").count() as f32,
                    ]
                }
            })
            .collect())
    }

    fn width(&self) -> usize {
        2
    }
}

struct SilentEmbedder;

#[async_trait]
impl EmbeddingProvider for SilentEmbedder {
    async fn embed(&self, _texts: &[String], _kind: EmbeddingKind) -> Result<Vec<Vec<f32>>> {
        Ok(Vec::new())
    }

    fn width(&self) -> usize {
        2
    }
}

/// Records the last prompt and history it was given
#[derive(Default)]
struct RecordingLlm {
    last: Mutex<Option<(String, Vec<ChatMessage>)>>,
}

#[async_trait]
impl LlmClient for RecordingLlm {
    async fn generate(&self, prompt: &str, history: &[ChatMessage]) -> Result<String> {
        *self.last.lock().unwrap() = Some((prompt.to_string(), history.to_vec()));
        Ok("Apples make good desserts.".to_string())
    }
}

// =============================================================================
// Fixture
// =============================================================================

struct Fixture {
    _dir: TempDir,
    store: Arc<dyn VectorStore>,
    chunks: Arc<MemoryChunkStore>,
    assets: Arc<MemoryAssetStore>,
    source: Arc<StaticChunkSource>,
}

impl Fixture {
    async fn new(assets: MemoryAssetStore, source: StaticChunkSource) -> Self {
        let dir = TempDir::new().unwrap();
        let config = VectorConfig {
            path: dir.path().to_path_buf(),
            ..Default::default()
        };
        let store = EmbeddedStore::new(&config);
        store.connect().await.unwrap();

        Self {
            _dir: dir,
            store: Arc::new(store),
            chunks: Arc::new(MemoryChunkStore::default()),
            assets: Arc::new(assets),
            source: Arc::new(source),
        }
    }

    async fn fruit() -> Self {
        Self::new(
            MemoryAssetStore::with_files(&["fruit.txt"]),
            StaticChunkSource::new(vec![("fruit.txt", vec!["apple pie", "banana bread", "apple tart"])]),
        )
        .await
    }

    fn pipeline(&self, embedder: Arc<dyn EmbeddingProvider>) -> IndexingPipeline {
        IndexingPipeline::new(
            self.store.clone(),
            embedder,
            self.chunks.clone(),
            self.assets.clone(),
            self.source.clone(),
        )
    }

    async fn record_count(&self, collection: &str) -> u64 {
        self.store
            .collection_info(collection)
            .await
            .unwrap()
            .map(|info| info.record_count)
            .unwrap_or(0)
    }
}

// =============================================================================
// Indexing
// =============================================================================

#[tokio::test]
async fn test_index_then_search_end_to_end() {
    let fx = Fixture::fruit().await;
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(KeywordEmbedder::default());

    let report = fx
        .pipeline(embedder.clone())
        .run(IndexRequest::project(PROJECT))
        .await
        .unwrap();
    assert_eq!(report.collection, "collection_2_7");
    assert_eq!(report.inserted_items, 3);
    assert_eq!(report.files_processed, 1);
    assert_eq!(report.pages, 1);

    let retrieval = RetrievalService::new(fx.store.clone(), embedder);
    let outcome = retrieval.search(PROJECT, "apple", 1).await.unwrap();
    let matches = outcome.into_matches().unwrap();

    assert_eq!(matches.len(), 1);
    assert!(matches[0].text.starts_with("apple"));
    assert_ne!(matches[0].text, "banana bread");
    assert!((matches[0].score - 1.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_project_without_files() {
    let fx = Fixture::new(MemoryAssetStore::with_files(&[]), StaticChunkSource::new(vec![])).await;

    let err = fx
        .pipeline(Arc::new(KeywordEmbedder::default()))
        .run(IndexRequest::project(PROJECT))
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::NoFilesError { project_id: PROJECT }));
}

#[tokio::test]
async fn test_unknown_file_id() {
    let fx = Fixture::fruit().await;

    let err = fx
        .pipeline(Arc::new(KeywordEmbedder::default()))
        .run(IndexRequest::project(PROJECT).with_file("missing.txt"))
        .await
        .unwrap_err();
    match err {
        RagError::FileIdError { file_id } => assert_eq!(file_id, "missing.txt"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!fx.store.collection_exists("collection_2_7").await.unwrap());
}

#[tokio::test]
async fn test_pages_until_empty_with_progress() {
    let texts: Vec<String> = (0..7).map(|i| format!("apple {i}")).collect();
    let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
    let fx = Fixture::new(
        MemoryAssetStore::with_files(&["many.txt"]),
        StaticChunkSource::new(vec![("many.txt", refs)]),
    )
    .await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let report = fx
        .pipeline(Arc::new(KeywordEmbedder::default()))
        .with_config(PipelineConfig {
            page_size: 3,
            batch_size: 2,
        })
        .with_progress(Arc::new(move |p: IndexingProgress| sink.lock().unwrap().push(p)))
        .run(IndexRequest::project(PROJECT))
        .await
        .unwrap();

    assert_eq!(report.pages, 3);
    assert_eq!(report.inserted_items, 7);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            IndexingProgress { pages: 1, inserted_items: 3, files_processed: 1 },
            IndexingProgress { pages: 2, inserted_items: 6, files_processed: 1 },
            IndexingProgress { pages: 3, inserted_items: 7, files_processed: 1 },
        ]
    );
    assert_eq!(fx.record_count(&report.collection).await, 7);
}

#[tokio::test]
async fn test_embedding_failure_aborts_with_partial_count() {
    let texts: Vec<String> = (0..6).map(|i| format!("apple {i}")).collect();
    let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
    let fx = Fixture::new(
        MemoryAssetStore::with_files(&["many.txt"]),
        StaticChunkSource::new(vec![("many.txt", refs)]),
    )
    .await;

    let embedder = KeywordEmbedder {
        fail_on_call: Some(2),
        ..Default::default()
    };
    let err = fx
        .pipeline(Arc::new(embedder))
        .with_config(PipelineConfig {
            page_size: 3,
            batch_size: 50,
        })
        .run(IndexRequest::project(PROJECT))
        .await
        .unwrap_err();

    match err {
        RagError::IndexingAborted {
            inserted,
            files_processed,
            ..
        } => {
            assert_eq!(inserted, 3);
            assert_eq!(files_processed, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fx.record_count("collection_2_7").await, 3);
}

#[tokio::test]
async fn test_insert_failure_counts_committed_batches() {
    let fx = Fixture::new(
        MemoryAssetStore::with_files(&["mixed.txt"]),
        StaticChunkSource::new(vec![(
            "mixed.txt",
            vec!["apple a", "apple b", "apple c", "apple d", "apple e", "apple f", "poison", "apple h"],
        )]),
    )
    .await;

    let err = fx
        .pipeline(Arc::new(KeywordEmbedder::default()))
        .with_config(PipelineConfig {
            page_size: 4,
            batch_size: 2,
        })
        .run(IndexRequest::project(PROJECT))
        .await
        .unwrap_err();

    match err {
        RagError::IndexingAborted { inserted, .. } => assert_eq!(inserted, 6),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fx.record_count("collection_2_7").await, 6);
}

#[tokio::test]
async fn test_failing_file_is_skipped() {
    let fx = Fixture::new(
        MemoryAssetStore::with_files(&["fruit.txt", "corrupt.pdf"]),
        StaticChunkSource::new(vec![("fruit.txt", vec!["apple pie", "banana bread"])]),
    )
    .await;

    let report = fx
        .pipeline(Arc::new(KeywordEmbedder::default()))
        .run(IndexRequest::project(PROJECT))
        .await
        .unwrap();

    assert_eq!(report.files_processed, 1);
    assert_eq!(report.inserted_items, 2);
}

#[tokio::test]
async fn test_file_without_chunks_is_not_processed() {
    let fx = Fixture::new(
        MemoryAssetStore::with_files(&["fruit.txt", "blank.txt"]),
        StaticChunkSource::new(vec![("fruit.txt", vec!["apple pie"]), ("blank.txt", vec![])]),
    )
    .await;

    let report = fx
        .pipeline(Arc::new(KeywordEmbedder::default()))
        .run(IndexRequest::project(PROJECT))
        .await
        .unwrap();

    assert_eq!(report.files_processed, 1);
    assert_eq!(report.inserted_items, 1);
}

#[tokio::test]
async fn test_rerun_is_idempotent_and_reset_rebuilds() {
    let fx = Fixture::fruit().await;
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(KeywordEmbedder::default());

    fx.pipeline(embedder.clone())
        .run(IndexRequest::project(PROJECT))
        .await
        .unwrap();
    fx.pipeline(embedder.clone())
        .run(IndexRequest::project(PROJECT))
        .await
        .unwrap();
    assert_eq!(fx.chunks.len(), 3);
    assert_eq!(fx.record_count("collection_2_7").await, 3);

    let report = fx
        .pipeline(embedder)
        .run(IndexRequest::project(PROJECT).with_reset(true))
        .await
        .unwrap();
    assert_eq!(report.inserted_items, 3);
    assert_eq!(fx.chunks.len(), 3);
    assert_eq!(fx.record_count("collection_2_7").await, 3);
}

// =============================================================================
// Retrieval and answers
// =============================================================================

#[tokio::test]
async fn test_search_outcomes_are_distinct() {
    let fx = Fixture::fruit().await;

    let retrieval = RetrievalService::new(fx.store.clone(), Arc::new(SilentEmbedder));
    assert_eq!(
        retrieval.search(PROJECT, "apple", 5).await.unwrap(),
        SearchOutcome::NoEmbedding
    );

    let retrieval = RetrievalService::new(fx.store.clone(), Arc::new(KeywordEmbedder::default()));
    assert_eq!(
        retrieval.search(PROJECT, "apple", 5).await.unwrap(),
        SearchOutcome::NoMatches
    );
    assert!(retrieval.collection_info(PROJECT).await.unwrap().is_none());
}

#[tokio::test]
async fn test_reset_collection() {
    let fx = Fixture::fruit().await;
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(KeywordEmbedder::default());
    fx.pipeline(embedder.clone())
        .run(IndexRequest::project(PROJECT))
        .await
        .unwrap();

    let retrieval = RetrievalService::new(fx.store.clone(), embedder);
    let info = retrieval.collection_info(PROJECT).await.unwrap().unwrap();
    assert_eq!(info.record_count, 3);

    assert!(retrieval.reset_collection(PROJECT).await.unwrap());
    assert!(!retrieval.reset_collection(PROJECT).await.unwrap());
}

#[tokio::test]
async fn test_answer_renders_templates() {
    let fx = Fixture::fruit().await;
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(KeywordEmbedder::default());
    fx.pipeline(embedder.clone())
        .run(IndexRequest::project(PROJECT))
        .await
        .unwrap();

    let llm = Arc::new(RecordingLlm::default());
    let service = AnswerService::new(
        RetrievalService::new(fx.store.clone(), embedder),
        llm.clone(),
        TemplateRegistry::new("en", "en"),
    );

    let answer = service.answer(PROJECT, "apple", 2).await.unwrap().unwrap();
    assert_eq!(answer.answer, "Apples make good desserts.");
    assert!(answer.full_prompt.starts_with("## Document No: 1\n### Content: apple"));
    assert!(answer.full_prompt.contains("## Document No: 2"));
    assert!(answer.full_prompt.ends_with("## Question:\napple\n\n## Answer:"));
    assert_eq!(answer.chat_history.len(), 1);
    assert_eq!(answer.chat_history[0].role, ChatRole::System);

    let (prompt, history) = llm.last.lock().unwrap().clone().unwrap();
    assert_eq!(prompt, answer.full_prompt);
    assert_eq!(history, answer.chat_history);
}

#[tokio::test]
async fn test_answer_without_matches_is_none() {
    let fx = Fixture::fruit().await;
    let service = AnswerService::new(
        RetrievalService::new(fx.store.clone(), Arc::new(KeywordEmbedder::default())),
        Arc::new(RecordingLlm::default()),
        TemplateRegistry::new("en", "en"),
    );

    assert!(service.answer(PROJECT, "apple", 3).await.unwrap().is_none());
}

#[test]
fn test_generate_stories() {
    tokio_test::block_on(async {
        let fx = Fixture::fruit().await;
        let llm = Arc::new(RecordingLlm::default());
        let service = AnswerService::new(
            RetrievalService::new(fx.store.clone(), Arc::new(KeywordEmbedder::default())),
            llm.clone(),
            TemplateRegistry::new("en", "en"),
        );

        service.generate_stories("Build a login page.").await.unwrap();

        let (prompt, history) = llm.last.lock().unwrap().clone().unwrap();
        assert!(prompt.contains("## Document:\nBuild a login page.\n\n## Generated Stories:"));
        assert!(history[0].content.contains("ClickUp stories"));
    });
}
