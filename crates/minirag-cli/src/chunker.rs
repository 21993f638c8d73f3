//! Plain-text chunk source for uploaded project files
//!
//! Files live at `{files_dir}/{project_id}/{asset name}` and are cut into
//! fixed-size character windows with a configurable overlap.

use async_trait::async_trait;
use minirag_core::{Asset, ChunkDraft, ChunkSource, IndexingConfig, RagError, Result};
use std::path::PathBuf;

pub struct TextFileChunkSource {
    files_dir: PathBuf,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextFileChunkSource {
    pub fn from_config(config: &IndexingConfig) -> Self {
        Self {
            files_dir: config.files_dir.clone(),
            chunk_size: config.chunk_size.max(1),
            chunk_overlap: config.chunk_overlap,
        }
    }

    pub fn asset_path(&self, project_id: i64, name: &str) -> PathBuf {
        self.files_dir.join(project_id.to_string()).join(name)
    }
}

/// Split `text` into windows of `size` chars, each overlapping the last by `overlap`
fn split_windows(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let step = size.saturating_sub(overlap).max(1);

    let mut windows = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        let window: String = chars[start..end].iter().collect();
        if !window.trim().is_empty() {
            windows.push(window.trim().to_string());
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }
    windows
}

#[async_trait]
impl ChunkSource for TextFileChunkSource {
    async fn load_chunks(&self, project_id: i64, asset: &Asset) -> Result<Vec<ChunkDraft>> {
        let path = self.asset_path(project_id, &asset.name);
        let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
            RagError::NotFound(format!("Cannot read {}: {e}", path.display()))
        })?;

        Ok(split_windows(&text, self.chunk_size, self.chunk_overlap)
            .into_iter()
            .enumerate()
            .map(|(i, window)| ChunkDraft {
                text: window,
                metadata: Some(serde_json::json!({
                    "source": asset.name,
                    "window": i,
                })),
            })
            .collect())
    }
}
