//! Process-local similarity engine
//!
//! Each collection lives in its own directory under the engine root:
//!
//! ```text
//! {root}/{collection}/config.json   width + metric, written once
//! {root}/{collection}/points.log    append-only JSON lines (upserts, deletes)
//! ```
//!
//! A write batch is validated in full, appended with a single write and
//! synced before it is applied in memory, so a batch is either entirely in
//! the log or not at all. Each collection remembers the length of its last
//! committed append; bytes past it belong to a failed write and are cut off
//! before the next one. Opening the engine replays every log: only the final
//! line may be torn, any other unreadable line fails the open.

use super::index::DenseIndex;
use minirag_core::{DistanceMetric, RagError, Result, SearchResult, VectorRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

const CONFIG_FILE: &str = "config.json";
const LOG_FILE: &str = "points.log";

/// Immutable parameters of a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub name: String,
    pub vector_width: usize,
    pub metric: DistanceMetric,
}

/// A stored point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPoint {
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: serde_json::Value,
}

/// One line of `points.log`
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum LogEntry {
    Upsert {
        id: i64,
        #[serde(flatten)]
        point: StoredPoint,
    },
    Delete {
        id: i64,
    },
}

/// Point-in-time statistics of a collection
#[derive(Debug, Clone)]
pub struct CollectionStats {
    pub config: CollectionConfig,
    pub points: usize,
    pub indexed_points: Option<usize>,
    pub index_builds: u32,
    pub path: PathBuf,
}

struct CollectionState {
    config: CollectionConfig,
    dir: PathBuf,
    points: BTreeMap<i64, StoredPoint>,
    index: Option<DenseIndex>,
    index_builds: u32,
    /// Byte length of the log up to the last committed append
    log_len: u64,
}

impl CollectionState {
    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// Build the dense index once the collection reaches `threshold` points
    fn maybe_build_index(&mut self, threshold: usize) {
        if self.index.is_some() || self.points.len() < threshold {
            return;
        }

        tracing::info!(
            collection = %self.config.name,
            points = self.points.len(),
            "Building dense index"
        );
        self.index = Some(DenseIndex::build(
            self.config.metric,
            self.config.vector_width,
            self.points.iter().map(|(id, p)| (*id, p.vector.as_slice())),
        ));
        self.index_builds += 1;
    }
}

/// Embedded single-writer similarity engine
pub struct LocalEngine {
    root: PathBuf,
    index_threshold: usize,
    collections: RwLock<HashMap<String, CollectionState>>,
}

impl LocalEngine {
    /// Open (or initialize) an engine rooted at `root`
    pub fn open(root: impl AsRef<Path>, index_threshold: usize) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| io_error("create engine root", &root, e))?;

        let mut collections = HashMap::new();
        let entries = fs::read_dir(&root).map_err(|e| io_error("read engine root", &root, e))?;
        for entry in entries {
            let dir = entry.map_err(|e| io_error("read engine root", &root, e))?.path();
            if !dir.join(CONFIG_FILE).is_file() {
                continue;
            }
            let state = load_collection(&dir, index_threshold)?;
            tracing::debug!(
                collection = %state.config.name,
                points = state.points.len(),
                "Loaded collection"
            );
            collections.insert(state.config.name.clone(), state);
        }

        Ok(Self {
            root,
            index_threshold,
            collections: RwLock::new(collections),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn collection_exists(&self, name: &str) -> Result<bool> {
        Ok(self.read()?.contains_key(name))
    }

    pub fn list_collections(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.read()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Create a collection; `false` if it already exists
    pub fn create_collection(&self, config: CollectionConfig) -> Result<bool> {
        let mut collections = self.write()?;
        if collections.contains_key(&config.name) {
            return Ok(false);
        }

        let dir = self.root.join(&config.name);
        fs::create_dir_all(&dir).map_err(|e| io_error("create collection dir", &dir, e))?;

        let config_json = serde_json::to_vec_pretty(&config)
            .map_err(|e| RagError::VectorStoreError(format!("Failed to encode config: {e}")))?;
        let tmp = dir.join(format!("{CONFIG_FILE}.tmp"));
        write_synced(&tmp, &config_json)?;
        fs::rename(&tmp, dir.join(CONFIG_FILE))
            .map_err(|e| io_error("install collection config", &dir, e))?;
        write_synced(&dir.join(LOG_FILE), &[])?;

        collections.insert(
            config.name.clone(),
            CollectionState {
                config,
                dir,
                points: BTreeMap::new(),
                index: None,
                index_builds: 0,
                log_len: 0,
            },
        );
        Ok(true)
    }

    /// Drop a collection and its files; `false` if it did not exist
    pub fn delete_collection(&self, name: &str) -> Result<bool> {
        let mut collections = self.write()?;
        let Some(state) = collections.remove(name) else {
            return Ok(false);
        };

        fs::remove_dir_all(&state.dir)
            .map_err(|e| io_error("remove collection dir", &state.dir, e))?;
        Ok(true)
    }

    pub fn stats(&self, name: &str) -> Result<Option<CollectionStats>> {
        let collections = self.read()?;
        Ok(collections.get(name).map(|state| CollectionStats {
            config: state.config.clone(),
            points: state.points.len(),
            indexed_points: state.index.as_ref().map(DenseIndex::rows),
            index_builds: state.index_builds,
            path: state.dir.clone(),
        }))
    }

    /// Durably upsert one batch of records.
    ///
    /// The whole batch is rejected if any vector has the wrong width or a
    /// non-finite component.
    pub fn upsert_batch(&self, name: &str, records: &[VectorRecord]) -> Result<usize> {
        let mut collections = self.write()?;
        let state = collections
            .get_mut(name)
            .ok_or_else(|| RagError::NotFound(format!("collection {name}")))?;

        for record in records {
            check_vector(&state.config, &record.vector)?;
        }

        let entries: Vec<LogEntry> = records
            .iter()
            .map(|r| LogEntry::Upsert {
                id: r.external_id,
                point: StoredPoint {
                    text: r.text.clone(),
                    vector: r.vector.clone(),
                    metadata: r.metadata_or_default(),
                },
            })
            .collect();
        state.log_len = append_entries(&state.log_path(), state.log_len, &entries)?;

        for entry in entries {
            if let LogEntry::Upsert { id, point } = entry {
                if let Some(index) = state.index.as_mut() {
                    index.upsert(id, &point.vector);
                }
                state.points.insert(id, point);
            }
        }
        state.maybe_build_index(self.index_threshold);

        Ok(records.len())
    }

    /// Durably delete one point; `false` if it was absent
    pub fn delete_point(&self, name: &str, id: i64) -> Result<bool> {
        let mut collections = self.write()?;
        let Some(state) = collections.get_mut(name) else {
            return Ok(false);
        };
        if !state.points.contains_key(&id) {
            return Ok(false);
        }

        let entry = [LogEntry::Delete { id }];
        state.log_len = append_entries(&state.log_path(), state.log_len, &entry)?;
        state.points.remove(&id);
        if let Some(index) = state.index.as_mut() {
            index.remove(id);
        }
        Ok(true)
    }

    /// Top `limit` matches; `None` when the collection is missing or empty
    pub fn search(&self, name: &str, query: &[f32], limit: usize) -> Result<Option<Vec<SearchResult>>> {
        let collections = self.read()?;
        let Some(state) = collections.get(name) else {
            return Ok(None);
        };
        if state.points.is_empty() {
            return Ok(None);
        }
        check_vector(&state.config, query)?;

        let ranked = match &state.index {
            Some(index) => index.search(query, limit),
            None => linear_scan(state, query, limit),
        };

        let results = ranked
            .into_iter()
            .filter_map(|(id, score)| {
                state.points.get(&id).map(|point| SearchResult {
                    text: point.text.clone(),
                    score,
                    external_id: id,
                })
            })
            .collect();

        Ok(Some(results))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, CollectionState>>> {
        self.collections
            .read()
            .map_err(|_| RagError::VectorStoreError("engine lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, CollectionState>>> {
        self.collections
            .write()
            .map_err(|_| RagError::VectorStoreError("engine lock poisoned".to_string()))
    }
}

/// Similarity of `a` and `b` under `metric` (higher is more similar)
pub fn similarity(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    match metric {
        DistanceMetric::Dot => dot,
        DistanceMetric::Cosine => {
            let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm_a == 0.0 || norm_b == 0.0 {
                0.0
            } else {
                dot / (norm_a * norm_b)
            }
        }
    }
}

fn linear_scan(state: &CollectionState, query: &[f32], limit: usize) -> Vec<(i64, f32)> {
    let mut scored: Vec<(i64, f32)> = state
        .points
        .iter()
        .map(|(id, point)| (*id, similarity(state.config.metric, query, &point.vector)))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    scored
}

fn check_vector(config: &CollectionConfig, vector: &[f32]) -> Result<()> {
    if vector.len() != config.vector_width {
        return Err(RagError::ValidationError(format!(
            "vector width {} does not match collection {} width {}",
            vector.len(),
            config.name,
            config.vector_width
        )));
    }
    if vector.iter().any(|x| !x.is_finite()) {
        return Err(RagError::VectorStoreError(format!(
            "collection {} rejects non-finite vector components",
            config.name
        )));
    }
    Ok(())
}

fn load_collection(dir: &Path, index_threshold: usize) -> Result<CollectionState> {
    let raw = fs::read(dir.join(CONFIG_FILE)).map_err(|e| io_error("read config", dir, e))?;
    let config: CollectionConfig = serde_json::from_slice(&raw)
        .map_err(|e| RagError::VectorStoreError(format!("Corrupt config in {}: {e}", dir.display())))?;

    let log_path = dir.join(LOG_FILE);
    let (points, log_len) = replay_log(&log_path)?;

    let mut state = CollectionState {
        config,
        dir: dir.to_path_buf(),
        points,
        index: None,
        index_builds: 0,
        log_len,
    };
    state.maybe_build_index(index_threshold);
    Ok(state)
}

/// Replay a log, returning the live points and the length of its valid prefix.
///
/// A torn final line is cut off the file.
fn replay_log(path: &Path) -> Result<(BTreeMap<i64, StoredPoint>, u64)> {
    let mut points = BTreeMap::new();
    if !path.is_file() {
        return Ok((points, 0));
    }

    let file = File::open(path).map_err(|e| io_error("open log", path, e))?;
    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    let mut offset = 0u64;
    let mut valid_len = 0u64;
    let mut torn: Option<String> = None;

    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .map_err(|e| io_error("read log", path, e))?;
        if read == 0 {
            break;
        }
        if let Some(err) = torn.take() {
            return Err(RagError::VectorStoreError(format!(
                "Corrupt log {} at byte {valid_len}: {err}",
                path.display()
            )));
        }
        offset += read as u64;

        if line.iter().all(u8::is_ascii_whitespace) {
            valid_len = offset;
            continue;
        }
        match serde_json::from_slice::<LogEntry>(&line) {
            Ok(LogEntry::Upsert { id, point }) => {
                points.insert(id, point);
                valid_len = offset;
            }
            Ok(LogEntry::Delete { id }) => {
                points.remove(&id);
                valid_len = offset;
            }
            Err(e) => torn = Some(e.to_string()),
        }
    }

    if let Some(err) = torn {
        tracing::warn!(
            path = %path.display(),
            valid_len,
            "Dropping torn log tail: {err}"
        );
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| io_error("open log", path, e))?;
        file.set_len(valid_len)
            .and_then(|()| file.sync_data())
            .map_err(|e| io_error("truncate log", path, e))?;
    }

    Ok((points, valid_len))
}

/// Append `entries` at `log_len`, returning the new committed length.
///
/// Anything past `log_len` is left over from a failed append and is
/// overwritten. A failed write is rolled back to `log_len`.
fn append_entries(path: &Path, log_len: u64, entries: &[LogEntry]) -> Result<u64> {
    let mut buf = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut buf, entry)
            .map_err(|e| RagError::VectorStoreError(format!("Failed to encode point: {e}")))?;
        buf.push(b'\n');
    }

    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| io_error("open log", path, e))?;
    file.set_len(log_len)
        .and_then(|()| file.seek(SeekFrom::Start(log_len)))
        .map_err(|e| io_error("rewind log", path, e))?;

    if let Err(e) = file.write_all(&buf).and_then(|()| file.sync_data()) {
        // If this fails too, the next append truncates again
        if let Err(rollback) = file.set_len(log_len) {
            tracing::warn!(path = %path.display(), "Log rollback failed: {rollback}");
        }
        return Err(io_error("append log", path, e));
    }

    Ok(log_len + buf.len() as u64)
}

fn write_synced(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = File::create(path).map_err(|e| io_error("create", path, e))?;
    file.write_all(contents).map_err(|e| io_error("write", path, e))?;
    file.sync_all().map_err(|e| io_error("sync", path, e))?;
    Ok(())
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> RagError {
    RagError::VectorStoreError(format!("Failed to {action} {}: {err}", path.display()))
}
