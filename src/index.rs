//! # Vector index
//!
//! Durable storage of chunk embeddings with exact nearest-neighbour search.
//!
//! Entries are kept in insertion order and every query scores all of them, so results are
//! exact and ties resolve to the entry added first. Re-adding a `chunk_id` replaces that entry
//! in place; it keeps its original position.
//!
//! ## On-disk layout
//!
//! An index directory holds two files:
//!
//! - `manifest.yaml`: format version, dimension, metric, entry count, BLAKE3 checksum of the
//!   entries file, and the time of the last write.
//! - `entries.bin`: the ordered entry list, bincode-encoded.
//!
//! Both are written to temporary files and renamed into place. [`VectorIndex::load`] verifies
//! everything the manifest claims before handing out an index; anything that does not add up
//! is reported as [`RagError::IndexCorrupted`] rather than partially loaded.
//!
//! ## Concurrency
//!
//! State lives behind a [`RwLock`]: `add` and `clear` take the write lock, `query`, `stats` and
//! `persist` take the read lock. A reader never sees a half-applied batch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    fmt, fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tempfile::NamedTempFile;
use tracing::*;

use crate::chunker::Chunk;
use crate::error::{RagError, Result};

const MANIFEST_FILE: &str = "manifest.yaml";
const ENTRIES_FILE: &str = "entries.bin";
const FORMAT_VERSION: u32 = 1;

/// How query vectors are compared with stored ones. Higher scores are always closer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Similarity {
    /// Cosine of the angle between the vectors, in `[-1, 1]`. Zero-length vectors score 0.
    #[default]
    Cosine,
    /// `1 / (1 + d)` for Euclidean distance `d`, in `(0, 1]`.
    Euclidean,
}

impl Similarity {
    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Similarity::Cosine => cosine_similarity(a, b),
            Similarity::Euclidean => 1.0 / (1.0 + euclidean_distance(a, b)),
        }
    }
}

impl fmt::Display for Similarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Similarity::Cosine => f.write_str("cosine"),
            Similarity::Euclidean => f.write_str("euclidean"),
        }
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// A stored chunk and its embedding.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

/// A chunk returned by a query, with its similarity to the query vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Whether [`VectorIndex::add`] created a new entry or overwrote one with the same `chunk_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
}

/// Summary of what an index holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub entries: usize,
    /// Distinct document ids, sorted.
    pub documents: Vec<String>,
    pub dimension: usize,
    pub similarity: Similarity,
}

#[derive(Serialize, Deserialize, Debug)]
struct Manifest {
    format_version: u32,
    dimension: usize,
    similarity: Similarity,
    entries: usize,
    checksum: String,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct IndexState {
    entries: Vec<IndexEntry>,
    positions: HashMap<String, usize>,
}

impl IndexState {
    fn upsert(&mut self, entry: IndexEntry) -> Upsert {
        match self.positions.get(&entry.chunk.chunk_id) {
            Some(&pos) => {
                self.entries[pos] = entry;
                Upsert::Replaced
            }
            None => {
                self.positions
                    .insert(entry.chunk.chunk_id.clone(), self.entries.len());
                self.entries.push(entry);
                Upsert::Inserted
            }
        }
    }
}

/// Exact nearest-neighbour index over chunk embeddings of one fixed dimension.
pub struct VectorIndex {
    dimension: usize,
    similarity: Similarity,
    path: Option<PathBuf>,
    state: RwLock<IndexState>,
}

impl fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VectorIndex")
            .field("dimension", &self.dimension)
            .field("similarity", &self.similarity)
            .field("path", &self.path)
            .field("entries", &self.len())
            .finish()
    }
}

impl VectorIndex {
    /// An empty index that lives only in memory. [`persist`](Self::persist) fails on it.
    pub fn new(dimension: usize, similarity: Similarity) -> Self {
        Self {
            dimension,
            similarity,
            path: None,
            state: RwLock::new(IndexState::default()),
        }
    }

    /// Open the index stored in directory `path`.
    ///
    /// A directory without a store (or no directory at all) yields an empty index bound to
    /// `path`.
    ///
    /// # Errors
    /// - [`RagError::IndexCorrupted`] if the store is present but cannot be trusted.
    /// - [`RagError::DimensionMismatch`] if the store was built with another dimension.
    pub fn load(path: impl AsRef<Path>, dimension: usize, similarity: Similarity) -> Result<Self> {
        let path = path.as_ref();
        let manifest_path = path.join(MANIFEST_FILE);
        let entries_path = path.join(ENTRIES_FILE);

        let mut index = Self::new(dimension, similarity);
        index.path = Some(path.to_path_buf());

        if !manifest_path.exists() {
            if entries_path.exists() {
                return Err(RagError::IndexCorrupted(format!(
                    "{} exists without {MANIFEST_FILE}",
                    entries_path.display()
                )));
            }
            info!("No index at {}, starting empty", path.display());
            return Ok(index);
        }

        let manifest: Manifest = serde_yaml::from_str(&fs::read_to_string(&manifest_path)?)
            .map_err(|e| RagError::IndexCorrupted(format!("unreadable manifest: {e}")))?;

        if manifest.format_version != FORMAT_VERSION {
            return Err(RagError::IndexCorrupted(format!(
                "unknown format version {}",
                manifest.format_version
            )));
        }
        if manifest.dimension != dimension {
            return Err(RagError::DimensionMismatch {
                expected: dimension,
                actual: manifest.dimension,
            });
        }
        if manifest.similarity != similarity {
            warn!(
                "Index at {} was written with {} similarity, querying with {}",
                path.display(),
                manifest.similarity,
                similarity
            );
        }

        let bytes = fs::read(&entries_path).map_err(|e| {
            RagError::IndexCorrupted(format!("cannot read {}: {e}", entries_path.display()))
        })?;
        let checksum = blake3::hash(&bytes).to_hex().to_string();
        if checksum != manifest.checksum {
            return Err(RagError::IndexCorrupted("checksum mismatch".into()));
        }

        let (entries, _): (Vec<IndexEntry>, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| RagError::IndexCorrupted(format!("undecodable entries: {e}")))?;

        if entries.len() != manifest.entries {
            return Err(RagError::IndexCorrupted(format!(
                "manifest lists {} entries, found {}",
                manifest.entries,
                entries.len()
            )));
        }

        let mut state = IndexState::default();
        for entry in entries {
            if entry.embedding.len() != dimension {
                return Err(RagError::IndexCorrupted(format!(
                    "entry {} has {} values, expected {dimension}",
                    entry.chunk.chunk_id,
                    entry.embedding.len()
                )));
            }
            if state.upsert(entry) == Upsert::Replaced {
                return Err(RagError::IndexCorrupted("duplicate chunk ids".into()));
            }
        }

        info!(
            "Loaded {} entries from {} (last written {})",
            state.entries.len(),
            path.display(),
            manifest.updated_at
        );
        index.state = RwLock::new(state);
        Ok(index)
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn similarity(&self) -> Similarity {
        self.similarity
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.read().positions.contains_key(chunk_id)
    }

    pub fn get(&self, chunk_id: &str) -> Option<Chunk> {
        let state = self.read();
        state
            .positions
            .get(chunk_id)
            .map(|&pos| state.entries[pos].chunk.clone())
    }

    /// Insert `chunk`, or replace the entry that has its `chunk_id`.
    ///
    /// A vector of the wrong length is rejected and the index is left as it was.
    pub fn add(&self, chunk: Chunk, embedding: Vec<f32>) -> Result<Upsert> {
        self.check_dimension(&embedding)?;
        let chunk_id = chunk.chunk_id.clone();
        let outcome = self.write().upsert(IndexEntry { chunk, embedding });
        debug!("{outcome:?} {chunk_id}");
        Ok(outcome)
    }

    /// Add a batch under a single write lock. Returns how many entries were replaced.
    ///
    /// Every vector is checked before anything is written, so a mismatch rejects the whole
    /// batch.
    pub fn add_many(&self, items: Vec<(Chunk, Vec<f32>)>) -> Result<usize> {
        for (_, embedding) in &items {
            self.check_dimension(embedding)?;
        }

        let mut state = self.write();
        let replaced = items
            .into_iter()
            .map(|(chunk, embedding)| state.upsert(IndexEntry { chunk, embedding }))
            .filter(|outcome| *outcome == Upsert::Replaced)
            .count();
        debug!(
            "Index holds {} entries ({replaced} replaced)",
            state.entries.len()
        );
        Ok(replaced)
    }

    /// The `k` entries most similar to `query`, best first.
    ///
    /// Returns everything when the index holds fewer than `k` entries and nothing when it is
    /// empty.
    pub fn query(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        self.check_dimension(query)?;
        let state = self.read();
        if k == 0 || state.entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, f32)> = state
            .entries
            .iter()
            .enumerate()
            .map(|(pos, entry)| (pos, self.similarity.score(query, &entry.embedding)))
            .collect();

        // stable: equal scores stay in insertion order
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(pos, score)| ScoredChunk {
                chunk: state.entries[pos].chunk.clone(),
                score,
            })
            .collect())
    }

    /// Remove every entry. The store on disk changes on the next [`persist`](Self::persist).
    pub fn clear(&self) {
        let mut state = self.write();
        let removed = state.entries.len();
        *state = IndexState::default();
        info!("Cleared {removed} index entries");
    }

    pub fn stats(&self) -> IndexStats {
        let state = self.read();
        let documents: BTreeSet<&str> = state
            .entries
            .iter()
            .map(|e| e.chunk.document_id.as_str())
            .collect();
        IndexStats {
            entries: state.entries.len(),
            documents: documents.into_iter().map(str::to_string).collect(),
            dimension: self.dimension,
            similarity: self.similarity,
        }
    }

    /// Write the index to the directory it was loaded from.
    pub fn persist(&self) -> Result<()> {
        let path = self.path.as_deref().ok_or_else(|| {
            RagError::Configuration("in-memory index has no storage path".into())
        })?;
        self.persist_to(path)
    }

    /// Write the index to directory `dir`, creating it if needed.
    pub fn persist_to(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let state = self.read();
        let bytes = bincode::serde::encode_to_vec(&state.entries, bincode::config::standard())
            .map_err(|e| std::io::Error::other(format!("encoding index entries: {e}")))?;

        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            dimension: self.dimension,
            similarity: self.similarity,
            entries: state.entries.len(),
            checksum: blake3::hash(&bytes).to_hex().to_string(),
            updated_at: Utc::now(),
        };
        let manifest = serde_yaml::to_string(&manifest)
            .map_err(|e| std::io::Error::other(format!("encoding manifest: {e}")))?;

        write_atomic(dir, ENTRIES_FILE, &bytes)?;
        write_atomic(dir, MANIFEST_FILE, manifest.as_bytes())?;

        info!(
            "Persisted {} entries to {}",
            state.entries.len(),
            dir.display()
        );
        Ok(())
    }
}

fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(name)).map_err(|e| e.error)?;
    Ok(())
}
