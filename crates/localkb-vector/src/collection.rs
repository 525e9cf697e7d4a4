//! A single collection: the LanceDB tables on disk plus an in-memory mirror
//! that queries scan without touching storage.
//!
//! Table rows are append-only. A write appends its vector and chunk rows, then
//! replaces `index.json`, which is the commit point; rows it superseded are
//! deleted afterwards. A write that leaves the collection holding only its own
//! rows (or nothing) goes to a fresh data directory instead, and the index
//! switches to it. A crash at any step leaves the previous commit readable.
//! Anything the index and the tables disagree on beyond that is corruption.

use chrono::Utc;
use indexmap::IndexMap;
use lancedb::Connection;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Display;
use std::path::{Path, PathBuf};

use localkb_core::error::{IngestionError, StoreError};
use localkb_core::types::{Chunk, ChunkId, CollectionStats, Embedding};

use crate::index_file::{self, CollectionIndex, SourceSummary, DEFAULT_DATA_DIR, FORMAT_VERSION};
use crate::schema::{CHUNKS_TABLE, VECTORS_TABLE};
use crate::table;

pub(crate) const TRASH_PREFIX: &str = ".trash-";

#[derive(Debug, Clone)]
struct Record {
    seq: u64,
    chunk: Chunk,
    vector: Embedding,
}

#[derive(Debug, Clone)]
struct SourceEntry {
    content_hash: String,
    since: u64,
    ids: Vec<ChunkId>,
}

/// Outcome of a write. Rejected chunks are reported individually; the rest are
/// committed. `removed` counts the chunks a replaced source had before the write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertReport {
    pub inserted: usize,
    pub removed: usize,
    pub rejected: Vec<IngestionError>,
}

pub struct CollectionState {
    name: String,
    dir: PathBuf,
    data_dir: String,
    db: Connection,
    dimension: Option<usize>,
    records: IndexMap<ChunkId, Record>,
    sources: BTreeMap<String, SourceEntry>,
    next_seq: u64,
    dropped: bool,
    failed: Option<String>,
}

fn corruption(name: &str, detail: impl Display) -> StoreError {
    StoreError::Corruption { collection: name.to_string(), detail: detail.to_string() }
}

fn write_failed(name: &str, detail: impl Display) -> StoreError {
    StoreError::WriteFailed { collection: name.to_string(), detail: detail.to_string() }
}

fn invalid_vector(v: &[f32]) -> Option<String> {
    if v.is_empty() {
        Some("empty vector".to_string())
    } else if v.iter().any(|x| !x.is_finite()) {
        Some("vector contains NaN or infinite components".to_string())
    } else {
        None
    }
}

fn stamped(prefix: &str, stem: &str) -> String {
    format!("{prefix}{stem}-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
}

pub(crate) fn trash_name(stem: &str) -> String {
    stamped(TRASH_PREFIX, stem)
}

fn remove_dir_logged(path: &Path, what: &str) {
    if let Err(e) = std::fs::remove_dir_all(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove {what}");
    }
}

/// Removes leftovers of interrupted clears and drops under `dir`.
pub(crate) fn sweep_trash(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with(TRASH_PREFIX) {
            remove_dir_logged(&entry.path(), "trash directory");
        }
    }
}

/// Names of the data directories under a collection directory.
fn generations(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let prefix = format!("{DEFAULT_DATA_DIR}-");
    entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| name.as_str() == DEFAULT_DATA_DIR || name.starts_with(&prefix))
        .collect()
}

/// Removes data directories the index does not point at: generations of
/// writes that never committed, or ones a later commit replaced.
fn sweep_stale_generations(dir: &Path, current: &str) {
    for name in generations(dir).into_iter().filter(|name| name.as_str() != current) {
        let path = dir.join(&name);
        tracing::debug!(path = %path.display(), "removing stale data directory");
        remove_dir_logged(&path, "stale data directory");
    }
}

impl CollectionState {
    pub(crate) async fn create(name: &str, dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir).map_err(|e| write_failed(name, e))?;
        let db = table::open_db(&dir.join(DEFAULT_DATA_DIR))
            .await
            .map_err(|e| write_failed(name, format!("{e:#}")))?;
        let state = Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            data_dir: DEFAULT_DATA_DIR.to_string(),
            db,
            dimension: None,
            records: IndexMap::new(),
            sources: BTreeMap::new(),
            next_seq: 0,
            dropped: false,
            failed: None,
        };
        state.write_index().map_err(|e| write_failed(name, format!("{e:#}")))?;
        tracing::info!(collection = name, "created collection");
        Ok(state)
    }

    /// Rebuilds the mirror from the committed rows. Rows of uncommitted or
    /// superseded writes are discarded; committed rows that are missing are
    /// reported as corruption rather than silently repaired.
    pub(crate) async fn load(name: &str, dir: &Path) -> Result<Self, StoreError> {
        sweep_trash(dir);
        let stored = index_file::read(dir).map_err(|e| corruption(name, format!("index.json unreadable: {e:#}")))?;
        let has_index = stored.is_some();
        let index = stored.unwrap_or_else(|| CollectionIndex::empty(name));
        if has_index {
            sweep_stale_generations(dir, &index.data_dir);
        } else if let Some(generation) = generations(dir).into_iter().find(|g| g.as_str() != DEFAULT_DATA_DIR) {
            return Err(corruption(name, format!("index.json is missing but data directory '{generation}' exists")));
        }

        let data = dir.join(&index.data_dir);
        if !data.is_dir() && index.chunk_count > 0 {
            return Err(corruption(
                name,
                format!(
                    "data directory '{}' is missing but the index records {} chunks",
                    index.data_dir, index.chunk_count
                ),
            ));
        }
        let db = table::open_db(&data)
            .await
            .map_err(|e| corruption(name, format!("cannot open tables: {e:#}")))?;
        let mut rows = table::read_chunks(&db)
            .await
            .map_err(|e| corruption(name, format!("chunks table unreadable: {e:#}")))?;
        let (width, mut vectors) = table::read_vectors(&db)
            .await
            .map_err(|e| corruption(name, format!("vectors table unreadable: {e:#}")))?;
        if !has_index && !rows.is_empty() {
            let detail = format!("index.json is missing but the tables hold {} chunk rows", rows.len());
            return Err(corruption(name, detail));
        }
        rows.sort_by_key(|(seq, _)| *seq);

        let mut seen = HashSet::with_capacity(rows.len());
        let mut garbage: Vec<u64> = Vec::new();
        let mut live: IndexMap<ChunkId, (u64, Chunk)> = IndexMap::with_capacity(rows.len());
        for (seq, chunk) in rows {
            if !seen.insert(seq) {
                return Err(corruption(name, format!("sequence number {seq} stored twice")));
            }
            let committed = seq < index.next_seq
                && index.sources.get(&chunk.source_id).is_some_and(|s| seq >= s.since);
            if !committed {
                garbage.push(seq);
                continue;
            }
            if let Some((older, _)) = live.shift_remove(&chunk.chunk_id) {
                garbage.push(older);
            }
            live.insert(chunk.chunk_id.clone(), (seq, chunk));
        }

        if let (Some(recorded), Some(stored)) = (index.dimension, width) {
            if !live.is_empty() && recorded != stored {
                let detail = format!("index records dimension {recorded} but vectors are {stored}-dimensional");
                return Err(corruption(name, detail));
            }
        }

        let mut state = Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            data_dir: index.data_dir.clone(),
            db,
            dimension: None,
            records: IndexMap::with_capacity(live.len()),
            sources: BTreeMap::new(),
            next_seq: index.next_seq,
            dropped: false,
            failed: None,
        };
        for (chunk_id, (seq, chunk)) in live {
            let row = vectors
                .remove(&seq)
                .filter(|row| row.chunk_id == chunk_id)
                .ok_or_else(|| corruption(name, format!("chunk {chunk_id} has no stored vector")))?;
            state.dimension.get_or_insert(row.vector.len());
            let since = index.sources.get(&chunk.source_id).map_or(seq, |s| s.since);
            state.insert_record(Record { seq, chunk, vector: row.vector }, since);
        }

        for (source_id, summary) in &index.sources {
            let held = state.sources.get(source_id).map_or(0, |e| e.ids.len());
            if held != summary.chunks {
                return Err(corruption(
                    name,
                    format!("index records {} chunks for '{source_id}' but the tables hold {held}", summary.chunks),
                ));
            }
        }

        if state.records.len() != index.chunk_count {
            return Err(corruption(
                name,
                format!("index records {} chunks but the tables hold {}", index.chunk_count, state.records.len()),
            ));
        }

        garbage.extend(vectors.into_keys());
        if !garbage.is_empty() {
            tracing::warn!(
                collection = name,
                rows = garbage.len(),
                "discarding rows of uncommitted or superseded writes"
            );
            // later writes reuse the sequence numbers of uncommitted rows
            state
                .delete_rows(&garbage)
                .await
                .map_err(|e| write_failed(name, format!("discarding dead rows: {e:#}")))?;
        }
        if !has_index {
            if let Err(e) = state.write_index() {
                tracing::warn!(collection = name, error = %e, "failed to write index.json");
            }
        }
        tracing::debug!(
            collection = name,
            chunks = state.records.len(),
            sources = state.sources.len(),
            "loaded collection"
        );
        Ok(state)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn is_dropped(&self) -> bool {
        self.dropped
    }

    /// Fails when the collection was dropped or a failed write left it unreadable.
    pub fn ensure_usable(&self) -> Result<(), StoreError> {
        if self.dropped {
            return Err(StoreError::NotFound(self.name.clone()));
        }
        if let Some(detail) = &self.failed {
            return Err(corruption(&self.name, detail));
        }
        Ok(())
    }

    /// Every chunk with its vector, in insertion order.
    pub fn scan(&self) -> impl Iterator<Item = (&Chunk, &[f32])> + '_ {
        self.records.values().map(|r| (&r.chunk, r.vector.as_slice()))
    }

    pub fn get(&self, chunk_id: &str) -> Option<(&Chunk, &[f32])> {
        self.records.get(chunk_id).map(|r| (&r.chunk, r.vector.as_slice()))
    }

    /// Content hash of the document currently stored under `source_id`.
    pub fn source_hash(&self, source_id: &str) -> Option<&str> {
        self.sources.get(source_id).map(|e| e.content_hash.as_str())
    }

    /// The chunks stored under `source_id`, in insertion order.
    pub fn source_chunks<'a>(&'a self, source_id: &str) -> impl Iterator<Item = &'a Chunk> + 'a {
        self.sources
            .get(source_id)
            .into_iter()
            .flat_map(|e| e.ids.iter())
            .filter_map(|id| self.records.get(id).map(|r| &r.chunk))
    }

    pub fn stats(&self) -> CollectionStats {
        CollectionStats {
            name: self.name.clone(),
            document_count: self.sources.len(),
            chunk_count: self.records.len(),
            dimension: self.dimension,
            sources: self.sources.keys().cloned().collect(),
        }
    }

    /// Inserts or overwrites chunks by id.
    pub async fn upsert(&mut self, chunks: Vec<Chunk>, vectors: Vec<Embedding>) -> Result<UpsertReport, StoreError> {
        self.commit(None, chunks, vectors).await
    }

    /// Deletes every chunk of `source_id`, then inserts `chunks`. When every
    /// incoming chunk is rejected the stored chunks are left untouched.
    pub async fn replace_source(
        &mut self,
        source_id: &str,
        chunks: Vec<Chunk>,
        vectors: Vec<Embedding>,
    ) -> Result<UpsertReport, StoreError> {
        self.commit(Some(source_id), chunks, vectors).await
    }

    /// Returns the number of chunks removed; zero for an unknown source.
    pub async fn delete_by_source(&mut self, source_id: &str) -> Result<usize, StoreError> {
        Ok(self.commit(Some(source_id), Vec::new(), Vec::new()).await?.removed)
    }

    /// Removes every chunk; the next write establishes a new dimensionality.
    pub async fn clear(&mut self) -> Result<usize, StoreError> {
        if self.dropped {
            return Err(StoreError::NotFound(self.name.clone()));
        }
        let removed = self.records.len();
        let (generation, db) = match self.open_generation().await {
            Ok(g) => g,
            Err(e) => return Err(self.recover(e).await),
        };
        self.records.clear();
        self.sources.clear();
        self.dimension = None;
        let previous = std::mem::replace(&mut self.data_dir, generation);
        if let Err(e) = self.write_index() {
            return Err(self.recover(e).await);
        }
        self.failed = None;
        self.retire_generation(&previous, db);
        tracing::info!(collection = %self.name, removed, "cleared collection");
        Ok(removed)
    }

    pub(crate) fn mark_dropped(&mut self) {
        self.dropped = true;
        self.records.clear();
        self.sources.clear();
        self.dimension = None;
    }

    async fn commit(
        &mut self,
        replace: Option<&str>,
        chunks: Vec<Chunk>,
        vectors: Vec<Embedding>,
    ) -> Result<UpsertReport, StoreError> {
        self.ensure_usable()?;
        if chunks.len() != vectors.len() {
            return Err(write_failed(&self.name, format!("{} chunks but {} embeddings", chunks.len(), vectors.len())));
        }

        let replaced: Vec<ChunkId> =
            replace.and_then(|s| self.sources.get(s)).map(|e| e.ids.clone()).unwrap_or_default();
        let survivors = self.records.len() - replaced.len();
        let mut dimension = if survivors > 0 { self.dimension } else { None };

        let mut report = UpsertReport::default();
        let mut accepted: IndexMap<ChunkId, (Chunk, Embedding)> = IndexMap::new();
        for (chunk, vector) in chunks.into_iter().zip(vectors) {
            if let Some(reason) = invalid_vector(&vector) {
                report.rejected.push(IngestionError::InvalidEmbedding { chunk_id: chunk.chunk_id, reason });
                continue;
            }
            let expected = *dimension.get_or_insert(vector.len());
            if vector.len() != expected {
                report.rejected.push(IngestionError::DimensionMismatch {
                    chunk_id: chunk.chunk_id,
                    expected,
                    actual: vector.len(),
                });
                continue;
            }
            accepted.shift_remove(&chunk.chunk_id);
            accepted.insert(chunk.chunk_id.clone(), (chunk, vector));
        }
        for rejected in &report.rejected {
            tracing::warn!(collection = %self.name, error = %rejected, "rejected chunk");
        }
        if accepted.is_empty() && (replaced.is_empty() || !report.rejected.is_empty()) {
            return Ok(report);
        }

        let replaced_set: HashSet<&str> = replaced.iter().map(String::as_str).collect();
        let overwritten: Vec<ChunkId> = accepted
            .keys()
            .filter(|id| self.records.contains_key(*id) && !replaced_set.contains(id.as_str()))
            .cloned()
            .collect();
        let removed = replaced.len();
        let stale: HashSet<ChunkId> = replaced.into_iter().chain(overwritten).collect();
        let stale_seqs: Vec<u64> = stale.iter().filter_map(|id| self.records.get(id)).map(|r| r.seq).collect();

        // a write that keeps no earlier chunk starts a new generation, which also
        // lets it establish a new dimensionality
        let first_seq = self.next_seq;
        let generation = if survivors == 0 {
            match self.open_generation().await {
                Ok(g) => Some(g),
                Err(e) => return Err(self.recover(e).await),
            }
        } else {
            None
        };
        let target = generation.as_ref().map_or(&self.db, |(_, db)| db);
        let appended = append_rows(target, &accepted, first_seq).await;
        if let Err(e) = appended {
            return Err(self.recover(e).await);
        }

        self.remove_records(&stale);
        report.inserted = accepted.len();
        report.removed = removed;
        for (i, (_, (chunk, vector))) in accepted.into_iter().enumerate() {
            let seq = first_seq + i as u64;
            self.insert_record(Record { seq, chunk, vector }, seq);
        }
        self.next_seq = first_seq + report.inserted as u64;
        self.dimension = if self.records.is_empty() { None } else { dimension };
        let previous = generation.as_ref().map(|(dir, _)| std::mem::replace(&mut self.data_dir, dir.clone()));
        if let Err(e) = self.write_index() {
            return Err(self.recover(e).await);
        }

        match (previous, generation) {
            (Some(previous), Some((_, db))) => self.retire_generation(&previous, db),
            _ => {
                // superseded rows are already dead to the index
                if let Err(e) = self.delete_rows(&stale_seqs).await {
                    tracing::warn!(collection = %self.name, error = %e, "failed to delete superseded rows");
                }
            }
        }
        tracing::debug!(
            collection = %self.name,
            inserted = report.inserted,
            removed = report.removed,
            rejected = report.rejected.len(),
            "committed write"
        );
        Ok(report)
    }

    async fn open_generation(&self) -> anyhow::Result<(String, Connection)> {
        let name = stamped("", DEFAULT_DATA_DIR);
        let db = table::open_db(&self.dir.join(&name)).await?;
        Ok((name, db))
    }

    /// Switches to the committed generation's connection and removes the old directory.
    fn retire_generation(&mut self, previous: &str, db: Connection) {
        self.db = db;
        if previous != self.data_dir {
            let path = self.dir.join(previous);
            if path.exists() {
                remove_dir_logged(&path, "old data directory");
            }
        }
    }

    async fn delete_rows(&self, seqs: &[u64]) -> anyhow::Result<()> {
        table::delete_seqs(&self.db, CHUNKS_TABLE, seqs).await?;
        table::delete_seqs(&self.db, VECTORS_TABLE, seqs).await
    }

    /// Resynchronises the mirror with the last commit after a failed write.
    async fn recover(&mut self, err: anyhow::Error) -> StoreError {
        let detail = format!("{err:#}");
        tracing::error!(collection = %self.name, error = %detail, "write failed, reloading collection");
        let (name, dir) = (self.name.clone(), self.dir.clone());
        match Self::load(&name, &dir).await {
            Ok(fresh) => *self = fresh,
            Err(e) => self.failed = Some(e.to_string()),
        }
        write_failed(&self.name, detail)
    }

    /// `since` is only used when the record starts a new source entry.
    fn insert_record(&mut self, record: Record, since: u64) {
        let id = record.chunk.chunk_id.clone();
        let entry = self
            .sources
            .entry(record.chunk.source_id.clone())
            .or_insert_with(|| SourceEntry { content_hash: String::new(), since, ids: Vec::new() });
        entry.content_hash.clone_from(&record.chunk.content_hash);
        entry.ids.push(id.clone());
        self.records.insert(id, record);
    }

    fn remove_records(&mut self, ids: &HashSet<ChunkId>) {
        if ids.is_empty() {
            return;
        }
        self.records.retain(|id, _| !ids.contains(id));
        self.sources.retain(|_, entry| {
            entry.ids.retain(|id| !ids.contains(id));
            !entry.ids.is_empty()
        });
    }

    fn index_snapshot(&self) -> CollectionIndex {
        CollectionIndex {
            format_version: FORMAT_VERSION,
            name: self.name.clone(),
            data_dir: self.data_dir.clone(),
            dimension: self.dimension,
            chunk_count: self.records.len(),
            next_seq: self.next_seq,
            sources: self
                .sources
                .iter()
                .map(|(k, e)| {
                    let summary =
                        SourceSummary { chunks: e.ids.len(), content_hash: e.content_hash.clone(), since: e.since };
                    (k.clone(), summary)
                })
                .collect(),
            updated_at: Utc::now(),
        }
    }

    fn write_index(&self) -> anyhow::Result<()> {
        index_file::write_atomic(&self.dir, &self.index_snapshot())
    }
}

/// Appends vector rows, then chunk rows, numbered from `first_seq`.
async fn append_rows(
    db: &Connection,
    accepted: &IndexMap<ChunkId, (Chunk, Embedding)>,
    first_seq: u64,
) -> anyhow::Result<()> {
    let Some((_, (_, first))) = accepted.first() else {
        return Ok(());
    };
    let vector_rows: Vec<(u64, &str, &[f32])> = accepted
        .iter()
        .enumerate()
        .map(|(i, (id, (_, v)))| (first_seq + i as u64, id.as_str(), v.as_slice()))
        .collect();
    table::append_batch(db, VECTORS_TABLE, table::vectors_to_batch(&vector_rows, first.len())?).await?;
    let chunk_rows: Vec<(u64, &Chunk)> =
        accepted.values().enumerate().map(|(i, (c, _))| (first_seq + i as u64, c)).collect();
    table::append_batch(db, CHUNKS_TABLE, table::chunks_to_batch(&chunk_rows)?).await?;
    Ok(())
}
