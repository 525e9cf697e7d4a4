//! `index.json`: the commit record of a collection.
//!
//! Table rows are only ever appended, so the tables may hold rows of writes
//! that never committed and rows that later writes superseded. The index says
//! which are live: rows with `seq >= next_seq` are uncommitted, rows of a
//! source older than that source's `since` were replaced, and rows of sources
//! it does not list were deleted. It also names the current data directory.
//! Replacing the file (temp file in the same directory, then rename) is the
//! commit point of every write.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

pub const INDEX_FILE: &str = "index.json";
pub const FORMAT_VERSION: u32 = 1;
pub const DEFAULT_DATA_DIR: &str = "data";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub chunks: usize,
    pub content_hash: String,
    /// First `seq` of the write that last replaced this source.
    pub since: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionIndex {
    pub format_version: u32,
    pub name: String,
    pub data_dir: String,
    pub dimension: Option<usize>,
    pub chunk_count: usize,
    pub next_seq: u64,
    pub sources: BTreeMap<String, SourceSummary>,
    pub updated_at: DateTime<Utc>,
}

impl CollectionIndex {
    pub fn empty(name: &str) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            name: name.to_string(),
            data_dir: DEFAULT_DATA_DIR.to_string(),
            dimension: None,
            chunk_count: 0,
            next_seq: 0,
            sources: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Reads `<dir>/index.json`. `Ok(None)` when the file does not exist.
pub fn read(dir: &Path) -> Result<Option<CollectionIndex>> {
    let path = dir.join(INDEX_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)?;
    let index: CollectionIndex = serde_json::from_str(&raw)?;
    anyhow::ensure!(
        index.format_version == FORMAT_VERSION,
        "unsupported index format version {}",
        index.format_version
    );
    Ok(Some(index))
}

pub fn write_atomic(dir: &Path, index: &CollectionIndex) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(tmp.as_file_mut(), index)?;
    tmp.as_file_mut().write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(INDEX_FILE))?;
    Ok(())
}
