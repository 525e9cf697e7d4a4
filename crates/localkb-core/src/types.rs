//! Domain types shared by the chunker, the vector store and the retrieval engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

pub type ChunkId = String;
pub type Meta = HashMap<String, String>;
pub type Embedding = Vec<f32>;

/// A logical source unit handed to ingestion.
///
/// - `source_id`: stable identity (file path, URL, `youtube:<id>`)
/// - `content_hash`: blake3 hex digest of `content`, used to skip unchanged re-ingestion
/// - `metadata`: copied onto every chunk derived from this document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub source_id: String,
    pub content: String,
    pub content_hash: String,
    pub added_at: DateTime<Utc>,
    pub metadata: Meta,
}

impl Document {
    pub fn new(source_id: impl Into<String>, content: impl Into<String>, metadata: Meta) -> Self {
        let content = content.into();
        Self {
            source_id: source_id.into(),
            content_hash: content_hash(&content),
            content,
            added_at: Utc::now(),
            metadata,
        }
    }
}

pub fn content_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Deterministic chunk identity: the same source and offset always map to the same id.
pub fn chunk_id(source_id: &str, start_offset: usize) -> ChunkId {
    format!("{source_id}#{start_offset}")
}

/// A contiguous slice of a document. Offsets count characters, `end_offset` is exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub source_id: String,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub content_hash: String,
    pub added_at: DateTime<Utc>,
    pub metadata: Meta,
}

/// A chunk returned by a query. `score` is the cosine similarity to the query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub name: String,
    pub document_count: usize,
    pub chunk_count: usize,
    pub dimension: Option<usize>,
    pub sources: BTreeSet<String>,
}
