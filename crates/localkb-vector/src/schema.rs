use arrow_schema::{DataType, Field, Schema, TimeUnit};
use std::sync::Arc;

pub const CHUNKS_TABLE: &str = "chunks";
pub const VECTORS_TABLE: &str = "vectors";

/// Chunk text and metadata. Rows are append-only and keyed by `seq`, which also
/// records insertion order; `id` is the chunk's logical identity.
pub fn build_chunks_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("seq", DataType::UInt64, false),
        Field::new("source_id", DataType::Utf8, false),
        Field::new("text", DataType::Utf8, false),
        Field::new("start_offset", DataType::UInt64, false),
        Field::new("end_offset", DataType::UInt64, false),
        Field::new("content_hash", DataType::Utf8, false),
        Field::new("added_at", DataType::Timestamp(TimeUnit::Millisecond, None), false),
        Field::new("metadata", DataType::Utf8, false),
    ]))
}

/// Embeddings, one per chunk row and sharing its `seq`. The list width is the
/// collection's dimensionality.
pub fn build_vectors_schema(dim: i32) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("seq", DataType::UInt64, false),
        Field::new("id", DataType::Utf8, false),
        Field::new("vector", DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim), true),
    ]))
}
