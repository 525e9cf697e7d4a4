//! LanceDB helpers: open, append, delete by sequence number, full scans.
//!
//! Tables are created lazily by the first write so that the vectors table can
//! carry the dimensionality of whatever arrives first. Rows are never updated
//! in place; which rows are live is decided by the collection index.

use anyhow::{anyhow, Result};
use arrow_array::cast::AsArray;
use arrow_array::{
    Array, FixedSizeListArray, RecordBatch, RecordBatchIterator, StringArray, TimestampMillisecondArray, UInt64Array,
};
use chrono::{DateTime, TimeZone, Utc};
use lancedb::query::ExecutableQuery;
use lancedb::{connect, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use localkb_core::types::{Chunk, Embedding, Meta};

use crate::schema::{build_chunks_schema, build_vectors_schema, CHUNKS_TABLE, VECTORS_TABLE};

const DELETE_BATCH: usize = 256;

pub async fn open_db(path: &Path) -> Result<Connection> {
    std::fs::create_dir_all(path)?;
    Ok(connect(path.to_string_lossy().as_ref()).execute().await?)
}

pub async fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let names = conn.table_names().execute().await?;
    Ok(names.iter().any(|n| n == name))
}

/// Appends rows, creating the table from the batch's schema on first use.
pub async fn append_batch(conn: &Connection, name: &str, batch: RecordBatch) -> Result<()> {
    if batch.num_rows() == 0 {
        return Ok(());
    }
    let schema = batch.schema();
    let reader = Box::new(RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema));
    if table_exists(conn, name).await? {
        conn.open_table(name).execute().await?.add(reader).execute().await?;
    } else {
        conn.create_table(name, reader).execute().await?;
    }
    Ok(())
}

/// Deletes rows whose `seq` is in `seqs`. Missing tables and rows are not an error.
pub async fn delete_seqs(conn: &Connection, name: &str, seqs: &[u64]) -> Result<()> {
    if seqs.is_empty() || !table_exists(conn, name).await? {
        return Ok(());
    }
    let t = conn.open_table(name).execute().await?;
    for group in seqs.chunks(DELETE_BATCH) {
        let list = group.iter().map(u64::to_string).collect::<Vec<_>>().join(", ");
        t.delete(&format!("seq IN ({list})")).await?;
    }
    Ok(())
}

async fn scan(conn: &Connection, name: &str) -> Result<Vec<RecordBatch>> {
    if !table_exists(conn, name).await? {
        return Ok(Vec::new());
    }
    let t = conn.open_table(name).execute().await?;
    let mut stream = t.query().execute().await?;
    let mut out = Vec::new();
    while let Some(batch) = futures::TryStreamExt::try_next(&mut stream).await? {
        out.push(batch);
    }
    Ok(out)
}

fn string_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| anyhow!("column '{name}' missing or not utf8"))
}

fn u64_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a UInt64Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<UInt64Array>())
        .ok_or_else(|| anyhow!("column '{name}' missing or not uint64"))
}

pub fn chunks_to_batch(rows: &[(u64, &Chunk)]) -> Result<RecordBatch> {
    let mut metadata = Vec::with_capacity(rows.len());
    for (_, c) in rows {
        metadata.push(serde_json::to_string(&c.metadata)?);
    }
    Ok(RecordBatch::try_new(
        build_chunks_schema(),
        vec![
            Arc::new(StringArray::from_iter_values(rows.iter().map(|(_, c)| c.chunk_id.as_str()))),
            Arc::new(UInt64Array::from_iter_values(rows.iter().map(|(seq, _)| *seq))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|(_, c)| c.source_id.as_str()))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|(_, c)| c.text.as_str()))),
            Arc::new(UInt64Array::from_iter_values(rows.iter().map(|(_, c)| c.start_offset as u64))),
            Arc::new(UInt64Array::from_iter_values(rows.iter().map(|(_, c)| c.end_offset as u64))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|(_, c)| c.content_hash.as_str()))),
            Arc::new(TimestampMillisecondArray::from_iter_values(rows.iter().map(|(_, c)| c.added_at.timestamp_millis()))),
            Arc::new(StringArray::from(metadata)),
        ],
    )?)
}

pub fn vectors_to_batch(rows: &[(u64, &str, &[f32])], dim: usize) -> Result<RecordBatch> {
    let dim = i32::try_from(dim).map_err(|_| anyhow!("dimension {dim} too large"))?;
    let vectors = rows.iter().map(|(_, _, v)| Some(v.iter().map(|&x| Some(x)).collect::<Vec<_>>()));
    Ok(RecordBatch::try_new(
        build_vectors_schema(dim),
        vec![
            Arc::new(UInt64Array::from_iter_values(rows.iter().map(|(seq, _, _)| *seq))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|(_, id, _)| *id))),
            Arc::new(FixedSizeListArray::from_iter_primitive::<arrow_array::types::Float32Type, _, _>(vectors, dim)),
        ],
    )?)
}

/// Every stored chunk with its insertion sequence number, in no particular order.
pub async fn read_chunks(conn: &Connection) -> Result<Vec<(u64, Chunk)>> {
    let mut out = Vec::new();
    for batch in scan(conn, CHUNKS_TABLE).await? {
        let ids = string_col(&batch, "id")?;
        let seqs = u64_col(&batch, "seq")?;
        let sources = string_col(&batch, "source_id")?;
        let texts = string_col(&batch, "text")?;
        let starts = u64_col(&batch, "start_offset")?;
        let ends = u64_col(&batch, "end_offset")?;
        let hashes = string_col(&batch, "content_hash")?;
        let metas = string_col(&batch, "metadata")?;
        let added = batch
            .column_by_name("added_at")
            .and_then(|c| c.as_any().downcast_ref::<TimestampMillisecondArray>())
            .ok_or_else(|| anyhow!("column 'added_at' missing or not a timestamp"))?;
        for i in 0..batch.num_rows() {
            let metadata: Meta = serde_json::from_str(metas.value(i))
                .map_err(|e| anyhow!("chunk {}: bad metadata: {e}", ids.value(i)))?;
            out.push((
                seqs.value(i),
                Chunk {
                    chunk_id: ids.value(i).to_string(),
                    source_id: sources.value(i).to_string(),
                    text: texts.value(i).to_string(),
                    start_offset: starts.value(i) as usize,
                    end_offset: ends.value(i) as usize,
                    content_hash: hashes.value(i).to_string(),
                    added_at: millis_to_utc(added.value(i)),
                    metadata,
                },
            ));
        }
    }
    Ok(out)
}

/// A stored vector row: the chunk id it belongs to and the embedding.
#[derive(Debug, Clone)]
pub struct VectorRow {
    pub chunk_id: String,
    pub vector: Embedding,
}

/// Stored vectors by `seq`, plus the table's list width when the table exists.
pub async fn read_vectors(conn: &Connection) -> Result<(Option<usize>, HashMap<u64, VectorRow>)> {
    let mut width = None;
    let mut out = HashMap::new();
    for batch in scan(conn, VECTORS_TABLE).await? {
        let seqs = u64_col(&batch, "seq")?;
        let ids = string_col(&batch, "id")?;
        let vecs = batch
            .column_by_name("vector")
            .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
            .ok_or_else(|| anyhow!("column 'vector' missing or not a fixed-size list"))?;
        width = Some(vecs.value_length() as usize);
        for i in 0..batch.num_rows() {
            if !vecs.is_valid(i) {
                return Err(anyhow!("vector for {} is null", ids.value(i)));
            }
            let list = vecs.value(i);
            let vector = list.as_primitive::<arrow_array::types::Float32Type>().values().to_vec();
            out.insert(seqs.value(i), VectorRow { chunk_id: ids.value(i).to_string(), vector });
        }
    }
    Ok((width, out))
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}
