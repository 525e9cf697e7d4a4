//! Function-calling surface for a chat host: JSON schemas plus a dispatcher
//! that always answers with a `{"success": ...}` object.

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;

use localkb_core::error::{Error, StoreError};
use localkb_core::types::{Meta, ScoredChunk};

use crate::KnowledgeBase;

pub const ADD_DOCUMENT: &str = "add_document";
pub const QUERY_KNOWLEDGE_BASE: &str = "query_knowledge_base";
pub const CLEAR_KNOWLEDGE_BASE: &str = "clear_knowledge_base";
pub const GET_KNOWLEDGE_BASE_STATS: &str = "get_knowledge_base_stats";
pub const INGEST_DOCUMENT: &str = "ingest_document";
pub const INGEST_TRANSCRIPT: &str = "ingest_transcript";

fn collection_property() -> Value {
    json!({ "type": "string", "description": "Collection to use (defaults to the configured default collection)" })
}

fn function(name: &str, description: &str, properties: Value, required: &[&str]) -> Value {
    let mut properties = properties;
    if let Some(map) = properties.as_object_mut() {
        map.insert("collection".to_string(), collection_property());
    }
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": { "type": "object", "properties": properties, "required": required }
        }
    })
}

/// OpenAI-style tool definitions for every operation.
pub fn tool_definitions() -> Vec<Value> {
    vec![
        function(
            ADD_DOCUMENT,
            "Add a text document to the knowledge base. Re-adding the same source_id replaces its previous content.",
            json!({
                "source_id": { "type": "string", "description": "Stable identifier of the document, e.g. a path or URL" },
                "content": { "type": "string", "description": "Full text of the document" },
                "metadata": { "type": "object", "additionalProperties": { "type": "string" }, "description": "String metadata copied onto every chunk" }
            }),
            &["source_id", "content"],
        ),
        function(
            INGEST_DOCUMENT,
            "Ingest a document (PDF, TXT, MD) into the knowledge base for later retrieval. Use this when the user wants to add documents to the system.",
            json!({ "file_path": { "type": "string", "description": "Path to the file to ingest" } }),
            &["file_path"],
        ),
        function(
            INGEST_TRANSCRIPT,
            "Ingest a YouTube video transcript into the knowledge base. Use this when the user provides a YouTube URL and wants to chat about the video content.",
            json!({
                "video_url": { "type": "string", "description": "YouTube video URL (e.g., https://www.youtube.com/watch?v=VIDEO_ID) or video id" },
                "transcript": {
                    "description": "Transcript text, or a list of transcript segments",
                    "oneOf": [ { "type": "string" }, { "type": "array", "items": { "type": "string" } } ]
                }
            }),
            &["video_url", "transcript"],
        ),
        function(
            QUERY_KNOWLEDGE_BASE,
            "Search the knowledge base for relevant information. Use this when answering questions about previously ingested documents or videos.",
            json!({
                "query": { "type": "string", "description": "The search query" },
                "k": { "type": "integer", "description": "Number of results to return (default: 4)", "default": 4 },
                "use_mmr": { "type": "boolean", "description": "Diversify results with Maximal Marginal Relevance (default: true)", "default": true },
                "fetch_k": { "type": "integer", "description": "Candidates considered by MMR (default: 20, or k if larger)", "default": 20 },
                "lambda_mult": { "type": "number", "description": "MMR trade-off: 1 favours relevance, 0 favours diversity (default: 0.5)", "default": 0.5 }
            }),
            &["query"],
        ),
        function(
            CLEAR_KNOWLEDGE_BASE,
            "Clear all documents from the knowledge base. Use this when the user wants to start fresh.",
            json!({}),
            &[],
        ),
        function(
            GET_KNOWLEDGE_BASE_STATS,
            "Get statistics about the knowledge base (number of documents, etc.). Use this when the user asks about what's in the knowledge base.",
            json!({}),
            &[],
        ),
    ]
}

#[derive(Deserialize)]
struct AddDocumentArgs {
    source_id: String,
    content: String,
    #[serde(default)]
    metadata: Meta,
    collection: Option<String>,
}

#[derive(Deserialize)]
struct IngestDocumentArgs {
    file_path: String,
    collection: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Transcript {
    Text(String),
    Segments(Vec<String>),
}

#[derive(Deserialize)]
struct IngestTranscriptArgs {
    video_url: String,
    transcript: Transcript,
    collection: Option<String>,
}

#[derive(Deserialize)]
struct QueryArgs {
    query: String,
    k: Option<usize>,
    use_mmr: Option<bool>,
    fetch_k: Option<usize>,
    lambda_mult: Option<f32>,
    collection: Option<String>,
}

#[derive(Deserialize)]
struct CollectionArgs {
    collection: Option<String>,
}

fn parse<T: DeserializeOwned>(name: &str, args: Value) -> Result<T> {
    serde_json::from_value(args).map_err(|e| anyhow!("invalid arguments for {name}: {e}"))
}

fn result_json(hit: &ScoredChunk, with_score: bool) -> Value {
    let mut v = json!({
        "text": hit.chunk.text,
        "source_id": hit.chunk.source_id,
        "chunk_id": hit.chunk.chunk_id,
        "metadata": hit.chunk.metadata,
    });
    if with_score {
        v["score"] = json!(hit.score);
    }
    v
}

/// Runs a tool call whose arguments arrive as a raw JSON string. Never panics;
/// failures come back as `{"success": false, "error": ...}`.
pub async fn execute_tool(kb: &KnowledgeBase, name: &str, arguments: &str) -> Value {
    let args = if arguments.trim().is_empty() {
        Ok(json!({}))
    } else {
        serde_json::from_str::<Value>(arguments).map_err(|e| anyhow!("arguments are not valid JSON: {e}"))
    };
    match args {
        Ok(args) => execute_tool_value(kb, name, args).await,
        Err(e) => json!({ "success": false, "error": e.to_string() }),
    }
}

pub async fn execute_tool_value(kb: &KnowledgeBase, name: &str, args: Value) -> Value {
    match dispatch(kb, name, args).await {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(tool = name, error = %e, "tool call failed");
            json!({ "success": false, "error": format!("{e:#}") })
        }
    }
}

async fn dispatch(kb: &KnowledgeBase, name: &str, args: Value) -> Result<Value> {
    let args = if args.is_null() { json!({}) } else { args };
    match name {
        ADD_DOCUMENT => {
            let a: AddDocumentArgs = parse(name, args)?;
            let collection = a.collection.as_deref().unwrap_or(kb.default_collection());
            let report = kb.add_text(collection, a.source_id, a.content, a.metadata).await?;
            Ok(json!({
                "success": true,
                "collection": collection,
                "source_id": report.source_id,
                "chunks_added": report.chunks_added,
                "replaced": report.replaced,
                "unchanged": report.unchanged,
            }))
        }
        INGEST_DOCUMENT => {
            let a: IngestDocumentArgs = parse(name, args)?;
            let collection = a.collection.as_deref().unwrap_or(kb.default_collection());
            let path = Path::new(&a.file_path);
            if !path.is_file() {
                return Err(anyhow!("File not found: {}", a.file_path));
            }
            let report = kb.ingest_file(collection, path).await?;
            Ok(json!({
                "success": true,
                "collection": collection,
                "file": &a.file_path,
                "chunks": report.chunks_added,
                "unchanged": report.unchanged,
                "message": format!("Ingested {} chunks from {}", report.chunks_added, a.file_path),
            }))
        }
        INGEST_TRANSCRIPT => {
            let a: IngestTranscriptArgs = parse(name, args)?;
            let collection = a.collection.as_deref().unwrap_or(kb.default_collection());
            let segments = match a.transcript {
                Transcript::Text(t) => vec![t],
                Transcript::Segments(s) => s,
            };
            let report = kb.ingest_transcript(collection, &a.video_url, &segments).await?;
            let video_id = report.source_id.trim_start_matches("youtube:").to_string();
            Ok(json!({
                "success": true,
                "collection": collection,
                "video_id": video_id,
                "source_id": report.source_id,
                "chunks": report.chunks_added,
                "unchanged": report.unchanged,
            }))
        }
        QUERY_KNOWLEDGE_BASE => {
            let a: QueryArgs = parse(name, args)?;
            let collection = a.collection.as_deref().unwrap_or(kb.default_collection());
            let mut opts = kb.query_options();
            opts.k = a.k.unwrap_or(opts.k);
            opts.use_mmr = a.use_mmr.unwrap_or(opts.use_mmr);
            // only a fetch_k the caller chose can be too small for k
            opts.fetch_k = a.fetch_k.unwrap_or(opts.fetch_k.max(opts.k));
            opts.lambda_mult = a.lambda_mult.unwrap_or(opts.lambda_mult);
            let hits = kb.query(collection, &a.query, &opts).await?;
            let results: Vec<Value> = hits.iter().map(|h| result_json(h, !opts.use_mmr)).collect();
            Ok(json!({
                "success": true,
                "collection": collection,
                "query": a.query,
                "count": results.len(),
                "results": results,
            }))
        }
        CLEAR_KNOWLEDGE_BASE => {
            let a: CollectionArgs = parse(name, args)?;
            let collection = a.collection.as_deref().unwrap_or(kb.default_collection());
            let removed = kb.clear(collection).await?;
            Ok(json!({ "success": true, "cleared": true, "collection": collection, "removed_chunks": removed }))
        }
        GET_KNOWLEDGE_BASE_STATS => {
            let a: CollectionArgs = parse(name, args)?;
            let collection = a.collection.as_deref().unwrap_or(kb.default_collection());
            let (exists, stats) = match kb.stats(collection).await {
                Ok(stats) => (true, stats),
                Err(Error::Store(StoreError::NotFound(_))) => (false, Default::default()),
                Err(e) => return Err(e.into()),
            };
            Ok(json!({
                "success": true,
                "collection": collection,
                "exists": exists,
                "document_count": stats.document_count,
                "chunk_count": stats.chunk_count,
                "dimension": stats.dimension,
                "sources": stats.sources,
                "persist_directory": kb.store().root().join(collection),
            }))
        }
        other => Err(anyhow!("Unknown function: {other}")),
    }
}
