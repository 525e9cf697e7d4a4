//! Document ingestion: validate, chunk, skip unchanged, embed, replace.
//!
//! Embedding happens before the collection's write lock is taken; the lock is
//! held only for the final replace of the source's chunks.

use futures::StreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};

use localkb_core::error::{Error, IngestionError, Result};
use localkb_core::loader::{discover, ensure_text, load_file, transcript_document};
use localkb_core::types::{Chunk, Document, Meta};

use crate::KnowledgeBase;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub source_id: String,
    pub chunks_added: usize,
    /// Chunks of a previous version of the same source that were removed.
    pub replaced: usize,
    /// Chunks dropped for a bad embedding; the rest of the document was kept.
    pub rejected: usize,
    /// The stored chunks already matched this document; nothing was written.
    pub unchanged: bool,
}

impl KnowledgeBase {
    /// Ingests one document into `collection`, creating the collection if needed.
    /// Re-ingesting a `source_id` replaces all of its previous chunks.
    pub async fn add_document(&self, collection: &str, doc: Document) -> Result<IngestReport> {
        if doc.source_id.trim().is_empty() {
            return Err(IngestionError::InvalidDocument("source_id must not be empty".to_string()).into());
        }
        ensure_text(&doc.source_id, &doc.content)?;

        let chunks: Vec<Chunk> = self.chunker().chunk_document(&doc).collect();
        if let Some(state) = self.store().read(collection).await? {
            if state.source_hash(&doc.source_id) == Some(doc.content_hash.as_str())
                && same_chunks(state.source_chunks(&doc.source_id), &chunks)
            {
                tracing::debug!(collection, source_id = %doc.source_id, "content unchanged, skipping");
                return Ok(IngestReport {
                    source_id: doc.source_id,
                    chunks_added: 0,
                    replaced: 0,
                    rejected: 0,
                    unchanged: true,
                });
            }
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.batcher().embed_all(&texts).await?;

        let mut report = self.store().replace_source(collection, &doc.source_id, chunks, vectors).await?;
        if report.inserted == 0 && !report.rejected.is_empty() {
            return Err(report.rejected.swap_remove(0).into());
        }
        tracing::info!(
            collection,
            source_id = %doc.source_id,
            chunks = report.inserted,
            replaced = report.removed,
            "ingested document"
        );
        Ok(IngestReport {
            source_id: doc.source_id,
            chunks_added: report.inserted,
            replaced: report.removed,
            rejected: report.rejected.len(),
            unchanged: false,
        })
    }

    pub async fn add_text(
        &self,
        collection: &str,
        source_id: impl Into<String>,
        content: impl Into<String>,
        metadata: Meta,
    ) -> Result<IngestReport> {
        self.add_document(collection, Document::new(source_id, content, metadata)).await
    }

    /// Ingests several documents, up to `ingest.max_concurrent_documents` at a
    /// time. One result per document, in input order; a failure never affects
    /// the others.
    pub async fn add_documents(&self, collection: &str, docs: Vec<Document>) -> Vec<(String, Result<IngestReport>)> {
        let limit = self.settings().ingest.max_concurrent_documents.max(1);
        futures::stream::iter(docs)
            .map(|doc| async move {
                let source_id = doc.source_id.clone();
                (source_id, self.add_document(collection, doc).await)
            })
            .buffered(limit)
            .collect()
            .await
    }

    /// Loads a text, markdown or PDF file and ingests it under its path.
    pub async fn ingest_file(&self, collection: &str, path: &Path) -> Result<IngestReport> {
        let owned = path.to_path_buf();
        let doc = tokio::task::spawn_blocking(move || load_file(&owned))
            .await
            .map_err(|e| IngestionError::ExtractionFailed {
                source_id: path.to_string_lossy().to_string(),
                reason: format!("loader task failed: {e}"),
            })??;
        self.add_document(collection, doc).await
    }

    /// Ingests files concurrently, reporting each result through `on_result`
    /// as soon as it is known.
    pub async fn ingest_files<F>(
        &self,
        collection: &str,
        files: Vec<PathBuf>,
        mut on_result: F,
    ) -> Vec<(PathBuf, Result<IngestReport>)>
    where
        F: FnMut(&Path, &Result<IngestReport>),
    {
        let limit = self.settings().ingest.max_concurrent_documents.max(1);
        let mut results = futures::stream::iter(files)
            .map(|path| async move {
                let result = self.ingest_file(collection, &path).await;
                (path, result)
            })
            .buffered(limit);
        let mut out = Vec::new();
        while let Some((path, result)) = results.next().await {
            if let Err(e) = &result {
                tracing::warn!(path = %path.display(), error = %e, "document not ingested");
            }
            on_result(&path, &result);
            out.push((path, result));
        }
        out
    }

    /// Ingests a video transcript fetched by the caller.
    pub async fn ingest_transcript<S: AsRef<str>>(
        &self,
        collection: &str,
        video_ref: &str,
        segments: &[S],
    ) -> Result<IngestReport> {
        let doc = transcript_document(video_ref, segments)?;
        self.add_document(collection, doc).await
    }
}

/// Whether the stored chunks of a source match a fresh chunking of it: same
/// windows, same text and same metadata. Timestamps are ignored.
fn same_chunks<'a>(stored: impl Iterator<Item = &'a Chunk>, fresh: &[Chunk]) -> bool {
    let mut count = 0;
    for old in stored {
        let Some(new) = fresh.get(count) else {
            return false;
        };
        let same = old.chunk_id == new.chunk_id
            && old.start_offset == new.start_offset
            && old.end_offset == new.end_offset
            && old.text == new.text
            && old.metadata == new.metadata;
        if !same {
            return false;
        }
        count += 1;
    }
    count == fresh.len()
}

/// Expands directories into their supported files; plain files pass through.
pub fn expand_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    paths
        .iter()
        .flat_map(|p| if p.is_dir() { discover(p) } else { vec![p.clone()] })
        .collect()
}

/// Whether a failed ingestion was the document's fault rather than the system's.
pub fn is_document_error(err: &Error) -> bool {
    matches!(err, Error::Ingestion(_))
}
