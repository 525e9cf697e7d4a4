//! Turning files and transcripts into [`Document`]s.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::IngestionError;
use crate::types::{Document, Meta};

const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown"];
const PDF_EXTENSION: &str = "pdf";

fn extension_of(path: &Path) -> Option<String> {
    path.extension().and_then(|s| s.to_str()).map(str::to_ascii_lowercase)
}

pub fn is_supported(path: &Path) -> bool {
    match extension_of(path) {
        Some(ext) => ext == PDF_EXTENSION || TEXT_EXTENSIONS.contains(&ext.as_str()),
        None => false,
    }
}

/// Recursively lists supported files under `root`, sorted for deterministic ingestion order.
pub fn discover(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_supported(e.path()))
        .map(|e| e.path().to_path_buf())
        .collect();
    files.sort();
    files
}

/// Loads a text, markdown or PDF file. The path becomes the `source_id`.
pub fn load_file(path: &Path) -> Result<Document, IngestionError> {
    let source_id = path.to_string_lossy().to_string();
    let ext = extension_of(path).unwrap_or_default();
    let bytes = fs::read(path).map_err(|e| IngestionError::ExtractionFailed {
        source_id: source_id.clone(),
        reason: format!("failed to read file: {e}"),
    })?;

    let content = if TEXT_EXTENSIONS.contains(&ext.as_str()) {
        decode_text(&source_id, bytes)?
    } else if ext == PDF_EXTENSION {
        // pdf-extract panics on some malformed fonts; keep that scoped to this document
        match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(&bytes)) {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                return Err(IngestionError::ExtractionFailed {
                    source_id,
                    reason: format!("PDF extraction error: {e}"),
                })
            }
            Err(_) => {
                return Err(IngestionError::ExtractionFailed {
                    source_id,
                    reason: "PDF extraction aborted on malformed input".to_string(),
                })
            }
        }
    } else {
        return Err(IngestionError::UnsupportedFormat {
            source_id,
            reason: format!("unsupported file type '.{ext}'"),
        });
    };
    ensure_text(&source_id, &content)?;

    let mut metadata = Meta::new();
    metadata.insert("source_file".to_string(), source_id.clone());
    metadata.insert("file_type".to_string(), format!(".{ext}"));
    tracing::debug!(source_id = %source_id, chars = content.chars().count(), "loaded file");
    Ok(Document::new(source_id, content, metadata))
}

fn decode_text(source_id: &str, bytes: Vec<u8>) -> Result<String, IngestionError> {
    if bytes.contains(&0) {
        return Err(IngestionError::UnsupportedFormat {
            source_id: source_id.to_string(),
            reason: "binary content (NUL bytes)".to_string(),
        });
    }
    String::from_utf8(bytes).map_err(|_| IngestionError::UnsupportedFormat {
        source_id: source_id.to_string(),
        reason: "content is not valid UTF-8".to_string(),
    })
}

/// Rejects documents with nothing to index.
pub fn ensure_text(source_id: &str, content: &str) -> Result<(), IngestionError> {
    if content.trim().is_empty() {
        return Err(IngestionError::ExtractionFailed {
            source_id: source_id.to_string(),
            reason: "no extractable text".to_string(),
        });
    }
    Ok(())
}

/// Extracts a YouTube video id from `youtu.be/<id>`, `youtube.com/watch?v=<id>`,
/// `youtube.com/shorts/<id>` or a bare 11-character id.
pub fn youtube_video_id(reference: &str) -> Option<String> {
    let r = reference.trim();
    let valid = |id: &str| {
        id.len() == 11 && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    };
    let after_scheme = r.split_once("://").map_or(r, |(_, rest)| rest);
    let (host, path) = after_scheme.split_once('/').unwrap_or((after_scheme, ""));
    let host = host.trim_start_matches("www.").trim_start_matches("m.");

    let candidate = if host == "youtu.be" {
        path.split(['?', '&', '#']).next().map(str::to_string)
    } else if host.ends_with("youtube.com") {
        if let Some(id) = path.strip_prefix("shorts/") {
            id.split(['?', '&', '#']).next().map(str::to_string)
        } else {
            let query = path.split_once('?').map(|(_, q)| q).unwrap_or("");
            query
                .split(['&', '#'])
                .find_map(|pair| pair.strip_prefix("v="))
                .map(str::to_string)
        }
    } else if !r.contains('/') {
        Some(r.to_string())
    } else {
        None
    };
    candidate.filter(|id| valid(id))
}

/// Builds a document from transcript segments fetched by the caller.
pub fn transcript_document<S: AsRef<str>>(
    video_ref: &str,
    segments: &[S],
) -> Result<Document, IngestionError> {
    let video_id = youtube_video_id(video_ref).ok_or_else(|| IngestionError::UnsupportedFormat {
        source_id: video_ref.to_string(),
        reason: "not a recognised YouTube URL or video id".to_string(),
    })?;
    let source_id = format!("youtube:{video_id}");
    let text = segments
        .iter()
        .map(|s| s.as_ref().trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    ensure_text(&source_id, &text)?;

    let mut metadata = Meta::new();
    metadata.insert("source".to_string(), "youtube".to_string());
    metadata.insert("video_id".to_string(), video_id);
    metadata.insert("url".to_string(), video_ref.to_string());
    Ok(Document::new(source_id, text, metadata))
}
