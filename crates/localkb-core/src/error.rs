use thiserror::Error;

/// Failures attributable to a single document during ingestion.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum IngestionError {
    #[error("Unsupported format for '{source_id}': {reason}")]
    UnsupportedFormat { source_id: String, reason: String },

    #[error("Text extraction failed for '{source_id}': {reason}")]
    ExtractionFailed { source_id: String, reason: String },

    #[error("Dimension mismatch for chunk '{chunk_id}': expected {expected}, got {actual}")]
    DimensionMismatch { chunk_id: String, expected: usize, actual: usize },

    #[error("Invalid embedding for chunk '{chunk_id}': {reason}")]
    InvalidEmbedding { chunk_id: String, reason: String },

    #[error("Invalid document: {0}")]
    InvalidDocument(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EmbeddingError {
    #[error("Embedding timed out after {0} ms")]
    Timeout(u64),

    #[error("Embedding service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Invalid embedding input: {0}")]
    InvalidInput(String),
}

impl EmbeddingError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::ServiceUnavailable(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Collection '{collection}' is corrupt: {detail}")]
    Corruption { collection: String, detail: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Write failed for collection '{collection}': {detail}")]
    WriteFailed { collection: String, detail: String },

    #[error("Invalid collection name '{0}'")]
    InvalidName(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueryError {
    #[error("Invalid query parameters: {0}")]
    InvalidParameters(String),

    #[error("Query embedding has dimension {actual}, collection expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to load configuration: {0}")]
    Load(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Ingestion(#[from] IngestionError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
