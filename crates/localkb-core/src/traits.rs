use crate::error::EmbeddingError;
use crate::types::Embedding;

/// Maps texts to fixed-dimension vectors.
///
/// Implementations are synchronous and may block; callers run them off the
/// async executor. Output is one vector per input, in input order.
pub trait Embedder: Send + Sync {
    /// Stable identifier for the backend/model (e.g. `hash:d384`).
    fn id(&self) -> &str;
    fn dim(&self) -> usize;
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError>;
}
