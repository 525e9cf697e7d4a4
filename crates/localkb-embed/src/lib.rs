//! Embedding backends and the batching adapter the engine talks to.
//!
//! Respects `APP_USE_FAKE_EMBEDDINGS=1` to switch to the [`HashEmbedder`] for fast
//! and deterministic outputs in tests and development.

use anyhow::Result;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use twox_hash::XxHash64;

use localkb_core::config::{EmbeddingBackend, EmbeddingConfig};
use localkb_core::error::EmbeddingError;
use localkb_core::traits::Embedder;
use localkb_core::types::Embedding;

pub mod batch;
pub mod device;
pub mod model;
pub mod pool;
pub mod tokenize;

pub use batch::{BatchPolicy, EmbedBatcher};
pub use model::BgeM3Embedder;
pub use pool::masked_mean_l2;

/// Feature-hashing bag of words, L2-normalised. Shared tokens give shared
/// dimensions, so lexical overlap shows up as cosine similarity.
pub struct HashEmbedder {
    dim: usize,
    id: String,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        let dim = dim.max(1);
        Self { dim, id: format!("hash:d{dim}") }
    }

    pub fn embed_text(&self, text: &str) -> Embedding {
        let mut v = vec![0f32; self.dim];
        for (i, token) in text.split_whitespace().enumerate() {
            let token = token.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase();
            if token.is_empty() {
                continue;
            }
            let mut hasher = XxHash64::with_seed(0);
            token.hash(&mut hasher);
            let h = hasher.finish();
            let idx = (h as usize) % self.dim;
            let val = (((h >> 32) as u32) as f32) / (u32::MAX as f32);
            v[idx] += 0.5 + val + (i as f32 % 3.0) * 0.01;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

impl Embedder for HashEmbedder {
    fn id(&self) -> &str {
        &self.id
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

fn fake_requested() -> bool {
    std::env::var("APP_USE_FAKE_EMBEDDINGS")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Builds the configured backend.
pub fn get_default_embedder(cfg: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    if fake_requested() || cfg.backend == EmbeddingBackend::Hash {
        tracing::info!(target: "embed", dim = cfg.dimension, "using HashEmbedder");
        return Ok(Arc::new(HashEmbedder::new(cfg.dimension)));
    }
    Ok(Arc::new(BgeM3Embedder::new(cfg.model_dir.as_deref())?))
}
