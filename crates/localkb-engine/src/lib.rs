//! The knowledge base: one explicit handle over the chunker, the embedding
//! adapter and the vector store.
//!
//! ```no_run
//! # async fn demo() -> localkb_core::error::Result<()> {
//! use localkb_core::config::Settings;
//! use localkb_engine::KnowledgeBase;
//!
//! let kb = KnowledgeBase::open(Settings::default()).await?;
//! kb.add_text("default", "notes.txt", "Rust ownership rules ...", Default::default()).await?;
//! let hits = kb.query("default", "who owns a value?", &kb.query_options()).await?;
//! kb.close().await;
//! # let _ = hits; Ok(()) }
//! ```

use std::sync::Arc;

use localkb_core::chunker::Chunker;
use localkb_core::config::Settings;
use localkb_core::error::{EmbeddingError, Result};
use localkb_core::traits::Embedder;
use localkb_embed::{get_default_embedder, BatchPolicy, EmbedBatcher};
use localkb_vector::VectorStore;

pub mod collections;
pub mod ingest;
pub mod retrieval;
pub mod tools;

pub use ingest::IngestReport;
pub use retrieval::{select_mmr, MmrParams, QueryOptions};
pub use tools::{execute_tool, tool_definitions};

pub struct KnowledgeBase {
    settings: Settings,
    chunker: Chunker,
    batcher: EmbedBatcher,
    store: VectorStore,
}

impl KnowledgeBase {
    /// Opens the store under `settings.storage.root` with the configured embedding backend.
    pub async fn open(settings: Settings) -> Result<Self> {
        let embedder = get_default_embedder(&settings.embedding)
            .map_err(|e| EmbeddingError::ServiceUnavailable(format!("{e:#}")))?;
        Self::open_with(settings, embedder).await
    }

    /// Same as [`KnowledgeBase::open`] with a caller-supplied embedder.
    pub async fn open_with(settings: Settings, embedder: Arc<dyn Embedder>) -> Result<Self> {
        settings.validate()?;
        let chunker = Chunker::new(settings.chunking)?;
        let batcher = EmbedBatcher::new(embedder, BatchPolicy::from(&settings.embedding));
        let store = VectorStore::open(&settings.storage.root).await?;
        tracing::info!(
            root = %settings.storage.root.display(),
            embedder = batcher.embedder().id(),
            chunk_size = chunker.chunk_size(),
            overlap = chunker.overlap(),
            "knowledge base opened"
        );
        Ok(Self { settings, chunker, batcher, store })
    }

    /// Releases loaded collections. Everything committed is already on disk.
    pub async fn close(self) {
        self.store.close().await;
        tracing::info!("knowledge base closed");
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    pub fn batcher(&self) -> &EmbedBatcher {
        &self.batcher
    }

    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    pub fn default_collection(&self) -> &str {
        &self.settings.storage.default_collection
    }
}
