//! Collection lifecycle.

use localkb_core::error::Result;
use localkb_core::types::CollectionStats;

use crate::KnowledgeBase;

impl KnowledgeBase {
    /// Registers the collection (creating it on disk if needed) and returns its stats.
    pub async fn create_or_get(&self, name: &str) -> Result<CollectionStats> {
        let handle = self.store().create_or_get(name).await?;
        let state = handle.read().await;
        state.ensure_usable()?;
        Ok(state.stats())
    }

    /// Fails with `StoreError::NotFound` for a collection that was never created.
    pub async fn stats(&self, name: &str) -> Result<CollectionStats> {
        Ok(self.store().stats(name).await?)
    }

    /// Removes every chunk but keeps the collection. Returns the number removed.
    pub async fn clear(&self, name: &str) -> Result<usize> {
        Ok(self.store().clear(name).await?)
    }

    /// Removes the collection and its storage. Returns whether it existed.
    pub async fn drop_collection(&self, name: &str) -> Result<bool> {
        Ok(self.store().drop_collection(name).await?)
    }

    pub async fn list_collections(&self) -> Result<Vec<String>> {
        Ok(self.store().list().await?)
    }
}
