//! Registry of named collections under one root directory.
//!
//! Each collection sits behind its own `RwLock`: queries share it, writes take
//! it exclusively. The registry mutex is only held to find or insert a
//! collection's slot, never while a collection loads or while waiting on a
//! collection lock. Each slot loads at most once at a time.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use localkb_core::error::StoreError;
use localkb_core::types::{Chunk, CollectionStats, Embedding};

use crate::collection::{sweep_trash, trash_name, CollectionState, UpsertReport, TRASH_PREFIX};
use crate::index_file::{DEFAULT_DATA_DIR, INDEX_FILE};

pub type CollectionHandle = Arc<RwLock<CollectionState>>;

type Slot = Arc<OnceCell<CollectionHandle>>;

const MAX_NAME_LEN: usize = 64;
const WRITE_ATTEMPTS: usize = 3;

/// Collection names become directory names: ASCII alphanumerics plus `-`, `_`
/// and `.`, starting with an alphanumeric.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

pub struct VectorStore {
    root: PathBuf,
    registry: Mutex<HashMap<String, Slot>>,
}

impl VectorStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| StoreError::WriteFailed {
            collection: root.display().to_string(),
            detail: e.to_string(),
        })?;
        sweep_trash(&root);
        tracing::info!(root = %root.display(), "opened vector store");
        Ok(Self { root, registry: Mutex::new(HashMap::new()) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Finds or inserts the slot for `name`. Without `create`, a collection
    /// that is neither loaded nor on disk gets no slot.
    async fn slot(&self, name: &str, create: bool) -> Result<Option<Slot>, StoreError> {
        validate_name(name)?;
        let mut registry = self.registry.lock().await;
        if let Some(slot) = registry.get(name) {
            return Ok(Some(Arc::clone(slot)));
        }
        if !create && !self.collection_dir(name).exists() {
            return Ok(None);
        }
        let slot = Slot::default();
        registry.insert(name.to_string(), Arc::clone(&slot));
        Ok(Some(slot))
    }

    /// Loads the collection into its slot, or creates it when its directory
    /// does not exist. A failed load leaves the slot empty for the next try.
    async fn init(&self, name: &str, slot: &Slot) -> Result<CollectionHandle, StoreError> {
        let handle = slot
            .get_or_try_init(|| async {
                let dir = self.collection_dir(name);
                let state = if dir.exists() {
                    CollectionState::load(name, &dir).await?
                } else {
                    CollectionState::create(name, &dir).await?
                };
                Ok::<_, StoreError>(Arc::new(RwLock::new(state)))
            })
            .await?;
        Ok(Arc::clone(handle))
    }

    async fn lookup(&self, name: &str, create: bool) -> Result<Option<CollectionHandle>, StoreError> {
        match self.slot(name, create).await? {
            Some(slot) => Ok(Some(self.init(name, &slot).await?)),
            None => Ok(None),
        }
    }

    /// Returns the named collection, creating it empty if it does not exist.
    pub async fn create_or_get(&self, name: &str) -> Result<CollectionHandle, StoreError> {
        self.lookup(name, true).await?.ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    /// Returns the named collection if it exists, loading it from disk on first use.
    pub async fn get(&self, name: &str) -> Result<Option<CollectionHandle>, StoreError> {
        self.lookup(name, false).await
    }

    /// Shared access for queries. `None` when the collection does not exist.
    pub async fn read(&self, name: &str) -> Result<Option<OwnedRwLockReadGuard<CollectionState>>, StoreError> {
        let Some(handle) = self.get(name).await? else {
            return Ok(None);
        };
        let guard = handle.read_owned().await;
        if guard.is_dropped() {
            return Ok(None);
        }
        guard.ensure_usable()?;
        Ok(Some(guard))
    }

    async fn write(&self, name: &str) -> Result<OwnedRwLockWriteGuard<CollectionState>, StoreError> {
        for _ in 0..WRITE_ATTEMPTS {
            let guard = self.create_or_get(name).await?.write_owned().await;
            if !guard.is_dropped() {
                return Ok(guard);
            }
        }
        Err(StoreError::NotFound(name.to_string()))
    }

    pub async fn upsert(&self, name: &str, chunks: Vec<Chunk>, vectors: Vec<Embedding>) -> Result<UpsertReport, StoreError> {
        self.write(name).await?.upsert(chunks, vectors).await
    }

    pub async fn replace_source(
        &self,
        name: &str,
        source_id: &str,
        chunks: Vec<Chunk>,
        vectors: Vec<Embedding>,
    ) -> Result<UpsertReport, StoreError> {
        self.write(name).await?.replace_source(source_id, chunks, vectors).await
    }

    /// Zero when the collection or the source does not exist.
    pub async fn delete_by_source(&self, name: &str, source_id: &str) -> Result<usize, StoreError> {
        let Some(handle) = self.get(name).await? else {
            return Ok(0);
        };
        let mut guard = handle.write_owned().await;
        if guard.is_dropped() {
            return Ok(0);
        }
        guard.delete_by_source(source_id).await
    }

    pub async fn clear(&self, name: &str) -> Result<usize, StoreError> {
        self.write(name).await?.clear().await
    }

    pub async fn stats(&self, name: &str) -> Result<CollectionStats, StoreError> {
        match self.read(name).await? {
            Some(guard) => Ok(guard.stats()),
            None => Err(StoreError::NotFound(name.to_string())),
        }
    }

    /// Removes the collection and its directory. Works on collections that fail
    /// to load. Returns whether anything existed.
    pub async fn drop_collection(&self, name: &str) -> Result<bool, StoreError> {
        validate_name(name)?;
        loop {
            let slot = self.registry.lock().await.get(name).cloned();
            // waits for a load in flight; a collection that fails to load has no state to mark
            let handle = match &slot {
                Some(slot) if slot.initialized() || self.collection_dir(name).exists() => {
                    self.init(name, slot).await.ok()
                }
                _ => None,
            };
            let mut guard = match &handle {
                Some(h) => Some(Arc::clone(h).write_owned().await),
                None => None,
            };
            let mut registry = self.registry.lock().await;
            let unchanged = match (&slot, registry.get(name)) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            };
            if !unchanged {
                continue;
            }
            registry.remove(name);

            let dir = self.collection_dir(name);
            let existed = dir.exists();
            if existed {
                let trash = self.root.join(trash_name(name));
                if let Err(e) = std::fs::rename(&dir, &trash) {
                    if let Some(slot) = slot {
                        registry.insert(name.to_string(), slot);
                    }
                    return Err(StoreError::WriteFailed { collection: name.to_string(), detail: e.to_string() });
                }
                drop(registry);
                if let Err(e) = std::fs::remove_dir_all(&trash) {
                    tracing::warn!(path = %trash.display(), error = %e, "failed to remove dropped collection");
                }
            }
            if let Some(g) = guard.as_mut() {
                g.mark_dropped();
            }
            tracing::info!(collection = name, existed, "dropped collection");
            return Ok(existed || handle.is_some());
        }
    }

    /// Names of every collection on disk or in memory, sorted.
    pub async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut names: BTreeSet<String> = self
            .registry
            .lock()
            .await
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        let entries = std::fs::read_dir(&self.root).map_err(|e| StoreError::WriteFailed {
            collection: self.root.display().to_string(),
            detail: e.to_string(),
        })?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(TRASH_PREFIX) || validate_name(&name).is_err() {
                continue;
            }
            let path = entry.path();
            if path.is_dir() && (path.join(INDEX_FILE).exists() || path.join(DEFAULT_DATA_DIR).exists()) {
                names.insert(name);
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Forgets loaded collections; the next access reloads from disk.
    pub async fn close(&self) {
        self.registry.lock().await.clear();
    }
}
