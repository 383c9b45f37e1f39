//! The document store: an in-memory dictionary written through to a
//! [`Storage`] as a full snapshot, with stored views kept up to date on
//! every write.
//!
//! Writes are serialised: views see batches in the order the writes
//! complete, and a view registration never interleaves with a write.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::engine::{Breathe, MapStrategy, Scheduler, ViewError, YieldNow};
use crate::view::{View, ViewDefinition, ViewFailure, ViewStore};

mod dictionary;
mod document;
mod storage;

pub use dictionary::DocumentDictionary;
pub use document::Document;
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("Malformed options: {0}")]
    Options(#[source] serde_json::Error),
    #[error("Failed to serialise the snapshot: {0}")]
    Snapshot(#[source] serde_json::Error),
    #[error(transparent)]
    View(#[from] ViewError),
}

/// Store configuration. Every field has a default, so `{}` is a valid
/// configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Documents (or keys) processed between two yields of the engine.
    pub chunk_size: usize,
    /// Pause between chunks, in milliseconds. `0` only yields.
    pub breathe_ms: u64,
    /// Map threads for views that do not pick a strategy themselves.
    pub workers: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            chunk_size: crate::engine::DEFAULT_CHUNK_SIZE,
            breathe_ms: crate::engine::DEFAULT_BREATHE.as_millis() as u64,
            workers: 1,
        }
    }
}

impl StoreOptions {
    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        serde_json::from_str(json).map_err(StoreError::Options)
    }

    fn scheduler(&self) -> Arc<dyn Scheduler> {
        if self.breathe_ms == 0 {
            Arc::new(YieldNow)
        } else {
            Arc::new(Breathe(Duration::from_millis(self.breathe_ms)))
        }
    }
}

/// Result of a write.
#[derive(Debug, Default)]
pub struct PutOutcome {
    /// Distinct documents written.
    pub written: usize,
    /// Views that could not be updated with this batch.
    pub view_failures: Vec<ViewFailure>,
}

impl PutOutcome {
    pub fn is_clean(&self) -> bool {
        self.view_failures.is_empty()
    }
}

/// Storage key of the snapshot of store `name`.
pub fn storage_key(name: &str) -> String {
    format!("tagcouch_db_{name}")
}

pub struct DocumentStore {
    name: String,
    storage: Arc<dyn Storage>,
    options: StoreOptions,
    dict: RwLock<DocumentDictionary>,
    views: ViewStore,
    writes: tokio::sync::Mutex<()>,
}

impl DocumentStore {
    /// Open store `name`, loading its last snapshot.
    ///
    /// A snapshot that is missing, unreadable or malformed leaves the store
    /// empty.
    pub async fn open(
        name: impl Into<String>,
        storage: Arc<dyn Storage>,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let name = name.into();
        let key = storage_key(&name);
        let dict = match storage.get(&key).await {
            Ok(Some(snapshot)) => match serde_json::from_value::<Vec<Document>>(snapshot) {
                Ok(docs) => DocumentDictionary::unpickle(docs),
                Err(err) => {
                    warn!(store = %name, "ignoring malformed snapshot: {err}");
                    DocumentDictionary::new()
                }
            },
            Ok(None) => {
                debug!(store = %name, "no snapshot yet");
                DocumentDictionary::new()
            }
            Err(err) => {
                warn!(store = %name, "failed to load snapshot: {err}");
                DocumentDictionary::new()
            }
        };
        info!(store = %name, documents = dict.len(), "store opened");

        let views = ViewStore::new(options.scheduler(), options.chunk_size);
        Ok(Self {
            name,
            storage,
            options,
            dict: RwLock::new(dict),
            views,
            writes: tokio::sync::Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    fn read(&self) -> RwLockReadGuard<'_, DocumentDictionary> {
        self.dict.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, DocumentDictionary> {
        self.dict.write().unwrap_or_else(PoisonError::into_inner)
    }

    async fn persist(&self, dict: &DocumentDictionary) -> Result<(), StoreError> {
        let snapshot = serde_json::to_value(dict.snapshot()).map_err(StoreError::Snapshot)?;
        self.storage.put(&storage_key(&self.name), snapshot).await?;
        Ok(())
    }

    pub async fn put(&self, doc: Document) -> Result<PutOutcome, StoreError> {
        self.put_many(vec![doc]).await
    }

    /// Upsert `docs`, persist the whole store, then update the stored views
    /// with the written batch.
    ///
    /// If several documents share an id the last one wins. Nothing changes
    /// in memory when the snapshot cannot be persisted.
    pub async fn put_many(
        &self,
        docs: impl IntoIterator<Item = Document>,
    ) -> Result<PutOutcome, StoreError> {
        let docs: Vec<Arc<Document>> = docs.into_iter().map(Arc::new).collect();
        if docs.is_empty() {
            return Ok(PutOutcome::default());
        }

        let _writing = self.writes.lock().await;
        let mut next = self.read().clone();
        next.set_docs(docs.iter().cloned());

        let mut seen = HashSet::new();
        let written: Vec<Arc<Document>> = docs
            .iter()
            .filter(|doc| seen.insert(doc.id.as_str()))
            .filter_map(|doc| next.get(&doc.id))
            .collect();

        self.persist(&next).await?;
        *self.write() = next;
        debug!(store = %self.name, written = written.len(), "documents written");

        let view_failures = self.views.on_documents_written(&written).await;
        Ok(PutOutcome {
            written: written.len(),
            view_failures,
        })
    }

    pub fn get(&self, id: &str) -> Option<Arc<Document>> {
        self.read().get(id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.read().ids().to_vec()
    }

    /// Every document in order, tombstones included.
    pub fn docs(&self) -> Vec<Arc<Document>> {
        self.read().docs()
    }

    /// Replace `id` by a tombstone. Views drop the rows the document
    /// emitted.
    pub async fn delete(&self, id: &str) -> Result<PutOutcome, StoreError> {
        self.put(Document::tombstone(id)).await
    }

    /// Physically drop `id` from the store.
    ///
    /// Stored views drop the rows `id` emitted, as for a tombstone. View
    /// failures are logged rather than returned.
    pub async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let _writing = self.writes.lock().await;
        let mut next = self.read().clone();
        if next.remove(id).is_none() {
            return Ok(false);
        }
        self.persist(&next).await?;
        *self.write() = next;

        let gone = [Arc::new(Document::tombstone(id))];
        for failure in self.views.on_documents_written(&gone).await {
            warn!(store = %self.name, "{failure}");
        }
        Ok(true)
    }

    /// Drop every document and every view. Nothing changes when the empty
    /// snapshot cannot be persisted.
    pub async fn wipe(&self) -> Result<(), StoreError> {
        let _writing = self.writes.lock().await;
        let empty = DocumentDictionary::new();
        self.persist(&empty).await?;
        *self.write() = empty;
        self.views.clear();
        info!(store = %self.name, "store wiped");
        Ok(())
    }

    fn with_default_strategy(&self, definition: ViewDefinition) -> ViewDefinition {
        if definition.strategy == MapStrategy::SingleThreaded && self.options.workers > 1 {
            definition.strategy(MapStrategy::Parallel {
                workers: self.options.workers,
            })
        } else {
            definition
        }
    }

    /// Compute (or subscribe to) a view over every document.
    ///
    /// `Ok(None)` means the definition was refused; see
    /// [`ViewStore::register`].
    pub async fn view(&self, definition: ViewDefinition) -> Result<Option<Arc<View>>, StoreError> {
        let _writing = self.writes.lock().await;
        let source = self.read().clone();
        let definition = self.with_default_strategy(definition);
        Ok(self.views.register(definition, &source).await?)
    }

    /// [`DocumentStore::view`] over `docs` instead of the stored documents.
    pub async fn view_over(
        &self,
        definition: ViewDefinition,
        docs: Vec<Document>,
    ) -> Result<Option<Arc<View>>, StoreError> {
        let _writing = self.writes.lock().await;
        let source = DocumentDictionary::unpickle(docs);
        let definition = self.with_default_strategy(definition);
        Ok(self.views.register(definition, &source).await?)
    }

    pub fn kill_view(&self, id: &str) -> bool {
        self.views.kill(id)
    }

    pub fn get_view(&self, id: &str) -> Option<Arc<View>> {
        self.views.get(id)
    }

    pub fn view_ids(&self) -> Vec<String> {
        self.views.ids()
    }
}
