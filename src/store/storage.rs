//! Key/value blob stores that hold document snapshots.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Invalid storage key `{0}`")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Asynchronous key/value persistence.
#[async_trait]
pub trait Storage: Send + Sync {
    /// `Ok(None)` when nothing is stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError>;
}

/// Keeps values in memory; useful for tests and temporary stores.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: DashMap<String, Value>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.objects.get(key).map(|value| value.clone()))
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.objects.insert(key.to_string(), value);
        Ok(())
    }
}

/// One JSON file per key inside a directory.
#[derive(Clone, Debug)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let path = self.path_of(key)?;
        trace!("reading {}", path.display());
        match tokio::fs::read(&path).await {
            Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let path = self.path_of(key)?;
        tokio::fs::create_dir_all(&self.root).await?;
        // Write next to the target and rename, so readers never see half a
        // snapshot.
        let partial = path.with_extension("json.partial");
        let content = serde_json::to_vec(&value)?;
        trace!("writing {} bytes to {}", content.len(), path.display());
        tokio::fs::write(&partial, &content).await?;
        tokio::fs::rename(&partial, &path).await?;
        Ok(())
    }
}
