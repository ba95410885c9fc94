//! Persistence seam for the small JSON state documents.
//!
//! Each component owns one document (ledger, rate windows, attempt states,
//! pattern library) and does load-modify-save through a [`StateStore`].

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::Result;

#[async_trait]
pub trait StateStore<T>: Send + Sync
where
    T: Send + Sync,
{
    /// `None` when nothing has been persisted yet.
    async fn load(&self) -> Result<Option<T>>;

    async fn save(&self, value: &T) -> Result<()>;
}

/// Pretty-printed JSON file written via temp file + rename.
pub struct JsonFileStore<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).await?;
    }

    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, content).await?;

    let tmp_clone = tmp_path.clone();
    match tokio::task::spawn_blocking(move || {
        std::fs::File::open(&tmp_clone).and_then(|file| file.sync_all())
    })
    .await
    {
        Err(e) => warn!(error = %e, "Failed to sync temp file to disk"),
        Ok(Err(e)) => warn!(error = %e, "Failed to sync temp file to disk"),
        Ok(Ok(())) => {}
    }

    fs::rename(&tmp_path, path).await?;
    debug!(path = %path.display(), "Atomic write completed");
    Ok(())
}

#[async_trait]
impl<T> StateStore<T> for JsonFileStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    async fn load(&self) -> Result<Option<T>> {
        match fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(None),
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, value: &T) -> Result<()> {
        let mut content = serde_json::to_string_pretty(value)?;
        content.push('\n');
        write_atomic(&self.path, &content).await
    }
}

/// In-process store. Clones share the same slot.
pub struct MemoryStore<T> {
    slot: Arc<RwLock<Option<T>>>,
}

impl<T> Clone for MemoryStore<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self {
            slot: Arc::new(RwLock::new(None)),
        }
    }
}

impl<T: Clone> MemoryStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(value: T) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Some(value))),
        }
    }

    pub fn snapshot(&self) -> Option<T> {
        self.slot.read().clone()
    }
}

#[async_trait]
impl<T> StateStore<T> for MemoryStore<T>
where
    T: Clone + Send + Sync,
{
    async fn load(&self) -> Result<Option<T>> {
        Ok(self.slot.read().clone())
    }

    async fn save(&self, value: &T) -> Result<()> {
        *self.slot.write() = Some(value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use tempfile::TempDir;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        version: u32,
        items: Vec<String>,
    }

    #[tokio::test]
    async fn test_json_file_store_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let store: JsonFileStore<Doc> = JsonFileStore::new(dir.path().join("absent.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_file_store_creates_parent_and_leaves_no_tmp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("doc.json");
        let store = JsonFileStore::new(&path);
        let doc = Doc {
            version: 1,
            items: vec!["a".into()],
        };

        store.save(&doc).await.unwrap();

        assert_eq!(store.load().await.unwrap(), Some(doc));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_json_file_store_rejects_corrupt_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store: JsonFileStore<Doc> = JsonFileStore::new(&path);
        assert!(store.load().await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_clones_share_state() {
        let store: MemoryStore<Doc> = MemoryStore::new();
        let other = store.clone();
        other
            .save(&Doc {
                version: 2,
                items: vec![],
            })
            .await
            .unwrap();
        assert_eq!(store.snapshot().map(|d| d.version), Some(2));
    }
}
