//! Storage for critical-section payloads.
//!
//! The lock manager reads and writes payloads through [`PayloadStore`]. The
//! server uses [`FileStore`] (one file per resource, like a plain file read or
//! write) unless started with `--memory`, in which case [`MemoryStore`] keeps
//! everything in process.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;

use crate::error::StoreError;

#[async_trait]
pub trait PayloadStore: Send + Sync {
    /// Returns the stored payload, or `None` when nothing was ever written.
    async fn read_payload(&self, resource: &str) -> Result<Option<String>, StoreError>;

    /// Replaces the payload stored for `resource`.
    async fn write_payload(&self, resource: &str, payload: &str) -> Result<(), StoreError>;
}

/// Keeps each resource's payload in `<root>/<resource>`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, resource: &str) -> Result<PathBuf, StoreError> {
        let invalid = resource.is_empty()
            || resource == "."
            || resource == ".."
            || resource.contains(['/', '\\', '\0']);
        if invalid {
            return Err(StoreError::InvalidName(resource.to_string()));
        }
        Ok(self.root.join(resource))
    }
}

#[async_trait]
impl PayloadStore for FileStore {
    async fn read_payload(&self, resource: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(resource)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_payload(&self, resource: &str, payload: &str) -> Result<(), StoreError> {
        let path = self.path_for(resource)?;
        tokio::fs::write(&path, payload).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PayloadStore for MemoryStore {
    async fn read_payload(&self, resource: &str) -> Result<Option<String>, StoreError> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(data.get(resource).cloned())
    }

    async fn write_payload(&self, resource: &str, payload: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.insert(resource.to_string(), payload.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_reads_missing_resource_as_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());

        assert_eq!(store.read_payload("doc").await.expect("read"), None);

        store
            .write_payload("doc", "hello world")
            .await
            .expect("write");
        assert_eq!(
            store.read_payload("doc").await.expect("read"),
            Some("hello world".to_string())
        );

        store.write_payload("doc", "short").await.expect("overwrite");
        let on_disk = std::fs::read_to_string(dir.path().join("doc")).expect("file on disk");
        assert_eq!(on_disk, "short");
    }

    #[tokio::test]
    async fn file_store_rejects_path_like_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());

        for name in ["../escape", "a/b", "..", ""] {
            let result = store.write_payload(name, "x").await;
            assert!(
                matches!(result, Err(StoreError::InvalidName(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn memory_store_overwrites() {
        let store = MemoryStore::new();
        store.write_payload("k", "one").await.expect("write");
        store.write_payload("k", "two").await.expect("write");
        assert_eq!(
            store.read_payload("k").await.expect("read"),
            Some("two".to_string())
        );
        assert_eq!(store.read_payload("other").await.expect("read"), None);
    }
}
