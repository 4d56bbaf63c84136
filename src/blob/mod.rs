//! Blob store backends: in-memory for tests, filesystem for workers.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::error::{RefineryError, Result};
use crate::traits::blob::BlobStore;

/// In-memory blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.read().unwrap().len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<String> {
        self.blobs
            .write()
            .unwrap()
            .insert(key.to_string(), bytes.to_vec());
        Ok(key.to_string())
    }

    async fn get(&self, location: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .unwrap()
            .get(location)
            .cloned()
            .ok_or_else(|| RefineryError::Blob(format!("no blob at {location}")))
    }
}

/// Filesystem blob store rooted at a directory; locations are paths
/// relative to the root. Keys must not escape the root.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = std::path::Path::new(key);
        if relative
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir | std::path::Component::RootDir))
        {
            return Err(RefineryError::Blob(format!("invalid blob key: {key}")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<String> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RefineryError::Blob(format!("create {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| RefineryError::Blob(format!("write {}: {e}", path.display())))?;
        Ok(key.to_string())
    }

    async fn get(&self, location: &str) -> Result<Vec<u8>> {
        let path = self.resolve(location)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| RefineryError::Blob(format!("read {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_round_trip() {
        let store = MemoryBlobStore::new();
        let location = store
            .put("raw/doc-1", b"P0301 misfire notes", "text/plain")
            .await
            .unwrap();
        assert_eq!(store.get(&location).await.unwrap(), b"P0301 misfire notes");
    }

    #[tokio::test]
    async fn memory_missing_blob_is_an_error() {
        let store = MemoryBlobStore::new();
        assert!(store.get("raw/nope").await.is_err());
    }

    #[tokio::test]
    async fn fs_rejects_escaping_keys() {
        let store = FsBlobStore::new("/tmp/refinery-test-blobs");
        assert!(store.put("../outside", b"x", "text/plain").await.is_err());
    }
}
