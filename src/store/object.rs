//! Object storage for chunk bytes. Keys are write-once; deletion is
//! idempotent.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Abstract blob store holding chunk bytes under opaque string keys.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Bytes>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Disk-backed store rooted at a data directory. Keys map directly to
/// relative paths, so `uploads/<id>/chunk.0.mp3` lands where it reads.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        // Keys are generated internally, but reject traversal anyway.
        if key.split('/').any(|part| part == "..") || Path::new(key).is_absolute() {
            anyhow::bail!("invalid storage key: {}", key);
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create storage directory")?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("failed to write object {}", key))?;
        debug!(
            target: "store::object",
            key = %key,
            size = bytes.len(),
            "Stored object"
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.resolve(key)?;
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read object {}", key))?;
        Ok(Bytes::from(data))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete object {}", key)),
        }
    }
}

/// In-memory store used by tests and single-process deployments.
#[derive(Default)]
pub struct MemoryObjectStore {
    entries: DashMap<String, Bytes>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<()> {
        self.entries.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.entries
            .get(key)
            .map(|entry| entry.value().clone())
            .with_context(|| format!("object not found: {}", key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_store_round_trips_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        store
            .put("uploads/p1/chunk.0.mp3", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        let read = store.get("uploads/p1/chunk.0.mp3").await.unwrap();
        assert_eq!(read.as_ref(), b"abc");

        store.delete("uploads/p1/chunk.0.mp3").await.unwrap();
        assert!(store.get("uploads/p1/chunk.0.mp3").await.is_err());
        // Deleting again is a no-op.
        store.delete("uploads/p1/chunk.0.mp3").await.unwrap();
    }

    #[tokio::test]
    async fn local_store_rejects_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert!(
            store
                .put("../outside", Bytes::from_static(b"x"))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryObjectStore::new();
        store.put("k", Bytes::from_static(b"v")).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_ref(), b"v");
        store.delete("k").await.unwrap();
        assert!(store.get("k").await.is_err());
    }
}
