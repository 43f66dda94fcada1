//! The `BlobStore` trait -- the keyed byte-blob persistence port.
//!
//! Keys are `/`-separated namespace paths (`state/{task_id}`,
//! `dlq/{entry_id}`). The trait is object-safe so components can hold
//! `Arc<dyn BlobStore>` and stay agnostic of the backing medium.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StoreResult;

/// Keyed byte-blob store consumed by the engine's durable components.
///
/// Contract:
/// - `get` on a missing key returns `Ok(None)`, not an error.
/// - `delete` on a missing key returns `Ok(false)`.
/// - `put` replaces any existing value and must be atomic per key:
///   a concurrent reader sees either the old blob or the new one,
///   never a torn write.
/// - `list` returns the full keys (not suffixes) under a prefix, in
///   unspecified order.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write a blob, replacing any existing value at `key`.
    async fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()>;

    /// Read the blob at `key`, or `None` if absent.
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// List all keys starting with `prefix`.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Remove the blob at `key`. Returns `true` if something was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;
}

// Compile-time assertion: BlobStore must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn BlobStore) {}
};

/// In-memory store backed by a `HashMap`.
///
/// Used by tests and by callers that run the engine without durability.
/// Implements the same contract as [`crate::FsStore`], minus the disk.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.lock().expect("memory store lock poisoned").len()
    }

    /// `true` if the store holds no blobs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        let mut blobs = self.blobs.lock().expect("memory store lock poisoned");
        blobs.insert(key.to_owned(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let blobs = self.blobs.lock().expect("memory store lock poisoned");
        Ok(blobs.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let blobs = self.blobs.lock().expect("memory store lock poisoned");
        Ok(blobs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut blobs = self.blobs.lock().expect("memory store lock poisoned");
        Ok(blobs.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let store = MemoryStore::new();
        store.put("a/1", b"hello").await.unwrap();
        assert_eq!(store.get("a/1").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let store = MemoryStore::new();
        assert_eq!(store.get("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_replaces_existing() {
        let store = MemoryStore::new();
        store.put("k", b"one").await.unwrap();
        store.put("k", b"two").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let store = MemoryStore::new();
        store.put("dlq/1", b"x").await.unwrap();
        store.put("dlq/2", b"y").await.unwrap();
        store.put("state/1", b"z").await.unwrap();

        let mut keys = store.list("dlq/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["dlq/1", "dlq/2"]);
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let store = MemoryStore::new();
        store.put("k", b"v").await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert!(store.is_empty());
    }
}
