//! Integration tests for the filesystem blob store.

use foreman_store::{BlobStore, FsStore};

async fn temp_store() -> (tempfile::TempDir, FsStore) {
    let tmp = tempfile::TempDir::new().expect("failed to create temp dir");
    let store = FsStore::open(tmp.path()).await.expect("failed to open store");
    (tmp, store)
}

#[tokio::test]
async fn roundtrip_survives_reopen() {
    let (tmp, store) = temp_store().await;
    store.put("dlq/entry-1", br#"{"error":"boom"}"#).await.unwrap();
    drop(store);

    // A fresh store over the same directory sees the same blobs.
    let reopened = FsStore::open(tmp.path()).await.unwrap();
    assert_eq!(
        reopened.get("dlq/entry-1").await.unwrap(),
        Some(br#"{"error":"boom"}"#.to_vec())
    );
}

#[tokio::test]
async fn list_returns_full_keys_under_prefix() {
    let (_tmp, store) = temp_store().await;
    store.put("checkpoints/a", b"1").await.unwrap();
    store.put("checkpoints/b", b"2").await.unwrap();
    store.put("state/a", b"3").await.unwrap();

    let mut keys = store.list("checkpoints/").await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["checkpoints/a", "checkpoints/b"]);

    let all = store.list("").await.unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn list_missing_prefix_is_empty() {
    let (_tmp, store) = temp_store().await;
    assert!(store.list("nothing/").await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_then_get_returns_none() {
    let (_tmp, store) = temp_store().await;
    store.put("k", b"v").await.unwrap();
    assert!(store.delete("k").await.unwrap());
    assert_eq!(store.get("k").await.unwrap(), None);
    assert!(!store.delete("k").await.unwrap());
}

#[tokio::test]
async fn put_overwrites_atomically() {
    let (tmp, store) = temp_store().await;
    store.put("snapshot", b"old-value").await.unwrap();
    store.put("snapshot", b"new-value").await.unwrap();

    assert_eq!(store.get("snapshot").await.unwrap(), Some(b"new-value".to_vec()));

    // No tmp droppings left behind after a completed write.
    let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "tmp files left behind: {leftovers:?}");
}
