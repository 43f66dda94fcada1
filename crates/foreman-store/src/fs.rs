//! Filesystem blob store.
//!
//! One file per key under a base directory. Writes go to a `.tmp`
//! sibling first and are renamed into place, so a blob is always either
//! fully the old value or fully the new one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::blob::BlobStore;
use crate::error::{StoreError, StoreResult};

/// Suffix for in-flight writes. Files carrying it are ignored by
/// `get`/`list` and swept away by `put` on the next write to the key.
const TMP_SUFFIX: &str = ".tmp";

/// Filesystem-backed [`BlobStore`].
///
/// Keys map directly to relative paths under the base directory, so
/// namespaced keys (`state/abc`) become subdirectories. Keys containing
/// `..` segments or leading separators are rejected.
#[derive(Debug, Clone)]
pub struct FsStore {
    base_dir: PathBuf,
}

impl FsStore {
    /// Open a store rooted at `base_dir`, creating the directory if needed.
    pub async fn open(base_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).await?;
        tracing::debug!(dir = %base_dir.display(), "opened filesystem blob store");
        Ok(Self { base_dir })
    }

    /// Default data directory.
    ///
    /// Priority: `FOREMAN_DATA_DIR` env var, then the platform data dir
    /// (`~/.local/share/foreman` on Linux), then `./.foreman`.
    pub fn default_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("FOREMAN_DATA_DIR") {
            return PathBuf::from(dir);
        }
        dirs::data_dir()
            .map(|d| d.join("foreman"))
            .unwrap_or_else(|| PathBuf::from(".foreman"))
    }

    /// The directory this store is rooted at.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Map a key to its backing file path, rejecting traversal.
    fn key_path(&self, key: &str) -> StoreResult<PathBuf> {
        if key.is_empty()
            || key.starts_with('/')
            || key.ends_with(TMP_SUFFIX)
            || key.split('/').any(|seg| seg.is_empty() || seg == "..")
        {
            return Err(StoreError::InvalidKey(key.to_owned()));
        }
        Ok(self.base_dir.join(key))
    }
}

#[async_trait]
impl BlobStore for FsStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        let path = self.key_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write the full blob to a tmp sibling, then rename into place.
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!("{file_name}{TMP_SUFFIX}"));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let path = self.key_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        // Walk from the deepest existing directory implied by the prefix.
        let (dir, _) = match prefix.rsplit_once('/') {
            Some((dir, rest)) => (self.base_dir.join(dir), rest),
            None => (self.base_dir.clone(), prefix),
        };

        let mut keys = Vec::new();
        let mut pending = vec![dir];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&self.base_dir) else {
                    continue;
                };
                let key = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
                if key.starts_with(prefix) && !key.ends_with(TMP_SUFFIX) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
