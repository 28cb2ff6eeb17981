//! Plain (flat) storage backend.
//!
//! Stores every file directly in the Dstore folder:
//!   `{folder}/{filename}`
//!
//! Incoming data lands in `{folder}/.partial/` first and is renamed into
//! place once complete. All filesystem I/O is performed inside
//! `tokio::task::spawn_blocking` to avoid blocking the async runtime.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dfs_proto::{DfsError, DfsResult};
use tracing::{debug, info, warn};

use super::common;
use super::FileStore;

/// Flat-folder storage backend.
pub struct PlainStore {
    base: PathBuf,
}

impl PlainStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn path(&self, filename: &str) -> DfsResult<PathBuf> {
        common::file_path(&self.base, filename)
    }
}

#[async_trait]
impl FileStore for PlainStore {
    fn name(&self) -> &str {
        "plain"
    }

    async fn init(&self, clear: bool) -> DfsResult<()> {
        let base = self.base.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&base).map_err(|e| {
                warn!("plain: failed to create folder {}: {}", base.display(), e);
                DfsError::Eio
            })?;
            if clear {
                let removed = common::clear_dir(&base)?;
                info!("plain: cleared {} entries from {}", removed, base.display());
            } else {
                debug!("plain: using folder {}", base.display());
            }
            Ok(())
        })
        .await
        .map_err(|_| DfsError::SystemError)?
    }

    async fn exist(&self, filename: &str) -> bool {
        let path = match self.path(filename) {
            Ok(p) => p,
            Err(_) => return false,
        };
        tokio::task::spawn_blocking(move || path.is_file())
            .await
            .unwrap_or(false)
    }

    async fn write(&self, filename: &str, data: &[u8]) -> DfsResult<()> {
        let path = self.path(filename)?;
        let base = self.base.clone();
        let data = data.to_vec();
        let name = filename.to_string();

        tokio::task::spawn_blocking(move || {
            common::atomic_write(&base, &path, &data)?;
            debug!("plain: wrote {} ({} bytes)", name, data.len());
            Ok(())
        })
        .await
        .map_err(|_| DfsError::SystemError)?
    }

    async fn read(&self, filename: &str) -> DfsResult<Vec<u8>> {
        let path = self.path(filename)?;

        tokio::task::spawn_blocking(move || {
            if !path.is_file() {
                return Err(DfsError::FileDoesNotExist);
            }
            std::fs::read(&path).map_err(DfsError::from)
        })
        .await
        .map_err(|_| DfsError::SystemError)?
    }

    async fn remove(&self, filename: &str) -> DfsResult<()> {
        let path = self.path(filename)?;
        let name = filename.to_string();

        tokio::task::spawn_blocking(move || {
            if !path.is_file() {
                return Err(DfsError::FileDoesNotExist);
            }
            std::fs::remove_file(&path).map_err(|e| {
                warn!("plain: failed to remove {}: {}", path.display(), e);
                DfsError::from(e)
            })?;
            debug!("plain: removed {}", name);
            Ok(())
        })
        .await
        .map_err(|_| DfsError::SystemError)?
    }

    async fn list(&self) -> DfsResult<Vec<String>> {
        let base = self.base.clone();
        tokio::task::spawn_blocking(move || common::scan_dir(&base))
            .await
            .map_err(|_| DfsError::SystemError)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_plain_store_init_clears() {
        let tmp = std::env::temp_dir().join("dfs_test_plain_init");
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(tmp.join("leftover_dir")).unwrap();
        std::fs::write(tmp.join("stale"), b"old").unwrap();

        let store = PlainStore::new(&tmp);
        assert_eq!(store.name(), "plain");

        store.init(false).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["stale".to_string()]);

        store.init(true).await.unwrap();
        assert!(tmp.is_dir());
        assert!(store.list().await.unwrap().is_empty());
        assert!(!tmp.join("leftover_dir").exists());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn test_plain_store_crud() {
        let tmp = std::env::temp_dir().join("dfs_test_plain_crud");
        let _ = std::fs::remove_dir_all(&tmp);

        let store = PlainStore::new(&tmp);
        store.init(true).await.unwrap();

        assert!(!store.exist("notes.txt").await);
        store.write("notes.txt", b"hello dfs").await.unwrap();
        assert!(store.exist("notes.txt").await);
        assert_eq!(store.read("notes.txt").await.unwrap(), b"hello dfs");

        // Rewrites replace the content.
        store.write("notes.txt", b"bye").await.unwrap();
        assert_eq!(store.read("notes.txt").await.unwrap(), b"bye");

        store.write("empty", b"").await.unwrap();
        assert_eq!(
            store.list().await.unwrap(),
            vec!["empty".to_string(), "notes.txt".to_string()]
        );

        store.remove("notes.txt").await.unwrap();
        assert!(!store.exist("notes.txt").await);
        assert_eq!(store.remove("notes.txt").await, Err(DfsError::FileDoesNotExist));
        assert_eq!(store.read("notes.txt").await, Err(DfsError::FileDoesNotExist));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn test_plain_store_rejects_paths() {
        let tmp = std::env::temp_dir().join("dfs_test_plain_paths");
        let _ = std::fs::remove_dir_all(&tmp);

        let store = PlainStore::new(&tmp);
        store.init(true).await.unwrap();

        assert_eq!(store.write("../escape", b"x").await, Err(DfsError::Protocol));
        assert_eq!(store.read("a/b").await, Err(DfsError::Protocol));
        assert!(!store.exist("..").await);

        let _ = std::fs::remove_dir_all(&tmp);
    }
}
