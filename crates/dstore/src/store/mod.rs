//! Storage backend abstraction layer.
//!
//! A Dstore keeps whole files in one local folder, named exactly as the
//! client named them. The [`FileStore`] trait is what the request handler
//! and the rebalance executor talk to.

use async_trait::async_trait;
use dfs_proto::DfsResult;

/// Trait every storage backend implements.
///
/// Methods that touch the filesystem run the I/O in
/// `tokio::task::spawn_blocking`.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Prepare the store. With `clear`, files left from a previous run are
    /// deleted first.
    async fn init(&self, clear: bool) -> DfsResult<()>;

    async fn exist(&self, filename: &str) -> bool;

    /// Write a whole file, replacing any previous content.
    async fn write(&self, filename: &str, data: &[u8]) -> DfsResult<()>;

    /// Read a whole file. `DfsError::FileDoesNotExist` if absent.
    async fn read(&self, filename: &str) -> DfsResult<Vec<u8>>;

    /// Delete a file. `DfsError::FileDoesNotExist` if absent.
    async fn remove(&self, filename: &str) -> DfsResult<()>;

    /// Names of every stored file, sorted.
    async fn list(&self) -> DfsResult<Vec<String>>;
}

pub mod common;
pub mod plain;

pub use plain::PlainStore;
