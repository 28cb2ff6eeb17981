//! Dstore daemon state and lifecycle.

use std::sync::Arc;

use dfs_core::net::create_listen_socket;
use dfs_proto::{DfsError, DfsResult, NodeId};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::info;

use crate::config::DstoreConfig;
use crate::link::ControllerLink;
use crate::request;
use crate::store::{FileStore, PlainStore};

/// State every connection task of a running Dstore shares.
pub struct DstoreState {
    pub node: NodeId,
    pub config: DstoreConfig,
    pub store: Arc<dyn FileStore>,
    pub link: ControllerLink,
}

pub type SharedState = Arc<DstoreState>;

/// A Dstore node.
pub struct Dstore {
    config: DstoreConfig,
    store: Arc<dyn FileStore>,
    shutdown: Arc<Notify>,
}

impl Dstore {
    pub fn new(config: DstoreConfig) -> Self {
        let store = Arc::new(PlainStore::new(config.folder.clone()));
        Self::with_store(config, store)
    }

    pub fn with_store(config: DstoreConfig, store: Arc<dyn FileStore>) -> Self {
        Self {
            config,
            store,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    /// Bind the configured address and serve until shut down.
    pub async fn run(&self) -> DfsResult<()> {
        let addr = self.config.listen_addr;
        let listener = create_listen_socket(&addr.ip().to_string(), addr.port()).await?;
        self.serve(listener).await
    }

    /// Clear the folder, join the Controller and serve connections on an
    /// already bound listener. The listener's port is the node's identity.
    pub async fn serve(&self, listener: TcpListener) -> DfsResult<()> {
        let node = NodeId(listener.local_addr().map_err(|_| DfsError::SystemError)?.port());

        self.store.init(true).await?;
        let link = ControllerLink::join(self.config.controller_addr, node).await?;
        let state = Arc::new(DstoreState {
            node,
            config: self.config.clone(),
            store: self.store.clone(),
            link,
        });

        info!(
            "dstore {} serving {} with the {} store",
            node,
            self.config.folder.display(),
            self.store.name()
        );
        request::accept_loop(state, listener, self.shutdown.clone()).await
    }

    /// Stop the accept loop.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}
