//! The Dstore's connection to its Controller.
//!
//! A Dstore joins over one connection and keeps it for the rest of its
//! life: every `STORE_ACK` travels on it.

use std::net::SocketAddr;
use std::sync::Arc;

use dfs_core::net::connect_to_addr;
use dfs_core::Connection;
use dfs_proto::{DfsResult, Message, NodeId};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Shared handle on the join connection.
#[derive(Clone)]
pub struct ControllerLink {
    node: NodeId,
    conn: Arc<Mutex<Connection>>,
}

impl ControllerLink {
    /// Connect to the Controller and announce `node`.
    pub async fn join(controller: SocketAddr, node: NodeId) -> DfsResult<Self> {
        let stream = connect_to_addr(controller).await?;
        stream.set_nodelay(true).ok();
        let mut conn = Connection::new(stream);
        conn.send(&Message::Join(Some(node))).await?;
        info!("joined controller {} as {}", controller, node);
        Ok(Self {
            node,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Tell the Controller this node now holds `filename`.
    pub async fn store_ack(&self, filename: &str) -> DfsResult<()> {
        let msg = Message::StoreAck {
            filename: filename.to_string(),
            node: self.node,
        };
        let result = self.conn.lock().await.send(&msg).await;
        if let Err(e) = result {
            warn!("store: cannot ack {} to controller: {}", filename, e);
        }
        result
    }
}
