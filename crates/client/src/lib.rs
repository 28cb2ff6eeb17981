//! Client library for the replicated file store.
//!
//! A [`Client`] keeps one connection to the Controller for its control
//! traffic and opens short-lived connections to Dstores for file bytes.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use dfs_core::net::connect_to_addr;
use dfs_core::Connection;
use dfs_proto::defaults::{DEFAULT_CONTROLLER_PORT, DEFAULT_TIMEOUT_MS};
use dfs_proto::message::validate_filename;
use dfs_proto::{DfsError, DfsResult, Message, NodeId};
use tracing::{debug, info, warn};

/// Where the cluster is and how long to wait on it.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub controller_addr: SocketAddr,
    /// Host the Dstores listen on.
    pub dstore_host: IpAddr,
    /// Bound on every reply, payload transfer and Dstore connect.
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            controller_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_CONTROLLER_PORT),
            dstore_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

/// A connected client.
pub struct Client {
    config: ClientConfig,
    conn: Connection,
}

impl Client {
    pub async fn connect(config: ClientConfig) -> DfsResult<Self> {
        let stream = connect_to_addr(config.controller_addr).await?;
        stream.set_nodelay(true).ok();
        debug!("connected to controller {}", config.controller_addr);
        Ok(Self {
            config,
            conn: Connection::new(stream),
        })
    }

    /// Send `msg` to the Controller and return its reply, turning error
    /// tokens into their [`DfsError`].
    async fn request(&mut self, msg: &Message) -> DfsResult<Message> {
        let reply = self.conn.request(msg, self.config.timeout).await?;
        match reply.as_error() {
            Some(e) => Err(e),
            None => Ok(reply),
        }
    }

    async fn reply(&mut self) -> DfsResult<Message> {
        let reply = self.conn.recv_timeout(self.config.timeout).await?;
        match reply.as_error() {
            Some(e) => Err(e),
            None => Ok(reply),
        }
    }

    /// Names of every stored file.
    pub async fn list(&mut self) -> DfsResult<Vec<String>> {
        match self.request(&Message::List(Vec::new())).await? {
            Message::List(files) => Ok(files),
            other => Err(unexpected(&other)),
        }
    }

    /// Store `data` as `filename` on the replicas the Controller picks.
    /// Returns the nodes the file was pushed to.
    pub async fn store(&mut self, filename: &str, data: &[u8]) -> DfsResult<Vec<NodeId>> {
        validate_filename(filename)?;
        let request = Message::Store {
            filename: filename.to_string(),
            size: data.len() as u64,
        };
        let targets = match self.request(&request).await? {
            Message::StoreTo(targets) => targets,
            other => return Err(unexpected(&other)),
        };
        debug!("store: {} goes to {:?}", filename, targets);

        for &node in &targets {
            if let Err(e) = self.push(node, filename, data).await {
                // The Controller's quorum wait decides the outcome.
                warn!("store: push of {} to {} failed: {}", filename, node, e);
            }
        }

        match self.reply().await? {
            Message::StoreComplete => {
                info!("store: {} complete", filename);
                Ok(targets)
            }
            other => Err(unexpected(&other)),
        }
    }

    async fn push(&self, node: NodeId, filename: &str, data: &[u8]) -> DfsResult<()> {
        let timeout = self.config.timeout;
        let mut conn = Connection::open(self.config.dstore_host, node, timeout).await?;
        let request = Message::Store {
            filename: filename.to_string(),
            size: data.len() as u64,
        };
        match conn.request(&request, timeout).await? {
            Message::Ack => conn.write_payload(data).await,
            other => Err(unexpected(&other)),
        }
    }

    /// Fetch `filename`, falling back to the remaining replicas when a
    /// Dstore fails to deliver.
    pub async fn load(&mut self, filename: &str) -> DfsResult<Vec<u8>> {
        validate_filename(filename)?;
        let mut request = Message::Load {
            filename: filename.to_string(),
        };
        loop {
            let (node, size) = match self.request(&request).await? {
                Message::LoadFrom { node, size } => (node, size),
                other => return Err(unexpected(&other)),
            };
            match self.fetch(node, filename, size).await {
                Ok(data) => return Ok(data),
                Err(e) => warn!("load: {} from {} failed: {}, trying another", filename, node, e),
            }
            request = Message::Reload {
                filename: filename.to_string(),
            };
        }
    }

    async fn fetch(&self, node: NodeId, filename: &str, size: u64) -> DfsResult<Vec<u8>> {
        let timeout = self.config.timeout;
        let mut conn = Connection::open(self.config.dstore_host, node, timeout).await?;
        conn.send(&Message::LoadData {
            filename: filename.to_string(),
        })
        .await?;
        conn.read_payload_timeout(size, timeout).await
    }

    /// Remove `filename` from every replica.
    pub async fn remove(&mut self, filename: &str) -> DfsResult<()> {
        validate_filename(filename)?;
        let request = Message::Remove {
            filename: filename.to_string(),
        };
        match self.request(&request).await? {
            Message::RemoveComplete => {
                info!("remove: {} complete", filename);
                Ok(())
            }
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(msg: &Message) -> DfsError {
    warn!("unexpected reply {}", msg);
    DfsError::Protocol
}
