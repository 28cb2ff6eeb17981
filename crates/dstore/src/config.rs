//! Dstore configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use dfs_proto::defaults::{
    DEFAULT_CONTROLLER_PORT, DEFAULT_DSTORE_PORT, DEFAULT_MAX_FILE_SIZE, DEFAULT_TIMEOUT_MS,
};

/// Runtime settings for one Dstore.
#[derive(Debug, Clone)]
pub struct DstoreConfig {
    /// Address this Dstore listens on. Its port is the node's identity.
    pub listen_addr: SocketAddr,
    /// The Controller to join.
    pub controller_addr: SocketAddr,
    /// Host other Dstores listen on, for rebalance pushes.
    pub peer_host: IpAddr,
    /// Bound on payload reads and on every request to a peer.
    pub timeout: Duration,
    /// Largest payload accepted; bigger stores are refused before the ack.
    pub max_file_size: u64,
    /// Folder holding the stored files.
    pub folder: PathBuf,
}

impl DstoreConfig {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_DSTORE_PORT),
            controller_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_CONTROLLER_PORT),
            peer_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            folder: folder.into(),
        }
    }
}
