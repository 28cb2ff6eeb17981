//! Controller configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use dfs_proto::defaults::{
    DEFAULT_CONTROLLER_PORT, DEFAULT_MAX_FILE_SIZE, DEFAULT_REBALANCE_ATTEMPTS,
    DEFAULT_REBALANCE_PERIOD_MS, DEFAULT_REPLICATION, DEFAULT_TIMEOUT_MS, DEFAULT_VNODE_COUNT,
};

/// Runtime settings for one Controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Address client and Dstore connections arrive on.
    pub listen_addr: SocketAddr,
    /// Replica factor R.
    pub replication: usize,
    /// Bound on every quorum wait and every request to a Dstore.
    pub timeout: Duration,
    /// Interval between scheduled rebalance rounds.
    pub rebalance_period: Duration,
    /// Virtual nodes on the hash ring.
    pub vnode_count: usize,
    /// Largest accepted `STORE` size in bytes.
    pub max_file_size: u64,
    /// Host Dstores listen on; nodes are told apart by port.
    pub dstore_host: IpAddr,
    /// Rounds tried per rebalance trigger before giving up until the next tick.
    pub rebalance_attempts: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_CONTROLLER_PORT),
            replication: DEFAULT_REPLICATION,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            rebalance_period: Duration::from_millis(DEFAULT_REBALANCE_PERIOD_MS),
            vnode_count: DEFAULT_VNODE_COUNT,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            dstore_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            rebalance_attempts: DEFAULT_REBALANCE_ATTEMPTS,
        }
    }
}
