//! Controller daemon library: node registry, file metadata, quorum
//! store/remove handling and rebalancing over the hash ring.

pub mod config;
pub mod handler;
pub mod rebalance;
pub mod state;

pub use config::ControllerConfig;
pub use handler::Controller;
pub use rebalance::{RebalanceReport, Rebalancer};
pub use state::{ControllerState, FileStatus};
