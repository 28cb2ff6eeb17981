//! # dfs-proto
//!
//! Protocol types, constants, and data structures for the replicated file
//! store.
//!
//! This crate defines the line protocol, rebalance plans, error types and
//! node identity shared by the Controller, Dstores and clients.

pub mod constants;
pub mod defaults;
pub mod error;
pub mod hash;
pub mod message;
pub mod node;
pub mod plan;

// Re-export commonly used types at the crate root
pub use error::{DfsError, DfsResult};
pub use message::Message;
pub use node::NodeId;
pub use plan::RebalancePlan;
