//! # dfs-core
//!
//! Core shared library for the replicated file store.
//! Provides the consistent-hash placement engine, async TCP helpers and the
//! line-framed connection used by every component.

pub mod connection;
pub mod hash_ring;
pub mod net;

pub use connection::Connection;
pub use hash_ring::{AddNodePlan, HashRing, RemoveNodePlan, VNodeId, VirtualNode};
