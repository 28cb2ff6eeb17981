//! Dstore: a storage node of the replicated file store.
//!
//! Holds whole files in one local folder, serves client pushes and fetches,
//! acknowledges stores to the Controller over its join connection, and
//! executes the rebalance plans the Controller sends.

pub mod config;
pub mod daemon;
pub mod link;
pub mod rebalance;
pub mod request;
pub mod store;

pub use config::DstoreConfig;
pub use daemon::Dstore;
pub use store::{FileStore, PlainStore};
