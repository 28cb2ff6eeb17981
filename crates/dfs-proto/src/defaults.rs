//! Tunable operational defaults.
//!
//! Protocol-level constants (tokens, ring geometry) remain in
//! [`crate::constants`]. This module centralizes the configurable defaults
//! that can be overridden via CLI flags.

// ─── Network / Port Defaults ────────────────────────────────────────────────

/// Default Controller listen port.
pub const DEFAULT_CONTROLLER_PORT: u16 = 12345;

/// Default Dstore listen port.
pub const DEFAULT_DSTORE_PORT: u16 = 12346;

/// Host the Controller uses to reach Dstores, and Dstores use to reach
/// peers. Real nodes are identified by port alone.
pub const DEFAULT_NODE_HOST: &str = "127.0.0.1";

// ─── Replication ────────────────────────────────────────────────────────────

/// Default replica factor R.
pub const DEFAULT_REPLICATION: usize = 3;

/// Default per-operation timeout (milliseconds).
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Default maximum accepted file size (bytes).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100_000;

// ─── Placement ──────────────────────────────────────────────────────────────

/// Default number of virtual nodes on the hash ring.
pub const DEFAULT_VNODE_COUNT: usize = 10_000;

// ─── Rebalance ──────────────────────────────────────────────────────────────

/// Default interval between scheduled rebalance rounds (milliseconds).
pub const DEFAULT_REBALANCE_PERIOD_MS: u64 = 30_000;

/// Attempts per scheduled tick before a round is given up until the next tick.
pub const DEFAULT_REBALANCE_ATTEMPTS: u32 = 5;
