//! Protocol-level constants: command tokens and ring geometry.
//!
//! Every command on the wire is one line of space-separated tokens; the
//! first token names the command.

// ─── Membership ─────────────────────────────────────────────────────────────

pub const JOIN: &str = "JOIN";
pub const LIST: &str = "LIST";

// ─── Store ──────────────────────────────────────────────────────────────────

pub const STORE: &str = "STORE";
pub const STORE_TO: &str = "STORE_TO";
pub const ACK: &str = "ACK";
pub const STORE_ACK: &str = "STORE_ACK";
pub const STORE_COMPLETE: &str = "STORE_COMPLETE";

// ─── Load ───────────────────────────────────────────────────────────────────

pub const LOAD: &str = "LOAD";
pub const RELOAD: &str = "RELOAD";
pub const LOAD_FROM: &str = "LOAD_FROM";
pub const LOAD_DATA: &str = "LOAD_DATA";

// ─── Remove ─────────────────────────────────────────────────────────────────

pub const REMOVE: &str = "REMOVE";
pub const REMOVE_ACK: &str = "REMOVE_ACK";
pub const REMOVE_COMPLETE: &str = "REMOVE_COMPLETE";

// ─── Rebalance ──────────────────────────────────────────────────────────────

pub const REBALANCE: &str = "REBALANCE";
pub const REBALANCE_STORE: &str = "REBALANCE_STORE";
pub const REBALANCE_COMPLETE: &str = "REBALANCE_COMPLETE";

// ─── Errors ─────────────────────────────────────────────────────────────────

pub const ERROR_NOT_ENOUGH_DSTORES: &str = "ERROR_NOT_ENOUGH_DSTORES";
pub const ERROR_FILE_ALREADY_EXISTS: &str = "ERROR_FILE_ALREADY_EXISTS";
pub const ERROR_FILE_DOES_NOT_EXIST: &str = "ERROR_FILE_DOES_NOT_EXIST";
pub const ERROR_LOAD: &str = "ERROR_LOAD";

// ─── Ring geometry ──────────────────────────────────────────────────────────

/// Largest ring position. The keyspace is `0..=RING_MAX`.
pub const RING_MAX: u32 = i32::MAX as u32;

/// Per-selection rehash count above which a dispersion warning is logged.
pub const REHASH_WARN_THRESHOLD: u32 = 10;

/// Longest accepted command line (bytes), excluding raw payloads.
pub const MAX_LINE_LEN: usize = 1024 * 1024;
