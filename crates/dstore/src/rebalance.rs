//! Rebalance executor: carries out one `REBALANCE` plan on this node.
//!
//! Every push runs concurrently under a single deadline. Deletes follow
//! once all pushes have settled, and skip any file whose push faulted so
//! the only copy of a file is never dropped.

use std::collections::BTreeSet;

use dfs_core::Connection;
use dfs_proto::{DfsError, DfsResult, Message, NodeId, RebalancePlan};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::daemon::DstoreState;

/// What happened to one plan.
#[derive(Debug, Default)]
pub struct RebalanceOutcome {
    pub pushed: usize,
    pub removed: usize,
    /// Files with at least one failed push or delete.
    pub faulted: BTreeSet<String>,
}

impl RebalanceOutcome {
    /// Whether `REBALANCE_COMPLETE` may be sent.
    pub fn is_complete(&self) -> bool {
        self.faulted.is_empty()
    }
}

/// Execute `plan` against the local store and the peers it names.
pub async fn execute(state: &DstoreState, plan: &RebalancePlan) -> RebalanceOutcome {
    let mut outcome = RebalanceOutcome::default();
    debug!(
        "rebalance: plan with {} pushes, {} removes",
        plan.push_count(),
        plan.removes.len()
    );

    let deadline = Instant::now() + state.config.timeout;
    let mut pushes = FuturesUnordered::new();
    for (filename, dests) in &plan.sends {
        let data = match state.store.read(filename).await {
            Ok(data) => data,
            Err(e) => {
                warn!("rebalance: cannot read {} to push: {}", filename, e);
                outcome.faulted.insert(filename.clone());
                continue;
            }
        };
        for &dest in dests {
            let data = data.clone();
            pushes.push(async move {
                let result = push_file(state, dest, filename, &data).await;
                (filename, dest, result)
            });
        }
    }

    let mut pending = pushes.len();
    while let Some((filename, dest, result)) =
        tokio::time::timeout_at(deadline, pushes.next()).await.ok().flatten()
    {
        pending -= 1;
        match result {
            Ok(()) => {
                outcome.pushed += 1;
                debug!("rebalance: pushed {} to {}", filename, dest);
            }
            Err(e) => {
                warn!("rebalance: push of {} to {} failed: {}", filename, dest, e);
                outcome.faulted.insert(filename.clone());
            }
        }
    }
    if pending > 0 {
        warn!("rebalance: {} pushes still pending at the deadline", pending);
        // Which ones is unknown once the stream is dropped; fault every pushed file.
        outcome.faulted.extend(plan.sends.keys().cloned());
    }
    drop(pushes);

    for filename in &plan.removes {
        if outcome.faulted.contains(filename) {
            warn!("rebalance: keeping {} after its push faulted", filename);
            continue;
        }
        match state.store.remove(filename).await {
            Ok(()) | Err(DfsError::FileDoesNotExist) => outcome.removed += 1,
            Err(e) => {
                warn!("rebalance: cannot delete {}: {}", filename, e);
                outcome.faulted.insert(filename.clone());
            }
        }
    }

    info!(
        "rebalance: {} pushed, {} removed, {} faulted",
        outcome.pushed,
        outcome.removed,
        outcome.faulted.len()
    );
    outcome
}

/// `REBALANCE_STORE` one file to `dest`: wait for `ACK`, then send the bytes.
async fn push_file(
    state: &DstoreState,
    dest: NodeId,
    filename: &str,
    data: &[u8],
) -> DfsResult<()> {
    let timeout = state.config.timeout;
    let mut conn = Connection::open(state.config.peer_host, dest, timeout).await?;
    let request = Message::RebalanceStore {
        filename: filename.to_string(),
        size: data.len() as u64,
    };
    match conn.request(&request, timeout).await? {
        Message::Ack => conn.write_payload(data).await,
        other => {
            warn!("rebalance: {} answered {} instead of ACK", dest, other);
            Err(DfsError::Protocol)
        }
    }
}
