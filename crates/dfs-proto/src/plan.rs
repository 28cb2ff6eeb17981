//! Rebalance plans: the per-node instruction carried by `REBALANCE`.
//!
//! Wire body, after the `REBALANCE` token:
//!
//! ```text
//! <sendCount> (<file> <k> <port_1> .. <port_k>)* <removeCount> <file>*
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{DfsError, DfsResult};
use crate::message::{validate_filename, Message};
use crate::node::NodeId;

/// Files one Dstore must push to peers, and files it must delete locally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalancePlan {
    /// Filename → destination nodes, in the order they were added.
    pub sends: BTreeMap<String, Vec<NodeId>>,
    /// Filenames to delete after all pushes were attempted.
    pub removes: BTreeSet<String>,
}

impl RebalancePlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a push of `file` to `dest`. Duplicate destinations are ignored.
    pub fn push(&mut self, file: &str, dest: NodeId) {
        let dests = self.sends.entry(file.to_string()).or_default();
        if !dests.contains(&dest) {
            dests.push(dest);
        }
    }

    /// Drop a scheduled push; the file entry goes away with its last destination.
    pub fn cancel_push(&mut self, file: &str, dest: NodeId) -> bool {
        let Some(dests) = self.sends.get_mut(file) else {
            return false;
        };
        let before = dests.len();
        dests.retain(|d| *d != dest);
        let removed = dests.len() != before;
        if dests.is_empty() {
            self.sends.remove(file);
        }
        removed
    }

    /// Schedule a local delete of `file`.
    pub fn remove(&mut self, file: &str) {
        self.removes.insert(file.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.removes.is_empty()
    }

    /// Number of (file, destination) pushes.
    pub fn push_count(&self) -> usize {
        self.sends.values().map(Vec::len).sum()
    }

    /// Render the wire body (everything after the `REBALANCE` token).
    pub fn encode(&self) -> String {
        let mut tokens: Vec<String> = Vec::with_capacity(2 + self.sends.len() * 3 + self.removes.len());
        tokens.push(self.sends.len().to_string());
        for (file, dests) in &self.sends {
            tokens.push(file.clone());
            tokens.push(dests.len().to_string());
            tokens.extend(dests.iter().map(|d| d.to_string()));
        }
        tokens.push(self.removes.len().to_string());
        tokens.extend(self.removes.iter().cloned());
        tokens.join(" ")
    }

    /// Parse the wire body from its tokens.
    ///
    /// Counts must match the tokens present exactly; trailing tokens are a
    /// protocol error.
    pub fn parse(tokens: &[&str]) -> DfsResult<Self> {
        let mut it = tokens.iter().copied();
        let mut plan = RebalancePlan::new();

        let send_count = next_count(&mut it)?;
        for _ in 0..send_count {
            let file = it.next().ok_or(DfsError::Protocol)?;
            validate_filename(file)?;
            let k = next_count(&mut it)?;
            if k == 0 {
                return Err(DfsError::Protocol);
            }
            for _ in 0..k {
                let dest: NodeId = it.next().ok_or(DfsError::Protocol)?.parse()?;
                plan.push(file, dest);
            }
        }

        let remove_count = next_count(&mut it)?;
        for _ in 0..remove_count {
            let file = it.next().ok_or(DfsError::Protocol)?;
            validate_filename(file)?;
            plan.remove(file);
        }

        if it.next().is_some() {
            return Err(DfsError::Protocol);
        }
        Ok(plan)
    }

    /// Interpret a Dstore's reply to this plan.
    ///
    /// Only `REBALANCE_COMPLETE` counts as success; a faulted plan gets no
    /// reply at all, so the caller's timeout covers that case.
    pub fn check_completion(reply: &Message) -> DfsResult<()> {
        match reply {
            Message::RebalanceComplete => Ok(()),
            _ => Err(DfsError::Protocol),
        }
    }
}

impl fmt::Display for RebalancePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn next_count<'a>(it: &mut impl Iterator<Item = &'a str>) -> DfsResult<usize> {
    it.next()
        .ok_or(DfsError::Protocol)?
        .parse::<usize>()
        .map_err(|_| DfsError::Protocol)
}
