//! Rebalance orchestration.
//!
//! A round reconciles what every Dstore actually holds with what the
//! Controller believes, and carries out ring membership changes.
//!
//! ## Round
//!
//! 1. **Poll** - snapshot the file records, then `LIST` every registered
//!    node concurrently under one deadline. Nodes that do not answer are
//!    dropped from the registry.
//! 2. **Diff** - listings are compared with the snapshot, never with state
//!    that changed while the poll was out. Lost copies are released, found
//!    copies adopted, and files no record knows of (leftovers of failed
//!    stores, unfinished removes) deleted.
//! 3. **Ring** - on a staged copy of the ring, failed nodes' vnodes are
//!    redistributed and newly joined nodes take their share; every
//!    "vnode now carries file" becomes a push from a holder. The staged
//!    owners are then the expected holders: owners lacking a file get it,
//!    and non-owners drop theirs once every owner holds it.
//! 4. **Dispatch** - one `REBALANCE` plan per source node, all in flight
//!    under one deadline; each completion updates the believed state as it
//!    arrives.
//! 5. **Commit** - the membership changes are applied to the live ring.
//!
//! Rounds are single-flight. A round succeeds when no dispatched plan
//! faulted; callers retry a bounded number of times.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use dfs_core::{AddNodePlan, Connection, HashRing, RemoveNodePlan};
use dfs_proto::{DfsError, DfsResult, Message, NodeId, RebalancePlan};
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, error, info, warn};

use crate::state::{ControllerState, FileStatus, RecordSnapshot};

/// Outcome of one round.
#[derive(Debug, Clone, Default)]
pub struct RebalanceReport {
    /// Nodes that did not answer the listing poll.
    pub failed: Vec<NodeId>,
    /// Nodes added to the ring this round.
    pub joined: Vec<NodeId>,
    /// Vnodes that changed owner.
    pub moved_vnodes: usize,
    /// Nodes whose plan completed.
    pub completed: Vec<NodeId>,
    /// Nodes whose plan failed or timed out.
    pub faulted: Vec<NodeId>,
    /// The round was skipped because the ring is not initialized.
    pub skipped: bool,
}

impl RebalanceReport {
    pub fn is_success(&self) -> bool {
        self.faulted.is_empty()
    }
}

/// Per-node plans under construction for one round.
struct Draft<'a> {
    listings: &'a BTreeMap<NodeId, BTreeSet<String>>,
    plans: BTreeMap<NodeId, RebalancePlan>,
}

impl<'a> Draft<'a> {
    fn new(listings: &'a BTreeMap<NodeId, BTreeSet<String>>) -> Self {
        Self {
            listings,
            plans: BTreeMap::new(),
        }
    }

    fn holds(&self, node: NodeId, file: &str) -> bool {
        self.listings
            .get(&node)
            .map_or(false, |files| files.contains(file))
    }

    fn arriving(&self, file: &str, dest: NodeId) -> bool {
        self.plans
            .values()
            .any(|p| p.sends.get(file).map_or(false, |d| d.contains(&dest)))
    }

    /// First live node holding `file`, other than `exclude`.
    fn source_for(&self, file: &str, exclude: NodeId) -> Option<NodeId> {
        self.listings
            .iter()
            .find(|(node, files)| **node != exclude && files.contains(file))
            .map(|(node, _)| *node)
    }

    /// Schedule `src` to push `file` to `dest`, unless `dest` has or is
    /// already getting it.
    fn push(&mut self, file: &str, src: NodeId, dest: NodeId) {
        if src == dest || self.holds(dest, file) || self.arriving(file, dest) {
            return;
        }
        self.plans.entry(src).or_default().push(file, dest);
    }

    /// Push `file` to `dest` from any live holder.
    fn copy_in(&mut self, file: &str, dest: NodeId) {
        match self.source_for(file, dest) {
            Some(src) => self.push(file, src, dest),
            None if !self.holds(dest, file) => {
                error!("rebalance: no live copy of {} left to copy to {}", file, dest)
            }
            None => {}
        }
    }

    fn delete(&mut self, node: NodeId, file: &str) {
        self.plans.entry(node).or_default().remove(file);
    }

    /// Withdraw pushes of `file` into `dest` from every plan.
    fn cancel_pushes_to(&mut self, file: &str, dest: NodeId) {
        for plan in self.plans.values_mut() {
            plan.cancel_push(file, dest);
        }
    }

    fn into_plans(self) -> BTreeMap<NodeId, RebalancePlan> {
        self.plans.into_iter().filter(|(_, p)| !p.is_empty()).collect()
    }
}

fn names_with(records: &[RecordSnapshot], status: FileStatus) -> HashSet<&str> {
    records
        .iter()
        .filter(|r| r.status == status)
        .map(|r| r.name.as_str())
        .collect()
}

/// Drives rebalance rounds against the shared Controller state.
pub struct Rebalancer {
    state: Arc<ControllerState>,
}

impl Rebalancer {
    pub fn new(state: Arc<ControllerState>) -> Self {
        Self { state }
    }

    /// Run rounds until one succeeds, at most `rebalance_attempts` times.
    pub async fn rebalance(&self, joined: Option<NodeId>) -> bool {
        let attempts = self.state.config.rebalance_attempts.max(1);
        for attempt in 1..=attempts {
            let trigger = if attempt == 1 { joined } else { None };
            match self.run_round(trigger).await {
                Ok(report) if report.is_success() => return true,
                Ok(report) => warn!(
                    "rebalance: attempt {}/{} faulted on {:?}",
                    attempt, attempts, report.faulted
                ),
                Err(e) => error!("rebalance: attempt {}/{} failed: {}", attempt, attempts, e),
            }
        }
        warn!("rebalance: giving up after {} attempts until the next tick", attempts);
        false
    }

    /// Spawn a join-triggered rebalance in the background.
    pub fn trigger_join(self: &Arc<Self>, node: NodeId) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.rebalance(Some(node)).await;
        });
    }

    /// Scheduled rebalancing; never returns.
    pub async fn run_periodic(self: Arc<Self>) {
        let period = self.state.config.rebalance_period;
        loop {
            tokio::time::sleep(period).await;
            self.rebalance(None).await;
        }
    }

    /// One rebalance round. `joined` only labels the round: every
    /// registered node missing from the ring is added.
    pub async fn run_round(&self, joined: Option<NodeId>) -> DfsResult<RebalanceReport> {
        let _guard = self.state.rebalance_lock.lock().await;
        let mut report = RebalanceReport::default();

        if !self.state.ring.read().await.is_initialized() {
            debug!("rebalance: ring not initialized, skipping round");
            report.skipped = true;
            return Ok(report);
        }
        let started = Instant::now();
        match joined {
            Some(node) => info!("rebalance: round starting (join of {})", node),
            None => info!("rebalance: round starting"),
        }

        // 1. Snapshot, then poll. Anything that completes during the poll
        // is left to the next round.
        let records = self.state.snapshot().await;
        let registered = self.state.node_ids();
        let believed_before: BTreeMap<NodeId, BTreeSet<String>> = registered
            .iter()
            .map(|n| (*n, self.state.believed(*n)))
            .collect();
        let listings = self.poll_listings(&registered).await;
        for node in registered.iter().filter(|n| !listings.contains_key(n)) {
            warn!("rebalance: node {} did not answer LIST, dropping it", node);
            self.state.drop_node(*node).await;
            report.failed.push(*node);
        }

        // 2. Diff.
        let complete = names_with(&records, FileStatus::StoreComplete);
        let removing = names_with(&records, FileStatus::RemoveInProgress);
        let in_flight: HashSet<&str> = records
            .iter()
            .filter(|r| r.status != FileStatus::StoreComplete)
            .map(|r| r.name.as_str())
            .collect();

        let mut draft = Draft::new(&listings);

        for name in &removing {
            for (node, files) in &listings {
                if files.contains(*name) {
                    draft.delete(*node, name);
                } else {
                    self.state.release_replica(name, *node).await;
                }
            }
        }

        let nothing = BTreeSet::new();
        for (node, actual) in &listings {
            let believed = believed_before.get(node).unwrap_or(&nothing);
            for name in believed {
                if complete.contains(name.as_str()) && !actual.contains(name) {
                    warn!("rebalance: node {} lost {}", node, name);
                    self.state.release_replica(name, *node).await;
                }
            }
            for name in actual {
                if complete.contains(name.as_str()) {
                    if !believed.contains(name) {
                        debug!("rebalance: node {} holds a copy of {}", node, name);
                        self.state.add_replica(name, *node).await;
                    }
                    continue;
                }
                if in_flight.contains(name.as_str()) || self.state.contains_file(name) {
                    continue;
                }
                debug!("rebalance: node {} holds stray {}", node, name);
                draft.delete(*node, name);
            }
        }

        // 3. Ring membership, staged.
        let mut staged = self.state.ring.read().await.clone();

        let dead: Vec<NodeId> = report
            .failed
            .iter()
            .copied()
            .filter(|n| staged.contains_node(*n))
            .collect();
        let mut remove_plan: Option<RemoveNodePlan> = None;
        if !dead.is_empty() {
            if dead.len() == staged.node_count() {
                warn!("rebalance: every ring node failed, resetting the ring");
                self.state.ring.write().await.reset();
                self.state.clear_files();
                self.state.bootstrap_ring().await?;
                return Ok(report);
            }
            let plan = staged.plan_remove_nodes(&dead)?;
            for (recipient, vids) in &plan.transfers {
                for name in staged.files_of(vids) {
                    if complete.contains(name.as_str()) {
                        draft.copy_in(&name, *recipient);
                    }
                }
            }
            staged.commit_remove_node(&plan)?;
            report.moved_vnodes += plan.moved();
            remove_plan = Some(plan);
        }

        let newcomers: Vec<NodeId> = listings
            .keys()
            .copied()
            .filter(|n| !staged.contains_node(*n))
            .collect();
        let mut add_plans: Vec<AddNodePlan> = Vec::new();
        for node in newcomers {
            let plan = staged.plan_add_node(node)?;
            for (donor, vids) in &plan.transfers {
                for name in staged.files_of(vids) {
                    if !complete.contains(name.as_str()) {
                        continue;
                    }
                    // The donor gives the file up: no repair into it.
                    draft.cancel_pushes_to(&name, *donor);
                    if draft.holds(*donor, &name) {
                        draft.push(&name, *donor, node);
                        draft.delete(*donor, &name);
                    } else {
                        draft.copy_in(&name, node);
                    }
                }
            }
            staged.commit_add_node(&plan)?;
            report.moved_vnodes += plan.moved();
            report.joined.push(node);
            add_plans.push(plan);
        }

        self.repair_placement(&staged, &complete, &mut draft)?;
        self.trim_surplus(&staged, &complete, &mut draft)?;

        // 4. Dispatch.
        let plans = draft.into_plans();
        if !plans.is_empty() {
            self.dispatch(plans, &mut report).await;
        }

        // 5. Commit.
        {
            let mut ring = self.state.ring.write().await;
            if let Some(plan) = &remove_plan {
                ring.commit_remove_node(plan)?;
            }
            for plan in &add_plans {
                ring.commit_add_node(plan)?;
            }
        }

        let elapsed = started.elapsed();
        if report.is_success() {
            info!(
                "rebalance: round complete in {:?} ({} plans, {} vnodes moved)",
                elapsed,
                report.completed.len(),
                report.moved_vnodes
            );
        } else {
            warn!(
                "rebalance: round faulted in {:?} on {:?}",
                elapsed, report.faulted
            );
        }
        Ok(report)
    }

    /// Copy complete files to live ring owners that lack them.
    fn repair_placement(
        &self,
        staged: &HashRing,
        complete: &HashSet<&str>,
        draft: &mut Draft<'_>,
    ) -> DfsResult<()> {
        for name in complete {
            let Some(vids) = staged.placement(name) else {
                continue;
            };
            for owner in staged.owners(vids)? {
                if draft.listings.contains_key(&owner) && !draft.holds(owner, name) {
                    draft.copy_in(name, owner);
                }
            }
        }
        Ok(())
    }

    /// Delete copies held by nodes that do not own the file, once every
    /// owner lists it.
    fn trim_surplus(
        &self,
        staged: &HashRing,
        complete: &HashSet<&str>,
        draft: &mut Draft<'_>,
    ) -> DfsResult<()> {
        for name in complete {
            let Some(vids) = staged.placement(name) else {
                continue;
            };
            let owners = staged.owners(vids)?;
            if !owners.iter().all(|o| draft.holds(*o, name)) {
                continue;
            }
            let surplus: Vec<NodeId> = draft
                .listings
                .iter()
                .filter(|(node, files)| !owners.contains(node) && files.contains(*name))
                .map(|(node, _)| *node)
                .collect();
            for node in surplus {
                debug!("rebalance: node {} no longer owns {}", node, name);
                draft.delete(node, name);
            }
        }
        Ok(())
    }

    /// `LIST` every node; returns the listings of those that answered.
    async fn poll_listings(&self, nodes: &[NodeId]) -> BTreeMap<NodeId, BTreeSet<String>> {
        let deadline = tokio::time::Instant::now() + self.state.config.timeout;
        let mut futs: FuturesUnordered<_> = nodes
            .iter()
            .map(|&node| async move { (node, self.list_node(node).await) })
            .collect();

        let mut listings = BTreeMap::new();
        while let Some((node, result)) = tokio::time::timeout_at(deadline, futs.next())
            .await
            .ok()
            .flatten()
        {
            match result {
                Ok(files) => {
                    listings.insert(node, files);
                }
                Err(e) => debug!("rebalance: LIST to {} failed: {}", node, e),
            }
        }
        listings
    }

    async fn list_node(&self, node: NodeId) -> DfsResult<BTreeSet<String>> {
        let timeout = self.state.config.timeout;
        let mut conn = Connection::open(self.state.config.dstore_host, node, timeout).await?;
        match conn.request(&Message::List(Vec::new()), timeout).await? {
            Message::List(files) => Ok(files.into_iter().collect()),
            other => {
                warn!("rebalance: unexpected reply to LIST from {}: {}", node, other);
                Err(DfsError::Protocol)
            }
        }
    }

    /// Send every plan concurrently and apply completions as they arrive.
    async fn dispatch(&self, plans: BTreeMap<NodeId, RebalancePlan>, report: &mut RebalanceReport) {
        let deadline = tokio::time::Instant::now() + self.state.config.timeout;
        let mut outstanding: BTreeSet<NodeId> = plans.keys().copied().collect();
        let mut futs: FuturesUnordered<_> = plans
            .into_iter()
            .map(|(node, plan)| async move {
                let result = self.send_plan(node, &plan).await;
                (node, plan, result)
            })
            .collect();

        while let Some((node, plan, result)) = tokio::time::timeout_at(deadline, futs.next())
            .await
            .ok()
            .flatten()
        {
            outstanding.remove(&node);
            match result {
                Ok(()) => {
                    self.apply_completion(node, &plan).await;
                    report.completed.push(node);
                }
                Err(e) => {
                    warn!("rebalance: plan for {} faulted: {}", node, e);
                    report.faulted.push(node);
                }
            }
        }
        for node in outstanding {
            warn!("rebalance: plan for {} did not complete in time", node);
            report.faulted.push(node);
        }
    }

    async fn send_plan(&self, node: NodeId, plan: &RebalancePlan) -> DfsResult<()> {
        let timeout = self.state.config.timeout;
        let mut conn = Connection::open(self.state.config.dstore_host, node, timeout).await?;
        debug!("rebalance: REBALANCE {} to {}", plan, node);
        conn.send(&Message::Rebalance(plan.clone())).await?;
        // The round deadline bounds this wait.
        let reply = conn.recv().await?.ok_or(DfsError::PeerUnavailable)?;
        RebalancePlan::check_completion(&reply)
    }

    /// Reflect an executed plan in the believed state.
    async fn apply_completion(&self, source: NodeId, plan: &RebalancePlan) {
        for (name, dests) in &plan.sends {
            for dest in dests {
                self.state.add_replica(name, *dest).await;
            }
        }
        for name in &plan.removes {
            self.state.release_replica(name, source).await;
        }
    }
}
