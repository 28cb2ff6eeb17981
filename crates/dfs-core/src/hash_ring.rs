//! Consistent hashing with virtual nodes (vnodes) for file placement.
//!
//! The keyspace `0..=RING_MAX` is cut into `vnode_count` contiguous arcs of
//! near-equal width; arc `i` belongs to virtual node `i`. Virtual nodes live
//! in an arena indexed by [`VNodeId`] and are handed out sequentially when
//! the ring is initialized. Each vnode is owned by exactly one real node
//! (a Dstore) and carries the set of files committed onto it.
//!
//! Placement is two-phase: [`HashRing::select_replicas`] is a pure
//! computation, and [`HashRing::commit_placement`] records the result once
//! the Controller has seen a replication quorum. Membership changes follow
//! the same split: `plan_*` computes a transfer of vnodes without touching
//! the ring, `commit_*` applies it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dfs_proto::constants::{REHASH_WARN_THRESHOLD, RING_MAX};
use dfs_proto::hash::{file_hash, rehash, ring_position};
use dfs_proto::{DfsError, DfsResult, NodeId};
use tracing::{debug, error, warn};

/// Probe limit per replica before falling back to a linear walk of the ring.
const MAX_REHASHES: u32 = 4096;

/// Index of a virtual node in the ring's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VNodeId(pub usize);

impl fmt::Display for VNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A virtual node: a fixed arc of the ring.
#[derive(Debug, Clone)]
pub struct VirtualNode {
    id: VNodeId,
    owner: NodeId,
    files: BTreeSet<String>,
}

impl VirtualNode {
    pub fn id(&self) -> VNodeId {
        self.id
    }

    /// Real node currently owning this vnode.
    pub fn owner(&self) -> NodeId {
        self.owner
    }

    /// Files committed onto this vnode.
    pub fn files(&self) -> &BTreeSet<String> {
        &self.files
    }
}

/// Vnodes a node join takes over, keyed by the donating node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddNodePlan {
    pub node: NodeId,
    pub transfers: BTreeMap<NodeId, Vec<VNodeId>>,
}

impl AddNodePlan {
    pub fn moved(&self) -> usize {
        self.transfers.values().map(Vec::len).sum()
    }
}

/// Redistribution of failed nodes' vnodes, keyed by the receiving node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveNodePlan {
    pub dead: Vec<NodeId>,
    pub transfers: BTreeMap<NodeId, Vec<VNodeId>>,
}

impl RemoveNodePlan {
    pub fn moved(&self) -> usize {
        self.transfers.values().map(Vec::len).sum()
    }
}

/// The placement engine.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Configured number of virtual nodes.
    vnode_count: usize,
    /// `arc_ends[i]` is the last ring position covered by vnode `i`.
    arc_ends: Vec<u32>,
    /// Vnode arena; `vnodes[i].id == VNodeId(i)`.
    vnodes: Vec<VirtualNode>,
    /// Real node → owned vnodes.
    nodes: BTreeMap<NodeId, Vec<VNodeId>>,
    /// Filename → vnodes holding it, in selection order.
    placement: HashMap<String, Vec<VNodeId>>,
    /// Total rehashes performed by replica selection (diagnostics only).
    rehashes: Arc<AtomicU64>,
}

impl HashRing {
    /// Create an uninitialized ring with `vnode_count` virtual nodes.
    pub fn new(vnode_count: usize) -> Self {
        Self {
            vnode_count,
            arc_ends: Vec::new(),
            vnodes: Vec::new(),
            nodes: BTreeMap::new(),
            placement: HashMap::new(),
            rehashes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_initialized(&self) -> bool {
        !self.vnodes.is_empty()
    }

    /// Partition the keyspace and hand the vnodes out to `nodes`.
    ///
    /// Arc widths differ by at most one, the wider arcs coming first. Real
    /// nodes receive `vnode_count / n` vnodes each, the first
    /// `vnode_count % n` of them one extra, in the order given.
    pub fn initialize(&mut self, nodes: &[NodeId]) -> DfsResult<()> {
        if self.is_initialized() {
            error!("ring: initialize called on an initialized ring");
            return Err(DfsError::InitializationFault);
        }
        let distinct: HashSet<NodeId> = nodes.iter().copied().collect();
        if nodes.is_empty() || distinct.len() != nodes.len() {
            return Err(DfsError::InitializationFault);
        }
        if self.vnode_count == 0 || self.vnode_count > RING_MAX as usize {
            return Err(DfsError::InitializationFault);
        }

        let arc_ends = build_arcs(self.vnode_count)?;

        let per_node = self.vnode_count / nodes.len();
        let mut extra = self.vnode_count % nodes.len();
        let mut vnodes = Vec::with_capacity(self.vnode_count);
        let mut owned = BTreeMap::new();
        for &node in nodes {
            let mut count = per_node;
            if extra > 0 {
                extra -= 1;
                count += 1;
            }
            let ids: Vec<VNodeId> = (vnodes.len()..vnodes.len() + count).map(VNodeId).collect();
            for &id in &ids {
                vnodes.push(VirtualNode {
                    id,
                    owner: node,
                    files: BTreeSet::new(),
                });
            }
            owned.insert(node, ids);
        }

        self.arc_ends = arc_ends;
        self.vnodes = vnodes;
        self.nodes = owned;
        self.placement.clear();

        debug!(
            "ring: initialized {} vnodes over {} nodes",
            self.vnode_count,
            nodes.len()
        );
        Ok(())
    }

    /// Drop every vnode and placement, returning to the uninitialized state.
    pub fn reset(&mut self) {
        self.arc_ends.clear();
        self.vnodes.clear();
        self.nodes.clear();
        self.placement.clear();
    }

    /// Find the vnode whose arc covers `pos`.
    ///
    /// The arc index is inferred arithmetically, then corrected by a short
    /// forward scan.
    pub fn lookup(&self, pos: u32) -> DfsResult<VNodeId> {
        if !self.is_initialized() {
            return Err(DfsError::ConsistencyFault);
        }
        let width = RING_MAX / self.vnode_count as u32 + 1;
        let mut idx = (pos / width) as usize;
        while idx < self.arc_ends.len() && self.arc_ends[idx] < pos {
            idx += 1;
        }
        if idx >= self.arc_ends.len() {
            error!("ring: position {} past the last arc", pos);
            return Err(DfsError::ConsistencyFault);
        }
        Ok(VNodeId(idx))
    }

    /// Choose `r` vnodes owned by `r` distinct real nodes for `filename`.
    ///
    /// When the vnode found for a probe belongs to a node already chosen,
    /// the hash is re-hashed and the probe repeated. Does not mutate the ring.
    pub fn select_replicas(&self, filename: &str, r: usize) -> DfsResult<Vec<VNodeId>> {
        if !self.is_initialized() || self.nodes.len() < r {
            return Err(DfsError::NotEnoughDstores);
        }

        let mut hval = file_hash(filename);
        let mut chosen: Vec<VNodeId> = Vec::with_capacity(r);
        let mut owners: Vec<NodeId> = Vec::with_capacity(r);

        for _ in 0..r {
            let mut vid = self.lookup(ring_position(hval))?;
            let mut rehashes = 0u32;
            while owners.contains(&self.vnodes[vid.0].owner) {
                if rehashes >= MAX_REHASHES {
                    vid = self.walk_to_unselected(vid, &owners)?;
                    break;
                }
                hval = rehash(hval);
                rehashes += 1;
                vid = self.lookup(ring_position(hval))?;
            }

            if rehashes > REHASH_WARN_THRESHOLD {
                warn!(
                    "ring: {} rehashes placing a replica of {} (poor dispersion?)",
                    rehashes, filename
                );
            }
            self.rehashes.fetch_add(rehashes as u64, Ordering::Relaxed);

            owners.push(self.vnodes[vid.0].owner);
            chosen.push(vid);
        }

        Ok(chosen)
    }

    /// Next vnode clockwise from `from` whose owner is not in `owners`.
    fn walk_to_unselected(&self, from: VNodeId, owners: &[NodeId]) -> DfsResult<VNodeId> {
        (1..=self.vnodes.len())
            .map(|step| VNodeId((from.0 + step) % self.vnodes.len()))
            .find(|v| !owners.contains(&self.vnodes[v.0].owner))
            .ok_or(DfsError::ConsistencyFault)
    }

    /// Record `filename` on the selected vnodes.
    pub fn commit_placement(&mut self, filename: &str, vnodes: &[VNodeId]) -> DfsResult<()> {
        if vnodes.iter().any(|v| v.0 >= self.vnodes.len()) {
            error!("ring: commit of {} names an unknown vnode", filename);
            return Err(DfsError::ConsistencyFault);
        }
        if self.placement.contains_key(filename) {
            warn!("ring: {} was already placed, replacing", filename);
            self.remove_file(filename)?;
        }
        for v in vnodes {
            self.vnodes[v.0].files.insert(filename.to_string());
        }
        self.placement.insert(filename.to_string(), vnodes.to_vec());
        Ok(())
    }

    /// Strip `filename` from its vnodes and the placement index.
    pub fn remove_file(&mut self, filename: &str) -> DfsResult<()> {
        let vnodes = self.placement.remove(filename).ok_or_else(|| {
            error!("ring: remove of unknown file {}", filename);
            DfsError::ConsistencyFault
        })?;
        for v in vnodes {
            self.vnodes[v.0].files.remove(filename);
        }
        Ok(())
    }

    /// Compute the vnodes `new_node` takes over when it joins.
    ///
    /// The new node's share is `vnode_count / (n + 1)`; it is drawn one vnode
    /// at a time from whichever node currently owns the most. Each donor
    /// hands over vnodes from the front of its list, skipping any vnode that
    /// shares a file with a vnode already picked, so no two replicas of a
    /// file end up on the new node.
    pub fn plan_add_node(&self, new_node: NodeId) -> DfsResult<AddNodePlan> {
        if !self.is_initialized() || self.nodes.contains_key(&new_node) {
            return Err(DfsError::ConsistencyFault);
        }

        let share = self.vnode_count / (self.nodes.len() + 1);
        let mut remaining: Vec<(NodeId, usize)> =
            self.nodes.iter().map(|(n, v)| (*n, v.len())).collect();
        let mut give: BTreeMap<NodeId, usize> = BTreeMap::new();
        for _ in 0..share {
            let donor = remaining
                .iter_mut()
                .enumerate()
                .max_by(|(ia, a), (ib, b)| a.1.cmp(&b.1).then(ib.cmp(ia)))
                .map(|(_, entry)| entry)
                .ok_or(DfsError::ConsistencyFault)?;
            if donor.1 == 0 {
                return Err(DfsError::ConsistencyFault);
            }
            donor.1 -= 1;
            *give.entry(donor.0).or_default() += 1;
        }

        let mut picked_files: HashSet<&str> = HashSet::new();
        let mut transfers = BTreeMap::new();
        let mut repicks = 0usize;
        for (donor, count) in give {
            let owned = &self.nodes[&donor];
            let mut taken = Vec::with_capacity(count);
            for &vid in owned {
                if taken.len() == count {
                    break;
                }
                let files = &self.vnodes[vid.0].files;
                if files.iter().any(|f| picked_files.contains(f.as_str())) {
                    repicks += 1;
                    continue;
                }
                picked_files.extend(files.iter().map(String::as_str));
                taken.push(vid);
            }
            if taken.len() < count {
                warn!(
                    "ring: node {} can only give {} of {} vnodes without co-locating replicas",
                    donor,
                    taken.len(),
                    count
                );
            }
            if !taken.is_empty() {
                transfers.insert(donor, taken);
            }
        }

        debug!(
            "ring: add {} plans {} vnode moves (share {}, repicks {})",
            new_node,
            transfers.values().map(Vec::len).sum::<usize>(),
            share,
            repicks
        );
        Ok(AddNodePlan {
            node: new_node,
            transfers,
        })
    }

    /// Hand the planned vnodes over to the new node and register it.
    pub fn commit_add_node(&mut self, plan: &AddNodePlan) -> DfsResult<()> {
        if self.nodes.contains_key(&plan.node) {
            return Err(DfsError::ConsistencyFault);
        }
        for (donor, vids) in &plan.transfers {
            let owned = self.nodes.get(donor).ok_or(DfsError::ConsistencyFault)?;
            if vids.iter().any(|v| !owned.contains(v)) {
                error!("ring: add plan moves a vnode {} does not own", donor);
                return Err(DfsError::ConsistencyFault);
            }
        }

        let mut moved = Vec::new();
        for (donor, vids) in &plan.transfers {
            if let Some(owned) = self.nodes.get_mut(donor) {
                owned.retain(|v| !vids.contains(v));
            }
            moved.extend_from_slice(vids);
        }
        for v in &moved {
            self.vnodes[v.0].owner = plan.node;
        }
        moved.sort();
        self.nodes.insert(plan.node, moved);
        Ok(())
    }

    /// Single-node form of [`HashRing::plan_remove_nodes`].
    pub fn plan_remove_node(&self, dead: NodeId) -> DfsResult<RemoveNodePlan> {
        self.plan_remove_nodes(&[dead])
    }

    /// Distribute the vnodes of `dead` nodes among the survivors.
    ///
    /// Survivors are topped up towards the post-removal average. A vnode is
    /// given to the next survivor (round robin) with spare share that does
    /// not already hold, or receive, one of its files. A vnode no such
    /// survivor can take is deferred once to the back of the queue; on its
    /// second turn it goes to any survivor free of its files regardless of
    /// share, and only when every survivor collides is it placed on a
    /// colliding one. This is a heuristic, not an optimal assignment.
    pub fn plan_remove_nodes(&self, dead: &[NodeId]) -> DfsResult<RemoveNodePlan> {
        if !self.is_initialized() {
            return Err(DfsError::ConsistencyFault);
        }
        for node in dead {
            if !self.nodes.contains_key(node) {
                error!("ring: cannot remove unknown node {}", node);
                return Err(DfsError::ConsistencyFault);
            }
        }
        let survivors: Vec<NodeId> = self
            .nodes
            .keys()
            .filter(|n| !dead.contains(n))
            .copied()
            .collect();
        if survivors.is_empty() {
            return Err(DfsError::ConsistencyFault);
        }

        let mut waiting: VecDeque<VNodeId> = dead
            .iter()
            .flat_map(|n| self.nodes[n].iter().copied())
            .collect();

        // Fair share: each slot goes to the survivor with the smallest load.
        let mut load: Vec<usize> = survivors.iter().map(|n| self.nodes[n].len()).collect();
        let mut capacity = vec![0usize; survivors.len()];
        for _ in 0..waiting.len() {
            let i = (0..survivors.len())
                .min_by_key(|&i| (load[i], i))
                .ok_or(DfsError::ConsistencyFault)?;
            load[i] += 1;
            capacity[i] += 1;
        }

        // Files each survivor holds now or is planned to receive.
        let mut held: Vec<HashSet<&str>> = survivors
            .iter()
            .map(|n| {
                self.nodes[n]
                    .iter()
                    .flat_map(|v| self.vnodes[v.0].files.iter().map(String::as_str))
                    .collect()
            })
            .collect();

        let mut assigned: Vec<Vec<VNodeId>> = vec![Vec::new(); survivors.len()];
        let mut deferred: HashSet<VNodeId> = HashSet::new();
        let mut cursor = 0usize;
        let mut repicks = 0usize;
        let n = survivors.len();

        while let Some(vid) = waiting.pop_front() {
            let files = &self.vnodes[vid.0].files;
            let collides =
                |held: &HashSet<&str>| files.iter().any(|f| held.contains(f.as_str()));
            let ring_order = |cursor: usize| (0..n).map(move |k| (cursor + k) % n);

            let target = match ring_order(cursor).find(|&i| capacity[i] > 0 && !collides(&held[i])) {
                Some(i) => i,
                None if !deferred.contains(&vid) => {
                    deferred.insert(vid);
                    waiting.push_back(vid);
                    repicks += 1;
                    continue;
                }
                None => match ring_order(cursor).find(|&i| !collides(&held[i])) {
                    Some(i) => i,
                    None => {
                        warn!(
                            "ring: vnode {} collides with every survivor, co-locating replicas",
                            vid
                        );
                        ring_order(cursor)
                            .max_by_key(|&i| (capacity[i], n - i))
                            .ok_or(DfsError::ConsistencyFault)?
                    }
                },
            };

            capacity[target] = capacity[target].saturating_sub(1);
            held[target].extend(files.iter().map(String::as_str));
            assigned[target].push(vid);
            cursor = (target + 1) % n;
        }

        let transfers: BTreeMap<NodeId, Vec<VNodeId>> = survivors
            .into_iter()
            .zip(assigned)
            .filter(|(_, v)| !v.is_empty())
            .collect();

        debug!(
            "ring: removal of {:?} plans {} vnode moves (repicks {})",
            dead,
            transfers.values().map(Vec::len).sum::<usize>(),
            repicks
        );
        Ok(RemoveNodePlan {
            dead: dead.to_vec(),
            transfers,
        })
    }

    /// Apply a removal plan: reassign every dead node's vnode, then drop the
    /// dead nodes from the registry.
    pub fn commit_remove_node(&mut self, plan: &RemoveNodePlan) -> DfsResult<()> {
        let mut orphaned: BTreeSet<VNodeId> = BTreeSet::new();
        for node in &plan.dead {
            let owned = self.nodes.get(node).ok_or(DfsError::ConsistencyFault)?;
            orphaned.extend(owned.iter().copied());
        }
        let mut covered: BTreeSet<VNodeId> = BTreeSet::new();
        for (target, vids) in &plan.transfers {
            if plan.dead.contains(target) || !self.nodes.contains_key(target) {
                return Err(DfsError::ConsistencyFault);
            }
            for v in vids {
                if !orphaned.contains(v) || !covered.insert(*v) {
                    error!("ring: removal plan moves {} twice or from a live node", v);
                    return Err(DfsError::ConsistencyFault);
                }
            }
        }
        if covered != orphaned {
            error!(
                "ring: removal plan covers {} of {} orphaned vnodes",
                covered.len(),
                orphaned.len()
            );
            return Err(DfsError::ConsistencyFault);
        }

        for (target, vids) in &plan.transfers {
            for v in vids {
                self.vnodes[v.0].owner = *target;
            }
            if let Some(owned) = self.nodes.get_mut(target) {
                owned.extend_from_slice(vids);
                owned.sort();
            }
        }
        for node in &plan.dead {
            self.nodes.remove(node);
        }
        Ok(())
    }

    /// Files the ring places on `node`, or `None` for an unknown node.
    pub fn node_files(&self, node: NodeId) -> Option<BTreeSet<String>> {
        self.nodes.get(&node).map(|vids| self.files_of(vids))
    }

    /// Files placed on every real node.
    pub fn files_by_node(&self) -> BTreeMap<NodeId, BTreeSet<String>> {
        self.nodes
            .iter()
            .map(|(node, vids)| (*node, self.files_of(vids)))
            .collect()
    }

    /// Union of the files carried by `vids`.
    pub fn files_of(&self, vids: &[VNodeId]) -> BTreeSet<String> {
        vids.iter()
            .filter_map(|v| self.vnodes.get(v.0))
            .flat_map(|v| v.files.iter().cloned())
            .collect()
    }

    pub fn vnode(&self, id: VNodeId) -> Option<&VirtualNode> {
        self.vnodes.get(id.0)
    }

    pub fn owner(&self, id: VNodeId) -> Option<NodeId> {
        self.vnodes.get(id.0).map(|v| v.owner)
    }

    /// Owners of `vids`, in order.
    pub fn owners(&self, vids: &[VNodeId]) -> DfsResult<Vec<NodeId>> {
        vids.iter()
            .map(|v| self.owner(*v).ok_or(DfsError::ConsistencyFault))
            .collect()
    }

    pub fn vnodes_of(&self, node: NodeId) -> Option<&[VNodeId]> {
        self.nodes.get(&node).map(Vec::as_slice)
    }

    pub fn placement(&self, filename: &str) -> Option<&[VNodeId]> {
        self.placement.get(filename).map(Vec::as_slice)
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    pub fn vnode_count(&self) -> usize {
        self.vnode_count
    }

    pub fn file_count(&self) -> usize {
        self.placement.len()
    }

    /// Cumulative rehash count across all selections.
    pub fn rehash_total(&self) -> u64 {
        self.rehashes.load(Ordering::Relaxed)
    }

    /// Verify the structural invariants of an initialized ring.
    pub fn check_invariants(&self) -> DfsResult<()> {
        if !self.is_initialized() {
            return Ok(());
        }
        if self.arc_ends.len() != self.vnode_count
            || self.arc_ends.last() != Some(&RING_MAX)
            || self.arc_ends.windows(2).any(|w| w[0] >= w[1])
        {
            return Err(DfsError::ConsistencyFault);
        }

        let mut seen = vec![false; self.vnodes.len()];
        for (node, vids) in &self.nodes {
            for v in vids {
                let slot = seen.get_mut(v.0).ok_or(DfsError::ConsistencyFault)?;
                if *slot || self.vnodes[v.0].owner != *node {
                    return Err(DfsError::ConsistencyFault);
                }
                *slot = true;
            }
        }
        if seen.iter().any(|s| !s) {
            return Err(DfsError::ConsistencyFault);
        }

        for (file, vids) in &self.placement {
            if vids.iter().any(|v| !self.vnodes[v.0].files.contains(file)) {
                return Err(DfsError::ConsistencyFault);
            }
        }
        Ok(())
    }
}

/// Arc end positions for `count` arcs covering `0..=RING_MAX` exactly.
fn build_arcs(count: usize) -> DfsResult<Vec<u32>> {
    let max = RING_MAX as i64;
    let count_i = count as i64;
    let mut interval = max / count_i;
    let mut remainder = max % count_i + 1;
    if remainder == count_i {
        remainder = 0;
        interval += 1;
    }

    let mut ends = Vec::with_capacity(count);
    let mut base: i64 = -1;
    for i in 0..count_i {
        base += interval;
        if remainder > i {
            base += 1;
        }
        ends.push(base as u32);
    }
    if base != max {
        error!("ring: arcs end at {} instead of {}", base, max);
        return Err(DfsError::InitializationFault);
    }
    Ok(ends)
}
