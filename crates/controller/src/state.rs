//! Controller state: live-node registry, file metadata records and the ring.
//!
//! Lock order is record → ring. Nothing holds the ring lock while waiting on
//! a record, and no DashMap guard is held across an `.await`.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dfs_core::{HashRing, VNodeId};
use dfs_proto::{DfsResult, NodeId};
use tokio::sync::{oneshot, Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info};

use crate::config::ControllerConfig;

/// Lifecycle of one filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    StoreInProgress,
    StoreComplete,
    RemoveInProgress,
    RemoveComplete,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileStatus::StoreInProgress => write!(f, "store_in_progress"),
            FileStatus::StoreComplete => write!(f, "store_complete"),
            FileStatus::RemoveInProgress => write!(f, "remove_in_progress"),
            FileStatus::RemoveComplete => write!(f, "remove_complete"),
        }
    }
}

/// Mutable part of a [`FileRecord`], guarded by the record lock.
#[derive(Debug)]
pub struct FileState {
    pub size: u64,
    pub status: FileStatus,
    /// Nodes the client was told to push to.
    pub targets: Vec<NodeId>,
    /// Ring selection backing `targets`, committed at quorum.
    pub vnodes: Vec<VNodeId>,
    /// Confirmed replicas, in acknowledgement order. While a remove is in
    /// progress, the replicas still to confirm deletion.
    pub replicas: Vec<NodeId>,
    waiter: Option<oneshot::Sender<()>>,
}

/// What one store acknowledgement amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAck {
    /// Not from a pending target of a waiting store.
    Ignored,
    Counted,
    /// The ack that reached the replication factor.
    Quorum,
}

impl FileState {
    /// Count a store acknowledgement from `node`.
    ///
    /// Yields [`StoreAck::Quorum`] exactly once: when `r` distinct target
    /// nodes have acked and the initiating store is still waiting.
    pub fn ack_store(&mut self, node: NodeId, r: usize) -> StoreAck {
        if self.status != FileStatus::StoreInProgress
            || self.waiter.is_none()
            || !self.targets.contains(&node)
            || self.replicas.contains(&node)
        {
            return StoreAck::Ignored;
        }
        self.replicas.push(node);
        if self.replicas.len() >= r {
            StoreAck::Quorum
        } else {
            StoreAck::Counted
        }
    }

    /// Flip to `STORE_COMPLETE` and wake the waiter.
    pub fn complete_store(&mut self) {
        self.status = FileStatus::StoreComplete;
        if let Some(tx) = self.waiter.take() {
            let _ = tx.send(());
        }
    }

    /// Enter `REMOVE_IN_PROGRESS`, returning the completion receiver.
    pub fn begin_remove(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.status = FileStatus::RemoveInProgress;
        self.waiter = Some(tx);
        rx
    }

    /// Drop `node` from the replicas still holding a file being removed.
    pub fn ack_remove(&mut self, node: NodeId) {
        if self.status == FileStatus::RemoveInProgress {
            self.replicas.retain(|n| *n != node);
        }
    }

    /// Whether a remove is in progress and every replica confirmed.
    pub fn remove_drained(&self) -> bool {
        self.status == FileStatus::RemoveInProgress && self.replicas.is_empty()
    }

    /// Flip to `REMOVE_COMPLETE` and wake the waiter, if any.
    pub fn complete_remove(&mut self) {
        self.status = FileStatus::RemoveComplete;
        if let Some(tx) = self.waiter.take() {
            let _ = tx.send(());
        }
    }

    /// Stop waiting: called by an initiator whose wait timed out. Returns
    /// the status observed under the lock, so a completion that raced the
    /// timeout is not lost.
    pub fn abandon(&mut self) -> FileStatus {
        self.waiter = None;
        self.status
    }
}

/// Per-file metadata owned by the Controller.
#[derive(Debug)]
pub struct FileRecord {
    name: String,
    state: Mutex<FileState>,
}

impl FileRecord {
    /// A record in `STORE_IN_PROGRESS`, plus the receiver its store awaits.
    pub fn new_store(
        name: &str,
        size: u64,
        targets: Vec<NodeId>,
        vnodes: Vec<VNodeId>,
    ) -> (Arc<Self>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let record = Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(FileState {
                size,
                status: FileStatus::StoreInProgress,
                targets,
                vnodes,
                replicas: Vec::new(),
                waiter: Some(tx),
            }),
        });
        (record, rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().await
    }
}

/// Point-in-time view of one record, taken for rebalance planning.
#[derive(Debug, Clone)]
pub struct RecordSnapshot {
    pub name: String,
    pub status: FileStatus,
    pub replicas: Vec<NodeId>,
}

/// A registered Dstore.
#[derive(Debug, Default)]
pub struct NodeEntry {
    /// Files the Controller believes this node holds.
    pub files: BTreeSet<String>,
}

/// State shared by every connection task and the rebalancer.
pub struct ControllerState {
    pub config: ControllerConfig,
    nodes: DashMap<NodeId, NodeEntry>,
    files: DashMap<String, Arc<FileRecord>>,
    pub ring: RwLock<HashRing>,
    /// Held for the whole of a rebalance round.
    pub rebalance_lock: Mutex<()>,
}

impl ControllerState {
    pub fn new(config: ControllerConfig) -> Self {
        let ring = HashRing::new(config.vnode_count);
        Self {
            config,
            nodes: DashMap::new(),
            files: DashMap::new(),
            ring: RwLock::new(ring),
            rebalance_lock: Mutex::new(()),
        }
    }

    // ─── Registry ────────────────────────────────────────────────────────

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn has_quorum(&self) -> bool {
        self.nodes.len() >= self.config.replication
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub fn is_registered(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    /// Register `node` with an empty believed file set. A node already
    /// registered keeps its set; returns false in that case.
    pub fn register_node(&self, node: NodeId) -> bool {
        match self.nodes.entry(node) {
            Entry::Occupied(_) => false,
            Entry::Vacant(e) => {
                e.insert(NodeEntry::default());
                true
            }
        }
    }

    /// Files the Controller believes `node` holds.
    pub fn believed(&self, node: NodeId) -> BTreeSet<String> {
        self.nodes
            .get(&node)
            .map(|e| e.files.clone())
            .unwrap_or_default()
    }

    pub fn believe_file(&self, node: NodeId, filename: &str) {
        if let Some(mut entry) = self.nodes.get_mut(&node) {
            entry.files.insert(filename.to_string());
        }
    }

    pub fn forget_file(&self, node: NodeId, filename: &str) {
        if let Some(mut entry) = self.nodes.get_mut(&node) {
            entry.files.remove(filename);
        }
    }

    /// Drop a failed node from the registry and from every record's
    /// replica set. Removes waiting only on this node complete.
    pub async fn drop_node(&self, node: NodeId) {
        if self.nodes.remove(&node).is_none() {
            return;
        }
        info!("node {} removed from registry", node);
        for record in self.records() {
            let mut state = record.lock().await;
            match state.status {
                FileStatus::RemoveInProgress => {
                    state.ack_remove(node);
                    self.settle_remove(&record, &mut state).await;
                }
                _ => state.replicas.retain(|n| *n != node),
            }
        }
    }

    // ─── File records ────────────────────────────────────────────────────

    pub fn file(&self, name: &str) -> Option<Arc<FileRecord>> {
        self.files.get(name).map(|r| Arc::clone(r.value()))
    }

    pub fn contains_file(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    pub fn records(&self) -> Vec<Arc<FileRecord>> {
        self.files.iter().map(|r| Arc::clone(r.value())).collect()
    }

    /// Insert a new record unless the name is taken. Check and insert are
    /// one step, so concurrent stores of a name cannot both succeed.
    pub fn insert_record(&self, record: Arc<FileRecord>) -> bool {
        match self.files.entry(record.name().to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(e) => {
                e.insert(record);
                true
            }
        }
    }

    /// Remove `record` from the map if it is still the one registered.
    pub fn discard_record(&self, record: &Arc<FileRecord>) {
        self.files
            .remove_if(record.name(), |_, current| Arc::ptr_eq(current, record));
    }

    /// Status and replicas of every record.
    pub async fn snapshot(&self) -> Vec<RecordSnapshot> {
        let mut out = Vec::new();
        for record in self.records() {
            let state = record.lock().await;
            out.push(RecordSnapshot {
                name: record.name().to_string(),
                status: state.status,
                replicas: state.replicas.clone(),
            });
        }
        out
    }

    /// Names of every file in `STORE_COMPLETE`, sorted.
    pub async fn complete_files(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|s| s.status == FileStatus::StoreComplete)
            .map(|s| s.name)
            .collect();
        names.sort();
        names
    }

    // ─── Acknowledgements ────────────────────────────────────────────────

    /// Deliver `STORE_ACK filename node`.
    ///
    /// The quorum-reaching ack commits the placement into the ring before
    /// waking the waiting store, so a completed file is always placed.
    pub async fn store_ack(&self, filename: &str, node: NodeId) {
        let Some(record) = self.file(filename) else {
            debug!("store: ack for unknown file {} from {}", filename, node);
            return;
        };
        let mut state = record.lock().await;
        match state.ack_store(node, self.config.replication) {
            StoreAck::Ignored => {
                debug!("store: ignoring ack for {} from {}", filename, node);
                return;
            }
            StoreAck::Counted => {
                self.believe_file(node, filename);
                return;
            }
            StoreAck::Quorum => self.believe_file(node, filename),
        }
        let committed = self
            .ring
            .write()
            .await
            .commit_placement(filename, &state.vnodes);
        match committed {
            Ok(()) => {
                state.complete_store();
                debug!("store: {} reached quorum on {:?}", filename, state.replicas);
            }
            Err(e) => error!("store: cannot place {}: {}", filename, e),
        }
    }

    /// Record that `node` no longer holds `filename`.
    ///
    /// For a file being removed this is a deletion confirmation; the last
    /// one completes the remove. Returns true if it did.
    pub async fn release_replica(&self, filename: &str, node: NodeId) -> bool {
        self.forget_file(node, filename);
        let Some(record) = self.file(filename) else {
            return false;
        };
        let mut state = record.lock().await;
        match state.status {
            FileStatus::RemoveInProgress => {
                state.ack_remove(node);
                self.settle_remove(&record, &mut state).await
            }
            _ => {
                state.replicas.retain(|n| *n != node);
                false
            }
        }
    }

    /// Record that `node` now holds a copy of `filename`.
    pub async fn add_replica(&self, filename: &str, node: NodeId) {
        let Some(record) = self.file(filename) else {
            return;
        };
        let mut state = record.lock().await;
        if state.status != FileStatus::StoreComplete {
            return;
        }
        if !state.replicas.contains(&node) {
            state.replicas.push(node);
        }
        self.believe_file(node, filename);
    }

    /// Forget every file: records, believed sets and ring placement are
    /// dropped together when the ring is reset.
    pub fn clear_files(&self) {
        self.files.clear();
        for mut entry in self.nodes.iter_mut() {
            entry.files.clear();
        }
    }

    /// Initialize the ring over every registered node once there are at
    /// least R of them. Returns true if this call initialized it.
    pub async fn bootstrap_ring(&self) -> DfsResult<bool> {
        let mut ring = self.ring.write().await;
        if ring.is_initialized() || !self.has_quorum() {
            return Ok(false);
        }
        let nodes = self.node_ids();
        ring.initialize(&nodes)?;
        info!("ring initialized over {:?}", nodes);
        Ok(true)
    }

    /// Complete a drained remove: strip the file from the ring, wake the
    /// waiter and retire the record.
    async fn settle_remove(&self, record: &Arc<FileRecord>, state: &mut FileState) -> bool {
        if !state.remove_drained() {
            return false;
        }
        if let Err(e) = self.ring.write().await.remove_file(record.name()) {
            error!("remove: ring has no placement for {}: {}", record.name(), e);
        }
        state.complete_remove();
        self.discard_record(record);
        debug!("remove: {} complete", record.name());
        true
    }

    /// Complete a remove that found no replicas to contact.
    pub async fn settle_if_drained(&self, record: &Arc<FileRecord>) -> bool {
        let mut state = record.lock().await;
        self.settle_remove(record, &mut state).await
    }
}
