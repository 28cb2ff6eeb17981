//! End-to-end tests: an in-process Controller and real Dstores on
//! ephemeral loopback ports, driven through the client library.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dfs_client::{Client, ClientConfig};
use dfs_controller::{Controller, ControllerConfig, FileStatus};
use dfs_core::net::create_listen_socket;
use dfs_dstore::{Dstore, DstoreConfig};
use dfs_proto::{DfsError, DfsResult, NodeId};
use tokio::task::JoinHandle;

const CONTROLLER_TIMEOUT: Duration = Duration::from_millis(500);

struct Node {
    id: NodeId,
    folder: PathBuf,
    task: JoinHandle<DfsResult<()>>,
}

impl Node {
    fn holds(&self, filename: &str) -> bool {
        self.folder.join(filename).is_file()
    }

    /// Stop accepting connections; the node looks dead to its peers.
    fn kill(&self) {
        self.task.abort();
    }
}

struct Cluster {
    name: &'static str,
    controller: Arc<Controller>,
    port: u16,
    nodes: Vec<Node>,
}

impl Cluster {
    async fn start(name: &'static str, replication: usize) -> Self {
        let controller = Arc::new(Controller::new(ControllerConfig {
            replication,
            vnode_count: 60,
            timeout: CONTROLLER_TIMEOUT,
            rebalance_period: Duration::from_secs(3600),
            ..ControllerConfig::default()
        }));
        let listener = create_listen_socket("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let serving = controller.clone();
        tokio::spawn(async move { serving.serve(listener).await });
        Self {
            name,
            controller,
            port,
            nodes: Vec::new(),
        }
    }

    /// Start a Dstore and wait until the Controller has placed it.
    async fn add_dstore(&mut self) -> NodeId {
        let folder = std::env::temp_dir().join(format!("dfs_cluster_{}_{}", self.name, self.nodes.len()));
        let _ = std::fs::remove_dir_all(&folder);
        let mut config = DstoreConfig::new(&folder);
        config.controller_addr = ([127, 0, 0, 1], self.port).into();
        config.timeout = CONTROLLER_TIMEOUT;

        let listener = create_listen_socket("127.0.0.1", 0).await.unwrap();
        let id = NodeId(listener.local_addr().unwrap().port());
        let dstore = Dstore::new(config);
        let task = tokio::spawn(async move { dstore.serve(listener).await });
        self.nodes.push(Node { id, folder, task });

        let state = self.controller.state();
        for _ in 0..300 {
            let placed = {
                let ring = state.ring.read().await;
                if ring.is_initialized() {
                    ring.contains_node(id)
                } else {
                    state.is_registered(id)
                }
            };
            if placed {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("dstore {} never joined", id);
    }

    async fn client(&self) -> Client {
        Client::connect(ClientConfig {
            controller_addr: ([127, 0, 0, 1], self.port).into(),
            timeout: CONTROLLER_TIMEOUT * 3,
            ..ClientConfig::default()
        })
        .await
        .unwrap()
    }

    fn node(&self, id: NodeId) -> &Node {
        self.nodes.iter().find(|n| n.id == id).unwrap()
    }

    fn holders(&self, filename: &str) -> BTreeSet<NodeId> {
        self.nodes
            .iter()
            .filter(|n| !n.task.is_finished() && n.holds(filename))
            .map(|n| n.id)
            .collect()
    }

    async fn replicas(&self, filename: &str) -> BTreeSet<NodeId> {
        let record = self.controller.state().file(filename).unwrap();
        let state = record.lock().await;
        assert_eq!(state.status, FileStatus::StoreComplete);
        state.replicas.iter().copied().collect()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.controller.shutdown();
        for node in &self.nodes {
            node.task.abort();
            let _ = std::fs::remove_dir_all(&node.folder);
        }
    }
}

#[tokio::test]
async fn test_not_enough_dstores() {
    let mut cluster = Cluster::start("quorum", 3).await;
    cluster.add_dstore().await;
    cluster.add_dstore().await;

    let mut client = cluster.client().await;
    assert_eq!(client.list().await, Err(DfsError::NotEnoughDstores));
    assert_eq!(
        client.store("fileA", b"0123456789").await,
        Err(DfsError::NotEnoughDstores)
    );
}

#[tokio::test]
async fn test_store_load_remove() {
    let mut cluster = Cluster::start("lifecycle", 3).await;
    for _ in 0..3 {
        cluster.add_dstore().await;
    }

    let mut client = cluster.client().await;
    let data = b"0123456789";
    let targets = client.store("fileA", data).await.unwrap();
    let targets: BTreeSet<NodeId> = targets.into_iter().collect();
    assert_eq!(targets.len(), 3);
    assert_eq!(cluster.holders("fileA"), targets);
    assert_eq!(cluster.replicas("fileA").await, targets);

    assert_eq!(client.list().await.unwrap(), vec!["fileA".to_string()]);
    assert_eq!(client.load("fileA").await.unwrap(), data);

    let mut other = cluster.client().await;
    assert_eq!(
        other.store("fileA", b"different").await,
        Err(DfsError::FileAlreadyExists)
    );

    client.remove("fileA").await.unwrap();
    assert!(cluster.holders("fileA").is_empty());
    assert!(client.list().await.unwrap().is_empty());
    assert_eq!(client.load("fileA").await, Err(DfsError::FileDoesNotExist));
    assert_eq!(client.remove("fileA").await, Err(DfsError::FileDoesNotExist));

    // The name can be reused once the remove completed.
    client.store("fileA", b"again").await.unwrap();
    assert_eq!(client.load("fileA").await.unwrap(), b"again");
}

#[tokio::test]
async fn test_oversize_store_rejected() {
    let mut cluster = Cluster::start("oversize", 1).await;
    cluster.add_dstore().await;

    let mut client = cluster.client().await;
    let big = vec![7u8; 100_001];
    assert_eq!(
        client.store("big", &big).await,
        Err(DfsError::FileAlreadyExists)
    );
    assert!(client.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_load_falls_back_to_other_replicas() {
    let mut cluster = Cluster::start("reload", 2).await;
    cluster.add_dstore().await;
    cluster.add_dstore().await;

    let mut client = cluster.client().await;
    let targets = client.store("fileA", b"replicated").await.unwrap();

    std::fs::remove_file(cluster.node(targets[0]).folder.join("fileA")).unwrap();
    assert_eq!(client.load("fileA").await.unwrap(), b"replicated");

    std::fs::remove_file(cluster.node(targets[1]).folder.join("fileA")).unwrap();
    assert_eq!(client.load("fileA").await, Err(DfsError::LoadExhausted));
}

#[tokio::test]
async fn test_store_without_quorum_is_invisible() {
    let mut cluster = Cluster::start("noquorum", 2).await;
    let a = cluster.add_dstore().await;
    let b = cluster.add_dstore().await;
    cluster.node(b).kill();

    let mut client = cluster.client().await;
    assert_eq!(
        client.store("fileA", b"0123456789").await,
        Err(DfsError::Timeout)
    );
    assert!(cluster.node(a).holds("fileA"));

    let state = cluster.controller.state();
    assert!(!state.contains_file("fileA"));
    assert!(state.ring.read().await.placement("fileA").is_none());
    let mut fresh = cluster.client().await;
    assert!(fresh.list().await.unwrap().is_empty());
    assert_eq!(fresh.load("fileA").await, Err(DfsError::FileDoesNotExist));

    // The next round drops the dead node and the orphaned copy.
    cluster.controller.rebalancer().run_round(None).await.unwrap();
    assert!(!state.is_registered(b));
    assert!(!cluster.node(a).holds("fileA"));
}

#[tokio::test]
async fn test_failed_replica_restored() {
    let mut cluster = Cluster::start("restore", 3).await;
    for _ in 0..4 {
        cluster.add_dstore().await;
    }

    let mut client = cluster.client().await;
    let data = b"0123456789";
    let targets = client.store("fileA", data).await.unwrap();
    let dead = targets[1];
    cluster.node(dead).kill();

    let report = cluster.controller.rebalancer().run_round(None).await.unwrap();
    assert!(report.is_success(), "{:?}", report);
    assert_eq!(report.failed, vec![dead]);

    let state = cluster.controller.state();
    assert!(!state.is_registered(dead));
    assert!(!state.ring.read().await.contains_node(dead));

    let holders = cluster.holders("fileA");
    assert_eq!(holders.len(), 3);
    assert!(!holders.contains(&dead));
    assert_eq!(cluster.replicas("fileA").await, holders);

    let ring = state.ring.read().await;
    let vnodes = ring.placement("fileA").unwrap();
    let owners: BTreeSet<NodeId> = ring.owners(vnodes).unwrap().into_iter().collect();
    assert_eq!(owners, holders);
    ring.check_invariants().unwrap();
    drop(ring);

    assert_eq!(client.load("fileA").await.unwrap(), data);
}

#[tokio::test]
async fn test_join_moves_files_to_newcomer() {
    let mut cluster = Cluster::start("join", 2).await;
    cluster.add_dstore().await;
    cluster.add_dstore().await;

    let mut client = cluster.client().await;
    let names: Vec<String> = (0..12).map(|i| format!("file{}", i)).collect();
    for name in &names {
        client.store(name, name.as_bytes()).await.unwrap();
    }

    // Waits for the join-triggered round to commit the newcomer.
    let newcomer = cluster.add_dstore().await;
    let _round = cluster.controller.state().rebalance_lock.lock().await;

    let ring = cluster.controller.state().ring.read().await;
    ring.check_invariants().unwrap();
    assert!(!ring.vnodes_of(newcomer).unwrap_or_default().is_empty());
    for name in &names {
        let vnodes = ring.placement(name).unwrap();
        let owners: BTreeSet<NodeId> = ring.owners(vnodes).unwrap().into_iter().collect();
        assert_eq!(owners.len(), 2, "{}", name);
        assert_eq!(cluster.holders(name), owners, "{}", name);
    }
    drop(ring);
    drop(_round);

    let moved = names.iter().filter(|n| cluster.node(newcomer).holds(n)).count();
    assert!(moved > 0);
    for name in &names {
        assert_eq!(client.load(name).await.unwrap(), name.as_bytes());
    }
}
