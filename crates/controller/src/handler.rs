//! Controller daemon: accept loop and per-connection protocol handling.
//!
//! Every accepted connection gets its own task running a [`Session`]. A
//! session serves whatever arrives on it: client requests, or a Dstore's
//! `JOIN` followed by its `STORE_ACK`s.

use std::collections::HashMap;
use std::sync::Arc;

use dfs_core::net::create_listen_socket;
use dfs_core::Connection;
use dfs_proto::{DfsError, DfsResult, Message, NodeId};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::rebalance::Rebalancer;
use crate::state::{ControllerState, FileRecord, FileStatus};

/// The Controller daemon.
pub struct Controller {
    state: Arc<ControllerState>,
    rebalancer: Arc<Rebalancer>,
    shutdown: Arc<Notify>,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        let state = Arc::new(ControllerState::new(config));
        let rebalancer = Arc::new(Rebalancer::new(state.clone()));
        Self {
            state,
            rebalancer,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> &Arc<ControllerState> {
        &self.state
    }

    pub fn rebalancer(&self) -> &Arc<Rebalancer> {
        &self.rebalancer
    }

    /// Bind the configured address and serve until shut down.
    pub async fn run(&self) -> DfsResult<()> {
        let addr = self.state.config.listen_addr;
        let listener = create_listen_socket(&addr.ip().to_string(), addr.port()).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> DfsResult<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("controller accepting connections on {}", addr);
        }

        let periodic = tokio::spawn(self.rebalancer.clone().run_periodic());

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("connection from {}", peer);
                            stream.set_nodelay(true).ok();
                            let session = Session::new(
                                self.state.clone(),
                                self.rebalancer.clone(),
                                Connection::new(stream),
                            );
                            tokio::spawn(async move {
                                if let Err(e) = session.run().await {
                                    debug!("connection {} closed: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("controller shutting down");
                    break;
                }
            }
        }

        periodic.abort();
        Ok(())
    }

    /// Stop the accept loop.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

/// One connection's conversation with the Controller.
struct Session {
    state: Arc<ControllerState>,
    rebalancer: Arc<Rebalancer>,
    conn: Connection,
    /// Replicas already offered per filename, for `RELOAD`.
    tried: HashMap<String, Vec<NodeId>>,
}

impl Session {
    fn new(state: Arc<ControllerState>, rebalancer: Arc<Rebalancer>, conn: Connection) -> Self {
        Self {
            state,
            rebalancer,
            conn,
            tried: HashMap::new(),
        }
    }

    async fn run(mut self) -> DfsResult<()> {
        loop {
            let msg = match self.conn.recv().await {
                Ok(Some(msg)) => msg,
                Ok(None) => return Ok(()),
                Err(DfsError::Protocol) => {
                    warn!("malformed message from {:?}", self.conn.peer());
                    continue;
                }
                Err(e) => return Err(e),
            };
            debug!("message from {:?}: {}", self.conn.peer(), msg);

            if let Err(e) = self.dispatch(msg).await {
                match Message::from_error(e) {
                    Some(reply) => self.conn.send(&reply).await?,
                    None => return Err(e),
                }
            }
        }
    }

    /// Handle one message. Client-visible failures come back as errors and
    /// are turned into their reply token by the caller.
    async fn dispatch(&mut self, msg: Message) -> DfsResult<()> {
        match msg {
            Message::Join(Some(node)) => self.join(node).await,
            Message::List(_) => self.list().await,
            Message::Store { filename, size } => self.store(filename, size).await,
            Message::StoreAck { filename, node } => {
                self.state.store_ack(&filename, node).await;
                Ok(())
            }
            Message::Load { filename } => self.load(filename).await,
            Message::Reload { filename } => self.reload(filename).await,
            Message::Remove { filename } => self.remove(filename).await,
            other => {
                warn!(
                    "unexpected {} from {:?}, ignoring",
                    other.token(),
                    self.conn.peer()
                );
                Ok(())
            }
        }
    }

    /// `JOIN <port>`: confirm the node is reachable, register it, and either
    /// bootstrap the ring or rebalance it in.
    async fn join(&mut self, node: NodeId) -> DfsResult<()> {
        let config = &self.state.config;
        let handshake = async {
            let mut conn = Connection::open(config.dstore_host, node, config.timeout).await?;
            conn.send(&Message::Join(None)).await
        };
        if let Err(e) = handshake.await {
            warn!("join of {} ignored: cannot reach it ({})", node, e);
            return Ok(());
        }

        if !self.state.register_node(node) {
            info!("node {} rejoined", node);
        } else {
            info!("node {} joined ({} registered)", node, self.state.node_count());
        }

        // Bootstrap declines both below quorum and on an initialized ring;
        // only the latter needs the node rebalanced in.
        if !self.state.bootstrap_ring().await? && self.state.ring.read().await.is_initialized() {
            self.rebalancer.trigger_join(node);
        }
        Ok(())
    }

    async fn list(&mut self) -> DfsResult<()> {
        if !self.state.has_quorum() {
            return Err(DfsError::NotEnoughDstores);
        }
        let files = self.state.complete_files().await;
        self.conn.send(&Message::List(files)).await
    }

    async fn store(&mut self, filename: String, size: u64) -> DfsResult<()> {
        let config = &self.state.config;
        if !self.state.has_quorum() {
            return Err(DfsError::NotEnoughDstores);
        }
        if self.state.contains_file(&filename) {
            warn!("store: {} already exists", filename);
            return Err(DfsError::FileAlreadyExists);
        }
        if size > config.max_file_size {
            warn!("store: {} is {} bytes, over the {} limit", filename, size, config.max_file_size);
            return Err(DfsError::FileTooLarge);
        }

        let (vnodes, targets) = {
            let ring = self.state.ring.read().await;
            let vnodes = ring.select_replicas(&filename, config.replication)?;
            let targets = ring.owners(&vnodes)?;
            (vnodes, targets)
        };
        let (record, rx) = FileRecord::new_store(&filename, size, targets.clone(), vnodes);
        if !self.state.insert_record(record.clone()) {
            return Err(DfsError::FileAlreadyExists);
        }

        if let Err(e) = self.conn.send(&Message::StoreTo(targets)).await {
            record.lock().await.abandon();
            self.state.discard_record(&record);
            return Err(e);
        }

        let completed = match tokio::time::timeout(config.timeout, rx).await {
            Ok(Ok(())) => true,
            _ => {
                let status = record.lock().await.abandon();
                status == FileStatus::StoreComplete
            }
        };
        if completed {
            info!("store: {} complete", filename);
            self.conn.send(&Message::StoreComplete).await
        } else {
            warn!("store: {} timed out waiting for acknowledgements", filename);
            self.state.discard_record(&record);
            Ok(())
        }
    }

    async fn load(&mut self, filename: String) -> DfsResult<()> {
        if !self.state.has_quorum() {
            return Err(DfsError::NotEnoughDstores);
        }
        let record = self.state.file(&filename).ok_or(DfsError::FileDoesNotExist)?;
        let (node, size) = {
            let state = record.lock().await;
            if state.status != FileStatus::StoreComplete {
                return Err(DfsError::FileDoesNotExist);
            }
            let node = *state.replicas.first().ok_or(DfsError::LoadExhausted)?;
            (node, state.size)
        };
        self.tried.insert(filename, vec![node]);
        self.conn.send(&Message::LoadFrom { node, size }).await
    }

    async fn reload(&mut self, filename: String) -> DfsResult<()> {
        let record = self.state.file(&filename).ok_or(DfsError::FileDoesNotExist)?;
        let tried = self.tried.entry(filename).or_default();
        let (node, size) = {
            let state = record.lock().await;
            if state.status != FileStatus::StoreComplete {
                return Err(DfsError::FileDoesNotExist);
            }
            let node = state
                .replicas
                .iter()
                .copied()
                .find(|n| !tried.contains(n))
                .ok_or(DfsError::LoadExhausted)?;
            (node, state.size)
        };
        tried.push(node);
        self.conn.send(&Message::LoadFrom { node, size }).await
    }

    async fn remove(&mut self, filename: String) -> DfsResult<()> {
        let config = &self.state.config;
        if !self.state.has_quorum() {
            return Err(DfsError::NotEnoughDstores);
        }
        let record = self.state.file(&filename).ok_or(DfsError::FileDoesNotExist)?;
        let (rx, holders) = {
            let mut state = record.lock().await;
            if state.status != FileStatus::StoreComplete {
                return Err(DfsError::FileDoesNotExist);
            }
            (state.begin_remove(), state.replicas.clone())
        };

        if holders.is_empty() {
            self.state.settle_if_drained(&record).await;
        }
        for node in holders {
            let state = self.state.clone();
            let filename = filename.clone();
            tokio::spawn(async move {
                match remove_from(&state, node, &filename).await {
                    Ok(()) => {
                        state.release_replica(&filename, node).await;
                    }
                    Err(e) => warn!("remove: {} on {} not confirmed: {}", filename, node, e),
                }
            });
        }

        let completed = match tokio::time::timeout(config.timeout, rx).await {
            Ok(Ok(())) => true,
            _ => {
                let status = record.lock().await.abandon();
                status == FileStatus::RemoveComplete
            }
        };
        if completed {
            info!("remove: {} complete", filename);
            self.conn.send(&Message::RemoveComplete).await
        } else {
            warn!("remove: {} incomplete, left to rebalance", filename);
            Ok(())
        }
    }
}

/// Ask `node` to delete `filename`. A not-found reply counts as deleted.
async fn remove_from(state: &ControllerState, node: NodeId, filename: &str) -> DfsResult<()> {
    let timeout = state.config.timeout;
    let mut conn = Connection::open(state.config.dstore_host, node, timeout).await?;
    let request = Message::Remove {
        filename: filename.to_string(),
    };
    match conn.request(&request, timeout).await? {
        Message::RemoveAck { filename: f } | Message::ErrorFileDoesNotExist(Some(f))
            if f == filename =>
        {
            Ok(())
        }
        Message::ErrorFileDoesNotExist(None) => Ok(()),
        other => {
            warn!("remove: unexpected reply from {}: {}", node, other);
            Err(DfsError::Protocol)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_proto::constants::{ERROR_FILE_ALREADY_EXISTS, ERROR_NOT_ENOUGH_DSTORES};
    use std::collections::BTreeSet;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Scripted Dstore: joins, answers the handshake, acks removes, and
    /// (when told to) acks stores over its join link.
    struct FakeDstore {
        node: NodeId,
        link: Connection,
        removes: Arc<StdMutex<Vec<String>>>,
    }

    impl FakeDstore {
        /// `answer_removes` decides whether `REMOVE` gets a reply.
        async fn join(controller: u16, answer_removes: bool) -> Self {
            let listener = create_listen_socket("127.0.0.1", 0).await.unwrap();
            let node = NodeId(listener.local_addr().unwrap().port());
            let removes = Arc::new(StdMutex::new(Vec::new()));
            let seen = removes.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let seen = seen.clone();
                    tokio::spawn(async move {
                        let mut conn = Connection::new(stream);
                        while let Ok(Some(msg)) = conn.recv().await {
                            match msg {
                                Message::Remove { filename } => {
                                    seen.lock().unwrap().push(filename.clone());
                                    if answer_removes {
                                        let _ = conn.send(&Message::RemoveAck { filename }).await;
                                    }
                                }
                                Message::List(_) => {
                                    let _ = conn.send(&Message::List(vec![])).await;
                                }
                                _ => {}
                            }
                        }
                    });
                }
            });

            let mut link = client(controller).await;
            link.send(&Message::Join(Some(node))).await.unwrap();
            Self {
                node,
                link,
                removes,
            }
        }

        async fn ack(&mut self, filename: &str) {
            self.link
                .send(&Message::StoreAck {
                    filename: filename.into(),
                    node: self.node,
                })
                .await
                .unwrap();
        }

        fn removes(&self) -> Vec<String> {
            self.removes.lock().unwrap().clone()
        }
    }

    async fn client(port: u16) -> Connection {
        Connection::open("127.0.0.1".parse().unwrap(), NodeId(port), Duration::from_secs(1))
            .await
            .unwrap()
    }

    async fn start(replication: usize) -> (Arc<Controller>, u16) {
        let controller = Arc::new(Controller::new(ControllerConfig {
            replication,
            vnode_count: 60,
            timeout: Duration::from_millis(500),
            rebalance_period: Duration::from_secs(3600),
            ..ControllerConfig::default()
        }));
        let listener = create_listen_socket("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let serving = controller.clone();
        tokio::spawn(async move { serving.serve(listener).await });
        (controller, port)
    }

    async fn wait_for_nodes(controller: &Controller, n: usize) {
        for _ in 0..100 {
            if controller.state().node_count() >= n
                && controller.state().ring.read().await.is_initialized()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("nodes never registered");
    }

    async fn recv(conn: &mut Connection) -> Message {
        conn.recv_timeout(Duration::from_secs(2)).await.unwrap()
    }

    /// Store `name` with every target acking; returns the targets.
    async fn store_acked(
        conn: &mut Connection,
        fakes: &mut [FakeDstore],
        name: &str,
    ) -> Vec<NodeId> {
        conn.send(&Message::Store {
            filename: name.into(),
            size: 10,
        })
        .await
        .unwrap();
        let Message::StoreTo(targets) = recv(conn).await else {
            panic!("expected STORE_TO");
        };
        for fake in fakes.iter_mut().filter(|f| targets.contains(&f.node)) {
            fake.ack(name).await;
        }
        assert_eq!(recv(conn).await, Message::StoreComplete);
        targets
    }

    #[tokio::test]
    async fn test_not_enough_dstores() {
        let (_controller, port) = start(3).await;
        let mut conn = client(port).await;
        conn.send_line("LIST").await.unwrap();
        assert_eq!(recv(&mut conn).await.to_string(), ERROR_NOT_ENOUGH_DSTORES);
        conn.send_line("STORE f 10").await.unwrap();
        assert_eq!(recv(&mut conn).await, Message::ErrorNotEnoughDstores);
    }

    #[tokio::test]
    async fn test_store_quorum_then_load() {
        let (controller, port) = start(3).await;
        let mut fakes = Vec::new();
        for _ in 0..3 {
            fakes.push(FakeDstore::join(port, true).await);
        }
        wait_for_nodes(&controller, 3).await;

        let mut conn = client(port).await;
        let targets = store_acked(&mut conn, &mut fakes, "fileA").await;
        let distinct: BTreeSet<NodeId> = targets.iter().copied().collect();
        assert_eq!(distinct.len(), 3);

        conn.send(&Message::List(vec![])).await.unwrap();
        assert_eq!(recv(&mut conn).await, Message::List(vec!["fileA".into()]));

        // A second store of the same name is refused.
        let mut other = client(port).await;
        other.send_line("STORE fileA 10").await.unwrap();
        assert_eq!(recv(&mut other).await, Message::ErrorFileAlreadyExists);

        // LOAD offers the primary, RELOAD walks the others, then ERROR_LOAD.
        conn.send_line("LOAD fileA").await.unwrap();
        let Message::LoadFrom { node: first, size } = recv(&mut conn).await else {
            panic!("expected LOAD_FROM");
        };
        assert_eq!(size, 10);
        let mut offered = vec![first];
        for _ in 0..2 {
            conn.send_line("RELOAD fileA").await.unwrap();
            let Message::LoadFrom { node, .. } = recv(&mut conn).await else {
                panic!("expected LOAD_FROM");
            };
            assert!(!offered.contains(&node));
            offered.push(node);
        }
        conn.send_line("RELOAD fileA").await.unwrap();
        assert_eq!(recv(&mut conn).await, Message::ErrorLoad);
        assert_eq!(
            offered.into_iter().collect::<BTreeSet<_>>(),
            distinct
        );
    }

    #[tokio::test]
    async fn test_store_without_quorum_times_out() {
        let (controller, port) = start(3).await;
        let mut fakes = Vec::new();
        for _ in 0..3 {
            fakes.push(FakeDstore::join(port, true).await);
        }
        wait_for_nodes(&controller, 3).await;

        let mut conn = client(port).await;
        conn.send_line("STORE fileA 10").await.unwrap();
        let Message::StoreTo(targets) = recv(&mut conn).await else {
            panic!("expected STORE_TO");
        };
        // Only two of three acknowledge.
        for fake in fakes.iter_mut().filter(|f| targets.contains(&f.node)).take(2) {
            fake.ack("fileA").await;
        }
        assert_eq!(
            conn.recv_timeout(Duration::from_millis(800)).await,
            Err(DfsError::Timeout)
        );

        let state = controller.state();
        assert!(!state.contains_file("fileA"));
        assert!(state.ring.read().await.placement("fileA").is_none());
        conn.send_line("LOAD fileA").await.unwrap();
        assert_eq!(recv(&mut conn).await, Message::ErrorFileDoesNotExist(None));

        // The name is free again.
        store_acked(&mut conn, &mut fakes, "fileA").await;
    }

    #[tokio::test]
    async fn test_oversize_store_rejected() {
        let (controller, port) = start(1).await;
        let _fake = FakeDstore::join(port, true).await;
        wait_for_nodes(&controller, 1).await;

        let mut conn = client(port).await;
        conn.send_line("STORE big 100001").await.unwrap();
        assert_eq!(recv(&mut conn).await.to_string(), ERROR_FILE_ALREADY_EXISTS);
    }

    #[tokio::test]
    async fn test_remove_completes_after_all_acks() {
        let (controller, port) = start(2).await;
        let mut fakes = vec![
            FakeDstore::join(port, true).await,
            FakeDstore::join(port, true).await,
        ];
        wait_for_nodes(&controller, 2).await;

        let mut conn = client(port).await;
        store_acked(&mut conn, &mut fakes, "fileA").await;

        conn.send_line("REMOVE fileA").await.unwrap();
        assert_eq!(recv(&mut conn).await, Message::RemoveComplete);
        for fake in &fakes {
            assert_eq!(fake.removes(), vec!["fileA".to_string()]);
        }
        assert!(!controller.state().contains_file("fileA"));
        assert!(controller.state().ring.read().await.placement("fileA").is_none());

        conn.send_line("REMOVE fileA").await.unwrap();
        assert_eq!(recv(&mut conn).await, Message::ErrorFileDoesNotExist(None));
    }

    #[tokio::test]
    async fn test_remove_waits_for_every_replica() {
        let (controller, port) = start(3).await;
        let mut fakes = vec![
            FakeDstore::join(port, true).await,
            FakeDstore::join(port, true).await,
            FakeDstore::join(port, false).await,
        ];
        wait_for_nodes(&controller, 3).await;

        let mut conn = client(port).await;
        store_acked(&mut conn, &mut fakes, "fileA").await;
        conn.send_line("REMOVE fileA").await.unwrap();
        assert_eq!(
            conn.recv_timeout(Duration::from_millis(800)).await,
            Err(DfsError::Timeout)
        );

        let record = controller.state().file("fileA").unwrap();
        {
            let state = record.lock().await;
            assert_eq!(state.status, FileStatus::RemoveInProgress);
            assert_eq!(state.replicas, vec![fakes[2].node]);
        }

        // The file is neither listed nor storable while the remove is open.
        conn.send_line("LIST").await.unwrap();
        assert_eq!(recv(&mut conn).await, Message::List(vec![]));
        conn.send_line("STORE fileA 10").await.unwrap();
        assert_eq!(recv(&mut conn).await, Message::ErrorFileAlreadyExists);

        // The last replica's confirmation completes it.
        assert!(controller.state().release_replica("fileA", fakes[2].node).await);
        assert!(!controller.state().contains_file("fileA"));
    }

    #[tokio::test]
    async fn test_malformed_line_keeps_connection() {
        let (_controller, port) = start(3).await;
        let mut conn = client(port).await;
        conn.send_line("BOGUS 1 2").await.unwrap();
        conn.send_line("STORE").await.unwrap();
        conn.send_line("LIST").await.unwrap();
        assert_eq!(recv(&mut conn).await, Message::ErrorNotEnoughDstores);
    }
}
