//! Request pipeline: accept, receive, dispatch, respond.
//!
//! One tokio task per connection reads protocol lines and serves them in
//! order until the peer hangs up:
//!   accept_loop → spawn(handle_connection) → recv → dispatch → respond

use std::sync::Arc;

use dfs_core::Connection;
use dfs_proto::{DfsError, DfsResult, Message};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::daemon::SharedState;
use crate::rebalance;

/// Accept loop: spawn a handler per incoming connection.
pub async fn accept_loop(
    state: SharedState,
    listener: TcpListener,
    shutdown: Arc<Notify>,
) -> DfsResult<()> {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {}", peer);
                        stream.set_nodelay(true).ok();
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(state, Connection::new(stream)).await {
                                debug!("connection {} closed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("accept error: {}", e);
                    }
                }
            }
            _ = shutdown.notified() => {
                info!("accept loop shutting down");
                break;
            }
        }
    }
    Ok(())
}

/// Serve one connection until EOF or a network error.
pub async fn handle_connection(state: SharedState, mut conn: Connection) -> DfsResult<()> {
    loop {
        let msg = match conn.recv().await {
            Ok(Some(msg)) => msg,
            Ok(None) => return Ok(()),
            Err(DfsError::Protocol) => {
                warn!("malformed message from {:?}", conn.peer());
                continue;
            }
            Err(e) => return Err(e),
        };
        debug!("message from {:?}: {}", conn.peer(), msg);

        match msg {
            Message::Join(None) => {
                debug!("controller confirmed it can reach {}", state.node);
            }
            Message::Store { filename, size } => {
                receive_file(&state, &mut conn, &filename, size).await?;
                // A lost ack only delays the Controller's view until the
                // next rebalance reconciles it.
                let _ = state.link.store_ack(&filename).await;
            }
            Message::RebalanceStore { filename, size } => {
                receive_file(&state, &mut conn, &filename, size).await?;
                debug!("rebalance: received {}", filename);
            }
            Message::LoadData { filename } => {
                let read = state.store.read(&filename).await;
                match read {
                    Ok(data) => conn.write_payload(&data).await?,
                    Err(e) => {
                        warn!("load: cannot serve {}: {}", filename, e);
                        // The client detects the missing file by the closed connection.
                        conn.shutdown().await.ok();
                        return Ok(());
                    }
                }
            }
            Message::Remove { filename } => {
                let removed = state.store.remove(&filename).await;
                match removed {
                    Ok(()) => conn.send(&Message::RemoveAck { filename }).await?,
                    Err(DfsError::FileDoesNotExist) => {
                        conn.send(&Message::ErrorFileDoesNotExist(Some(filename)))
                            .await?
                    }
                    Err(e) => warn!("remove: cannot delete {}: {}", filename, e),
                }
            }
            Message::List(_) => {
                let files = state.store.list().await?;
                conn.send(&Message::List(files)).await?;
            }
            Message::Rebalance(plan) => {
                let outcome = rebalance::execute(&state, &plan).await;
                if outcome.is_complete() {
                    conn.send(&Message::RebalanceComplete).await?;
                } else {
                    warn!("rebalance: plan faulted on {:?}, not confirming", outcome.faulted);
                }
            }
            other => {
                warn!("unexpected {} from {:?}, ignoring", other.token(), conn.peer());
            }
        }
    }
}

/// Answer `ACK`, read `size` payload bytes and store them as `filename`.
async fn receive_file(
    state: &SharedState,
    conn: &mut Connection,
    filename: &str,
    size: u64,
) -> DfsResult<()> {
    if size > state.config.max_file_size {
        warn!(
            "store: refusing {} ({} bytes, limit {})",
            filename, size, state.config.max_file_size
        );
        return Err(DfsError::FileTooLarge);
    }
    conn.send(&Message::Ack).await?;
    let data = conn.read_payload_timeout(size, state.config.timeout).await.map_err(|e| {
        warn!("store: payload of {} not received: {}", filename, e);
        e
    })?;
    state.store.write(filename, &data).await?;
    debug!("store: {} stored ({} bytes)", filename, size);
    Ok(())
}
