//! Async TCP socket helpers for Controller, Dstore and client connections.

use std::net::{IpAddr, SocketAddr};

use dfs_proto::{DfsError, DfsResult, NodeId};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

/// Connect to a remote peer by address and port.
pub async fn connect_to(addr: &str, port: u16) -> DfsResult<TcpStream> {
    let target = format!("{}:{}", addr, port);
    debug!("connecting to {}", target);

    let stream = TcpStream::connect(&target)
        .await
        .map_err(|_| DfsError::NetworkError)?;

    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Connect to a socket address.
pub async fn connect_to_addr(addr: SocketAddr) -> DfsResult<TcpStream> {
    debug!("connecting to {}", addr);
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|_| DfsError::NetworkError)?;

    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Connect to the Dstore listening on `node` at `host`.
pub async fn connect_to_node(host: IpAddr, node: NodeId) -> DfsResult<TcpStream> {
    connect_to_addr(node.socket_addr(host)).await
}

/// Create a TCP listener on the given address and port.
///
/// Port 0 binds an ephemeral port; read it back with `local_addr`.
pub async fn create_listen_socket(bind_addr: &str, port: u16) -> DfsResult<TcpListener> {
    let addr = format!("{}:{}", bind_addr, port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        error!("failed to bind to {}: {}", addr, e);
        DfsError::SystemError
    })?;

    debug!("listening on {}", addr);
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listen_and_connect() {
        let listener = create_listen_socket("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept = tokio::spawn(async move { listener.accept().await.map(|(_, peer)| peer) });
        let stream = connect_to("127.0.0.1", port).await.unwrap();
        let peer = accept.await.unwrap().unwrap();
        assert_eq!(peer, stream.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let listener = create_listen_socket("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = connect_to_node("127.0.0.1".parse().unwrap(), NodeId(port)).await;
        assert_eq!(result.err(), Some(DfsError::NetworkError));
    }
}
