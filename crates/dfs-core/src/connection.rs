//! Line-framed connection: newline-terminated text commands, each optionally
//! followed by a raw payload whose length the command itself declares.
//!
//! There is no length prefix on the wire. Text is read through a buffered
//! reader, so payload bytes that arrive in the same segment as their header
//! line are served from the buffer before the socket is read again.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use dfs_proto::constants::MAX_LINE_LEN;
use dfs_proto::{DfsError, DfsResult, Message, NodeId};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::net;

/// Upper bound on the buffer reserved before payload bytes arrive.
const PAYLOAD_PREALLOC: usize = 64 * 1024;

/// One side of a protocol conversation.
pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: Option<SocketAddr>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let (read, write) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer: write,
            peer,
        }
    }

    /// Open a connection to the node listening on `node` at `host`,
    /// giving up after `timeout`.
    pub async fn open(host: IpAddr, node: NodeId, timeout: Duration) -> DfsResult<Self> {
        let stream = tokio::time::timeout(timeout, net::connect_to_node(host, node))
            .await
            .map_err(|_| DfsError::Timeout)??;
        Ok(Self::new(stream))
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Read one text line without its terminator. `None` on a clean EOF.
    pub async fn recv_line(&mut self) -> DfsResult<Option<String>> {
        let mut line = String::new();
        let mut limited = (&mut self.reader).take(MAX_LINE_LEN as u64);
        let n = limited.read_line(&mut line).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                DfsError::Protocol
            } else {
                DfsError::NetworkError
            }
        })?;
        if n == 0 {
            return Ok(None);
        }
        if !line.ends_with('\n') {
            if n as u64 >= MAX_LINE_LEN as u64 {
                debug!("line from {:?} exceeds {} bytes", self.peer, MAX_LINE_LEN);
                return Err(DfsError::Protocol);
            }
            // Unterminated final line before EOF.
            return Ok(Some(line));
        }
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
        trace!("recv {:?}: {}", self.peer, line);
        Ok(Some(line))
    }

    /// Read and parse the next message. `None` on a clean EOF.
    pub async fn recv(&mut self) -> DfsResult<Option<Message>> {
        match self.recv_line().await? {
            Some(line) => Message::parse(&line).map(Some),
            None => Ok(None),
        }
    }

    /// Read the next message within `timeout`; EOF counts as a network error.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> DfsResult<Message> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| DfsError::Timeout)??
            .ok_or(DfsError::NetworkError)
    }

    /// Send one message as a text line.
    pub async fn send(&mut self, msg: &Message) -> DfsResult<()> {
        self.send_line(&msg.to_string()).await
    }

    pub async fn send_line(&mut self, line: &str) -> DfsResult<()> {
        trace!("send {:?}: {}", self.peer, line);
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.writer
            .write_all(&buf)
            .await
            .map_err(|_| DfsError::NetworkError)?;
        self.writer.flush().await.map_err(|_| DfsError::NetworkError)
    }

    /// Send `msg` and wait for the reply.
    pub async fn request(&mut self, msg: &Message, timeout: Duration) -> DfsResult<Message> {
        self.send(msg).await?;
        self.recv_timeout(timeout).await
    }

    /// Read exactly `size` raw bytes.
    ///
    /// The buffer grows with the bytes actually received, so a declared
    /// size the peer never sends costs nothing up front.
    pub async fn read_payload(&mut self, size: u64) -> DfsResult<Vec<u8>> {
        let len = usize::try_from(size).map_err(|_| DfsError::Protocol)?;
        let mut buf = Vec::with_capacity(len.min(PAYLOAD_PREALLOC));
        (&mut self.reader)
            .take(size)
            .read_to_end(&mut buf)
            .await
            .map_err(|_| DfsError::NetworkError)?;
        if buf.len() != len {
            debug!("payload short: {} of {} bytes", buf.len(), len);
            return Err(DfsError::NetworkError);
        }
        Ok(buf)
    }

    /// [`Connection::read_payload`] bounded by `timeout`.
    pub async fn read_payload_timeout(&mut self, size: u64, timeout: Duration) -> DfsResult<Vec<u8>> {
        tokio::time::timeout(timeout, self.read_payload(size))
            .await
            .map_err(|_| DfsError::Timeout)?
    }

    /// Write raw bytes.
    pub async fn write_payload(&mut self, data: &[u8]) -> DfsResult<()> {
        self.writer
            .write_all(data)
            .await
            .map_err(|_| DfsError::NetworkError)?;
        self.writer.flush().await.map_err(|_| DfsError::NetworkError)
    }

    /// Half-close the write side.
    pub async fn shutdown(&mut self) -> DfsResult<()> {
        self.writer.shutdown().await.map_err(|_| DfsError::NetworkError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::create_listen_socket;

    async fn pair() -> (Connection, Connection) {
        let listener = create_listen_socket("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = Connection::open(
            "127.0.0.1".parse().unwrap(),
            NodeId(port),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let server = Connection::new(accept.await.unwrap());
        (client, server)
    }

    #[tokio::test]
    async fn test_line_then_payload() {
        let (mut a, mut b) = pair().await;

        // Header and payload in one write: the payload must survive the
        // buffered line read.
        a.write_payload(b"STORE f 5\nhelloLIST\n").await.unwrap();

        let msg = b.recv().await.unwrap().unwrap();
        assert_eq!(
            msg,
            Message::Store {
                filename: "f".into(),
                size: 5
            }
        );
        assert_eq!(b.read_payload(5).await.unwrap(), b"hello");
        assert_eq!(b.recv().await.unwrap(), Some(Message::List(vec![])));
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (mut a, mut b) = pair().await;
        let server = tokio::spawn(async move {
            let msg = b.recv().await.unwrap().unwrap();
            assert_eq!(msg, Message::List(vec![]));
            b.send(&Message::List(vec!["x".into(), "y".into()])).await.unwrap();
        });

        let reply = a
            .request(&Message::List(vec![]), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, Message::List(vec!["x".into(), "y".into()]));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_crlf_and_eof() {
        let (mut a, mut b) = pair().await;
        a.send_line("REMOVE_ACK f\r").await.unwrap();
        a.shutdown().await.unwrap();

        assert_eq!(
            b.recv().await.unwrap(),
            Some(Message::RemoveAck {
                filename: "f".into()
            })
        );
        assert_eq!(b.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let (_a, mut b) = pair().await;
        let result = b.recv_timeout(Duration::from_millis(50)).await;
        assert_eq!(result, Err(DfsError::Timeout));
    }

    #[tokio::test]
    async fn test_short_payload() {
        let (mut a, mut b) = pair().await;
        a.write_payload(b"abc").await.unwrap();
        a.shutdown().await.unwrap();
        assert_eq!(b.read_payload(10).await, Err(DfsError::NetworkError));
    }

    #[tokio::test]
    async fn test_huge_declared_payload_fails_cleanly() {
        let (mut a, mut b) = pair().await;
        a.write_payload(b"tiny").await.unwrap();
        a.shutdown().await.unwrap();
        assert_eq!(
            b.read_payload(1_125_899_906_842_624).await,
            Err(DfsError::NetworkError)
        );
    }

    #[tokio::test]
    async fn test_payload_larger_than_prealloc() {
        let (mut a, mut b) = pair().await;
        let data: Vec<u8> = (0..PAYLOAD_PREALLOC * 3 + 7).map(|i| i as u8).collect();
        let sent = data.clone();
        let writer = tokio::spawn(async move {
            a.write_payload(&sent).await.unwrap();
            a
        });
        assert_eq!(b.read_payload(data.len() as u64).await.unwrap(), data);
        let _a = writer.await.unwrap();
    }
}
