//! Real node identity.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::DfsError;

/// A Dstore, identified by its listen port.
///
/// All nodes of one deployment share a host, so the port alone addresses a
/// node; [`NodeId::socket_addr`] pairs it with the configured host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u16);

impl NodeId {
    pub fn port(self) -> u16 {
        self.0
    }

    pub fn socket_addr(self, host: IpAddr) -> SocketAddr {
        SocketAddr::new(host, self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = DfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u16>().map(NodeId).map_err(|_| DfsError::Protocol)
    }
}

impl From<u16> for NodeId {
    fn from(port: u16) -> Self {
        NodeId(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_node_id_parse_display() {
        let nid: NodeId = "8001".parse().unwrap();
        assert_eq!(nid, NodeId(8001));
        assert_eq!(nid.to_string(), "8001");
        assert_eq!("x".parse::<NodeId>(), Err(DfsError::Protocol));
        assert_eq!("70000".parse::<NodeId>(), Err(DfsError::Protocol));
    }

    #[test]
    fn test_node_id_socket_addr() {
        let addr = NodeId(9000).socket_addr(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(addr.to_string(), "127.0.0.1:9000");
    }
}
