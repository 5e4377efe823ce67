//! Connection peers

use std::net::SocketAddr;

/// Origin of an API connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peer {
    /// Local client on the unix socket, identified by its peer credentials
    Unix { pid: Option<u32>, uid: Option<u32> },
    /// Client on the TCP socket
    Tcp(SocketAddr),
}

impl Peer {
    /// Identity used when no owner can be resolved for the peer
    pub fn fallback_identity(&self) -> String {
        match self {
            Peer::Unix { uid: Some(uid), .. } => format!("uid:{}", uid),
            Peer::Unix { uid: None, .. } => "local".to_string(),
            Peer::Tcp(addr) => addr.ip().to_string(),
        }
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Peer::Unix { pid: Some(pid), .. } => write!(f, "unix:pid={}", pid),
            Peer::Unix { pid: None, .. } => write!(f, "unix"),
            Peer::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}
