use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Largest payload the wrapper will send or receive in one message.
/// This is a property of the wrapper, not a negotiated protocol value.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Listen backlog for TCP-server endpoints.
pub(crate) const LISTEN_BACKLOG: i32 = 5;

/// Upper bound on one accept-loop iteration, so shutdown latency stays bounded.
pub(crate) const LISTEN_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on one client write, so a peer that stops reading cannot
/// hold the registry lock indefinitely.
pub(crate) const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket kinds supported by an [`Endpoint`](crate::Endpoint).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    TcpServer,
    TcpClient,
    UdpServer,
    UdpClient,
    Icmp,
}

impl SocketKind {
    pub fn is_tcp(&self) -> bool {
        matches!(self, SocketKind::TcpServer | SocketKind::TcpClient)
    }

    pub fn is_server(&self) -> bool {
        matches!(self, SocketKind::TcpServer | SocketKind::UdpServer)
    }

    pub fn is_icmp(&self) -> bool {
        matches!(self, SocketKind::Icmp)
    }
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SocketKind::TcpServer => "TCP server",
            SocketKind::TcpClient => "TCP client",
            SocketKind::UdpServer => "UDP server",
            SocketKind::UdpClient => "UDP client",
            SocketKind::Icmp => "ICMP",
        };
        write!(f, "{}", label)
    }
}

/// Opaque identifier for an accepted TCP connection.
///
/// Ids are assigned monotonically per server endpoint; the OS handle
/// behind a connection is never exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub(crate) u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client {}", self.0)
    }
}

/// An owned copy of the latest message received from one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub client: ClientId,
    pub payload: Vec<u8>,
}

/// Result of a receive on a client-driven endpoint kind.
///
/// A zero-byte TCP read is an orderly close by the peer, not an error,
/// so it gets its own variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Data {
        payload: Vec<u8>,
        sender: Option<SocketAddr>,
    },
    Closed,
}

/// Outcome of a bounded readiness wait on the endpoint's socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketReadiness {
    pub readable: bool,
    pub error_or_hangup: bool,
}
