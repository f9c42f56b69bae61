use std::fmt;

use crate::core::types::ClientId;

/// Error type for endpoint operations.
///
/// Every OS-call failure is caught at its call site, logged through the
/// endpoint's sink, and surfaced as one of these variants; nothing in
/// this crate panics on a socket error.
#[derive(Debug)]
pub enum SocketError {
    Create(String),
    Bind(String),
    Connect(String),
    Listen(String),
    Option(String),
    Send(String),
    Receive(String),
    InvalidAddress(String),
    PayloadTooLarge(usize),
    UnknownClient(ClientId),
    /// Broadcast requested but no client was connected to write to.
    NoClients,
    /// Non-blocking operation had nothing to do right now.
    WouldBlock,
    Unsupported(&'static str),
    NotCreated,
    AlreadyCreated,
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketError::Create(msg) => write!(f, "socket creation failed: {}", msg),
            SocketError::Bind(msg) => write!(f, "bind failed: {}", msg),
            SocketError::Connect(msg) => write!(f, "connect failed: {}", msg),
            SocketError::Listen(msg) => write!(f, "listen failed: {}", msg),
            SocketError::Option(msg) => write!(f, "failed to set option: {}", msg),
            SocketError::Send(msg) => write!(f, "send failed: {}", msg),
            SocketError::Receive(msg) => write!(f, "receive failed: {}", msg),
            SocketError::InvalidAddress(addr) => write!(f, "invalid address: {}", addr),
            SocketError::PayloadTooLarge(size) => {
                write!(f, "payload of {} bytes exceeds the maximum message size", size)
            }
            SocketError::UnknownClient(id) => write!(f, "{} is not connected", id),
            SocketError::NoClients => write!(f, "no connected clients to send to"),
            SocketError::WouldBlock => write!(f, "operation would block"),
            SocketError::Unsupported(msg) => write!(f, "unsupported for this socket kind: {}", msg),
            SocketError::NotCreated => write!(f, "endpoint has not been created"),
            SocketError::AlreadyCreated => write!(f, "endpoint is already created"),
        }
    }
}

impl std::error::Error for SocketError {}

/// Result type for endpoint operations.
pub type SocketResult<T> = Result<T, SocketError>;
