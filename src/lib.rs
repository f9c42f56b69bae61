/*!
 *********************************************************
 *                     sockpoint
 *      A socket endpoint abstraction for TCP server,
 *      TCP client, UDP server/client and raw ICMP
 *      sockets, with a background accept loop and
 *      per-client receive buffering for TCP servers.
 * -----------------------------------------------------
 * Features:
 *   - One `Endpoint` type covering all five socket kinds.
 *   - Background accept/read loop feeding a shared
 *     client registry and receive queue.
 *   - Unicast and broadcast sends with per-client
 *     failed-send counters.
 *   - Local interface enumeration and best-interface
 *     selection for binds.
 *********************************************************
 */

pub mod core;

// Re-export the public surface at the crate root
pub use crate::core::endpoint::Endpoint;
pub use crate::core::error::{SocketError, SocketResult};
pub use crate::core::resolver::{
    assemble_address, best_local_address, broadcast_address, enumerate_local_addresses,
};
pub use crate::core::sink::{FileSink, LogSink, MemorySink, StdoutSink};
pub use crate::core::types::{
    ClientId, Message, Received, SocketKind, SocketReadiness, MAX_MESSAGE_SIZE,
};
