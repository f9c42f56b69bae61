pub mod endpoint;
pub mod error;
pub mod resolver;
pub mod sink;
pub mod types;

pub(crate) mod accept;
pub(crate) mod registry;

// Re-exporting commonly used components
pub use endpoint::Endpoint;
pub use error::{SocketError, SocketResult};
pub use sink::{FileSink, LogSink, MemorySink, StdoutSink};
pub use types::{ClientId, Message, Received, SocketKind, SocketReadiness, MAX_MESSAGE_SIZE};
