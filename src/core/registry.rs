//! Shared connection state for TCP-server endpoints: the client registry
//! and the receive queue, guarded by a single lock.
//!
//! One coarse lock over both structures is a deliberate simplicity choice
//! for the small connection counts this wrapper targets.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::core::types::{ClientId, Message, MAX_MESSAGE_SIZE};

/// One accepted TCP peer. The buffer holds only the most recently read
/// message; the accept loop overwrites it on every read.
pub(crate) struct ClientConnection {
    pub peer: SocketAddr,
    pub writer: OwnedWriteHalf,
    pub buffer: Vec<u8>,
    pub message_size: usize,
    pub failed_sends: u16,
}

pub(crate) struct Shared {
    pub clients: HashMap<ClientId, ClientConnection>,
    pub rcv_queue: VecDeque<ClientId>,
}

/// State shared between the accept loop, its reader tasks, and consumer
/// calls on the endpoint.
pub(crate) struct ServerState {
    pub shared: Mutex<Shared>,
    pub data_ready: Notify,
    pub shutdown: AtomicBool,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<ClientId, JoinHandle<()>>>,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            shared: Mutex::new(Shared {
                clients: HashMap::new(),
                rcv_queue: VecDeque::new(),
            }),
            data_ready: Notify::new(),
            shutdown: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Prepares the state for a fresh `create` after a `destroy`.
    pub async fn reset(&self) {
        self.clear().await;
        self.shutdown.store(false, Ordering::SeqCst);
    }

    pub async fn clear(&self) {
        let mut shared = self.shared.lock().await;
        shared.clients.clear();
        shared.rcv_queue.clear();
    }

    pub async fn register(&self, peer: SocketAddr, writer: OwnedWriteHalf) -> ClientId {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut shared = self.shared.lock().await;
        shared.clients.insert(
            id,
            ClientConnection {
                peer,
                writer,
                buffer: Vec::with_capacity(MAX_MESSAGE_SIZE),
                message_size: 0,
                failed_sends: 0,
            },
        );
        id
    }

    pub async fn track_task(&self, id: ClientId, handle: JoinHandle<()>) {
        self.tasks.lock().await.insert(id, handle);
    }

    pub async fn take_task(&self, id: ClientId) -> Option<JoinHandle<()>> {
        self.tasks.lock().await.remove(&id)
    }

    pub async fn drain_tasks(&self) -> Vec<JoinHandle<()>> {
        self.tasks.lock().await.drain().map(|(_, h)| h).collect()
    }

    /// Overwrites the client's buffer with the latest message and marks it
    /// ready for consumption. A connection carries at most one pending
    /// queue entry; a second read before consumption replaces the payload
    /// without enqueueing a duplicate id. Returns false if the client has
    /// already been removed.
    pub async fn store_message(&self, id: ClientId, data: &[u8]) -> bool {
        {
            let mut shared = self.shared.lock().await;
            let client = match shared.clients.get_mut(&id) {
                Some(client) => client,
                None => return false,
            };
            client.buffer.clear();
            client.buffer.extend_from_slice(data);
            client.message_size = data.len();
            if !shared.rcv_queue.contains(&id) {
                shared.rcv_queue.push_back(id);
            }
        }
        self.data_ready.notify_one();
        true
    }

    /// Removes a connection from the registry and the queue. Idempotent:
    /// both the reader task (on disconnect) and a consumer (explicit drop)
    /// may race to remove the same id.
    pub async fn remove_client(&self, id: ClientId) -> bool {
        let mut shared = self.shared.lock().await;
        let removed = shared.clients.remove(&id).is_some();
        shared.rcv_queue.retain(|queued| *queued != id);
        removed
    }

    /// Peeks the front of the receive queue: the next client with an
    /// unconsumed message, and that message's size.
    pub async fn pending_message(&self) -> Option<(ClientId, usize)> {
        let mut shared = self.shared.lock().await;
        while let Some(id) = shared.rcv_queue.front().copied() {
            match shared.clients.get(&id) {
                Some(client) => return Some((id, client.message_size)),
                None => {
                    shared.rcv_queue.pop_front();
                }
            }
        }
        None
    }

    /// Pops the front of the receive queue and hands back an owned copy of
    /// that client's latest message, captured while the lock is held.
    pub async fn take_latest_message(&self) -> Option<Message> {
        let mut shared = self.shared.lock().await;
        while let Some(id) = shared.rcv_queue.pop_front() {
            if let Some(client) = shared.clients.get(&id) {
                return Some(Message {
                    client: id,
                    payload: client.buffer[..client.message_size].to_vec(),
                });
            }
        }
        None
    }

    pub async fn client_address(&self, id: ClientId) -> Option<SocketAddr> {
        self.shared.lock().await.clients.get(&id).map(|c| c.peer)
    }

    pub async fn connection_count(&self) -> usize {
        self.shared.lock().await.clients.len()
    }

    pub async fn is_connected(&self, id: ClientId) -> bool {
        self.shared.lock().await.clients.contains_key(&id)
    }

    pub async fn failed_send_count(&self, id: ClientId) -> u16 {
        self.shared
            .lock()
            .await
            .clients
            .get(&id)
            .map(|client| client.failed_sends)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_writer() -> (OwnedWriteHalf, SocketAddr, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer_side = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let (_reader, writer) = stream.into_split();
        (writer, peer, peer_side)
    }

    #[test]
    fn store_and_take_round_trip() {
        tokio_test::block_on(async {
            let state = ServerState::new();
            let (writer, peer, _keep) = connected_writer().await;
            let id = state.register(peer, writer).await;

            assert!(state.store_message(id, b"hello").await);
            assert_eq!(state.pending_message().await, Some((id, 5)));

            let msg = state.take_latest_message().await.unwrap();
            assert_eq!(msg.client, id);
            assert_eq!(msg.payload, b"hello");
            assert!(state.take_latest_message().await.is_none());
        });
    }

    #[test]
    fn second_read_overwrites_without_duplicate_entry() {
        tokio_test::block_on(async {
            let state = ServerState::new();
            let (writer, peer, _keep) = connected_writer().await;
            let id = state.register(peer, writer).await;

            assert!(state.store_message(id, b"first").await);
            assert!(state.store_message(id, b"second").await);

            let msg = state.take_latest_message().await.unwrap();
            assert_eq!(msg.payload, b"second");
            assert!(state.take_latest_message().await.is_none());
        });
    }

    #[test]
    fn queue_preserves_arrival_order_across_clients() {
        tokio_test::block_on(async {
            let state = ServerState::new();
            let (writer_a, peer_a, _keep_a) = connected_writer().await;
            let (writer_b, peer_b, _keep_b) = connected_writer().await;
            let a = state.register(peer_a, writer_a).await;
            let b = state.register(peer_b, writer_b).await;

            assert!(state.store_message(b, b"from b").await);
            assert!(state.store_message(a, b"from a").await);

            assert_eq!(state.take_latest_message().await.unwrap().client, b);
            assert_eq!(state.take_latest_message().await.unwrap().client, a);
        });
    }

    #[test]
    fn removal_is_idempotent_and_purges_queue() {
        tokio_test::block_on(async {
            let state = ServerState::new();
            let (writer, peer, _keep) = connected_writer().await;
            let id = state.register(peer, writer).await;
            assert!(state.store_message(id, b"pending").await);

            assert!(state.remove_client(id).await);
            assert!(!state.remove_client(id).await);
            assert!(!state.is_connected(id).await);
            assert!(state.take_latest_message().await.is_none());
            assert_eq!(state.connection_count().await, 0);
        });
    }

    #[test]
    fn store_after_removal_reports_gone() {
        tokio_test::block_on(async {
            let state = ServerState::new();
            let (writer, peer, _keep) = connected_writer().await;
            let id = state.register(peer, writer).await;
            state.remove_client(id).await;
            assert!(!state.store_message(id, b"late").await);
        });
    }
}
