//! Background accept loop for TCP-server endpoints.
//!
//! The accept task multiplexes new connections; each accepted connection
//! gets its own reader task feeding the shared registry and receive
//! queue. Within one connection reads stay strictly ordered; across
//! connections no ordering is guaranteed.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::core::registry::ServerState;
use crate::core::sink::LogSink;
use crate::core::types::{ClientId, LISTEN_POLL_TIMEOUT, MAX_MESSAGE_SIZE};

pub(crate) async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    sink: Arc<dyn LogSink>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = timeout(LISTEN_POLL_TIMEOUT, listener.accept()) => {
                match accepted {
                    Ok(Ok((stream, peer))) => {
                        let (reader, writer) = stream.into_split();
                        let id = state.register(peer, writer).await;
                        sink.write_line(&format!("accepted connection from {} as {}", peer, id));

                        let task = tokio::spawn(serve_client(
                            id,
                            reader,
                            state.clone(),
                            sink.clone(),
                            shutdown_tx.subscribe(),
                        ));
                        state.track_task(id, task).await;
                    }
                    Ok(Err(e)) => {
                        // Not fatal; keep the loop alive
                        sink.write_line(&format!("failed to accept connection: {}", e));
                    }
                    Err(_) => {
                        // Quiet window elapsed; loop around and re-check shutdown
                    }
                }
            }
        }
    }

    sink.write_line("listener loop stopped");
}

/// Reads from one connection until the peer closes, an error occurs, or
/// shutdown is signalled. Each successful read overwrites the client's
/// buffer with the latest message.
async fn serve_client(
    id: ClientId,
    mut reader: OwnedReadHalf,
    state: Arc<ServerState>,
    sink: Arc<dyn LogSink>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut buf = [0u8; MAX_MESSAGE_SIZE];

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        retire(&state, &sink, id, "disconnected").await;
                        return;
                    }
                    Ok(n) => {
                        if !state.store_message(id, &buf[..n]).await {
                            // Dropped by a consumer while we were reading
                            return;
                        }
                    }
                    Err(e) => {
                        retire(&state, &sink, id, &format!("read failed: {}", e)).await;
                        return;
                    }
                }
            }
        }
    }
}

async fn retire(state: &Arc<ServerState>, sink: &Arc<dyn LogSink>, id: ClientId, reason: &str) {
    // Remove our own task entry without aborting ourselves
    state.take_task(id).await;
    if state.remove_client(id).await {
        sink.write_line(&format!("{} {}", id, reason));
    }
}
