//! The endpoint façade: owns the OS socket, orchestrates creation,
//! binding, connecting and listening, and exposes every public
//! operation of the wrapper.

use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use futures::future::join_all;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::core::accept::accept_loop;
use crate::core::error::{SocketError, SocketResult};
use crate::core::registry::ServerState;
use crate::core::resolver::{assemble_address, best_local_address};
use crate::core::sink::{LogSink, StdoutSink};
use crate::core::types::{
    ClientId, Message, Received, SocketKind, SocketReadiness, LISTEN_BACKLOG, MAX_MESSAGE_SIZE,
    SEND_TIMEOUT,
};

enum Inner {
    TcpServer(ServerHandle),
    TcpClient(TcpStream),
    Udp(UdpSocket),
    Icmp(Socket),
}

struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
}

/// A socket endpoint of one of the five supported kinds.
///
/// For TCP servers, `create` spawns a background accept loop that feeds
/// the client registry and receive queue; consumers drain it through
/// `wait_for_client_data` / `take_latest_message` and send through
/// `unicast_send` / `broadcast_send`. The other kinds are driven
/// synchronously by whichever task calls their operations.
///
/// `destroy` tears everything down and leaves the endpoint reusable via
/// another `create`.
pub struct Endpoint {
    kind: SocketKind,
    sink: Arc<dyn LogSink>,
    inner: Mutex<Option<Inner>>,
    state: Arc<ServerState>,
    last_error: StdMutex<Option<String>>,
}

impl Endpoint {
    /// Endpoint logging its diagnostics to stdout.
    pub fn new(kind: SocketKind) -> Self {
        Self::with_sink(kind, Arc::new(StdoutSink))
    }

    /// Endpoint with an injected diagnostics sink.
    pub fn with_sink(kind: SocketKind, sink: Arc<dyn LogSink>) -> Self {
        Self {
            kind,
            sink,
            inner: Mutex::new(None),
            state: Arc::new(ServerState::new()),
            last_error: StdMutex::new(None),
        }
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    /// The most recent failure line, if any operation has failed.
    pub fn last_error_string(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|last| last.clone())
    }

    /// Constructs the OS socket for the configured kind. ICMP endpoints
    /// are complete after raw-socket creation; TCP clients connect to
    /// `(target, port)`; servers and UDP endpoints bind to `port` on the
    /// best local interface for `target` (wildcard when `target` is
    /// empty or matches no interface).
    pub async fn create(&self, port: u16, target: &str) -> SocketResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.is_some() {
            return Err(self.fail(SocketError::AlreadyCreated));
        }

        let built = match self.kind {
            SocketKind::TcpServer => self.create_tcp_server(port, target).await?,
            SocketKind::TcpClient => self.create_tcp_client(port, target).await?,
            SocketKind::UdpServer | SocketKind::UdpClient => self.create_udp(port, target)?,
            SocketKind::Icmp => self.create_icmp()?,
        };

        *inner = Some(built);
        Ok(())
    }

    /// Stops the accept loop (TCP server), drops all connection state and
    /// releases the OS socket. Idempotent, and safe to call while other
    /// tasks are blocked in `wait_for_client_data`: they wake and observe
    /// the torn-down state.
    pub async fn destroy(&self) {
        let mut inner = self.inner.lock().await;

        self.state.shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
        self.state.data_ready.notify_waiters();

        match inner.take() {
            Some(Inner::TcpServer(handle)) => {
                // Receivers may all be gone already; that's fine
                let _ = handle.shutdown_tx.send(());
                let _ = handle.accept_task.await;

                let tasks = self.state.drain_tasks().await;
                for result in join_all(tasks).await {
                    // Aborted reader tasks surface as cancelled joins
                    let _ = result;
                }

                self.state.clear().await;
                self.sink
                    .write_line(&format!("{} on {} destroyed", self.kind, handle.local_addr));
            }
            Some(_) => {
                self.sink.write_line(&format!("{} socket destroyed", self.kind));
            }
            None => {}
        }
    }

    /// Bound or connected address of a created endpoint. The OS handle
    /// itself stays private; this is the endpoint's public identity.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match self.inner.lock().await.as_ref()? {
            Inner::TcpServer(handle) => Some(handle.local_addr),
            Inner::TcpClient(stream) => stream.local_addr().ok(),
            Inner::Udp(socket) => socket.local_addr().ok(),
            Inner::Icmp(socket) => socket.local_addr().ok().and_then(|addr| addr.as_socket()),
        }
    }

    /// Blocking-mode control for the raw ICMP socket. The tokio runtime
    /// owns the blocking mode of every other kind.
    pub async fn set_blocking(&self, blocking: bool) -> SocketResult<()> {
        let inner = self.inner.lock().await;
        match inner.as_ref() {
            Some(Inner::Icmp(socket)) => socket.set_nonblocking(!blocking).map_err(|e| {
                self.fail(SocketError::Option(format!(
                    "blocking mode change failed: {}",
                    e
                )))
            }),
            Some(_) => Err(self.fail(SocketError::Unsupported(
                "blocking mode is managed by the runtime for this kind",
            ))),
            None => Err(self.fail(SocketError::NotCreated)),
        }
    }

    pub async fn set_ttl(&self, ttl: u32) -> SocketResult<()> {
        self.with_sock_ref(|sock| sock.set_ttl(ttl)).await
    }

    pub async fn set_broadcast(&self, broadcast: bool) -> SocketResult<()> {
        self.with_sock_ref(|sock| sock.set_broadcast(broadcast)).await
    }

    async fn with_sock_ref(
        &self,
        apply: impl FnOnce(SockRef<'_>) -> std::io::Result<()>,
    ) -> SocketResult<()> {
        let inner = self.inner.lock().await;
        let result = match inner.as_ref() {
            Some(Inner::TcpClient(stream)) => apply(SockRef::from(stream)),
            Some(Inner::Udp(socket)) => apply(SockRef::from(socket)),
            Some(Inner::Icmp(socket)) => apply(SockRef::from(socket)),
            Some(Inner::TcpServer(_)) => {
                return Err(self.fail(SocketError::Unsupported(
                    "listener options are fixed at create time",
                )))
            }
            None => return Err(self.fail(SocketError::NotCreated)),
        };
        result.map_err(|e| self.fail(SocketError::Option(e.to_string())))
    }

    /// Bounded readiness wait on the endpoint's own socket. Timeout is
    /// not an error: it reports back as not readable.
    pub async fn wait_for_socket(&self, timeout_dur: Duration) -> SocketResult<SocketReadiness> {
        let inner = self.inner.lock().await;
        match inner.as_ref() {
            Some(Inner::TcpClient(stream)) => {
                self.await_readable(timeout_dur, stream.ready(Interest::READABLE))
                    .await
            }
            Some(Inner::Udp(socket)) => {
                self.await_readable(timeout_dur, socket.ready(Interest::READABLE))
                    .await
            }
            Some(Inner::Icmp(socket)) => self.poll_raw_socket(socket, timeout_dur).await,
            Some(Inner::TcpServer(_)) => Err(self.fail(SocketError::Unsupported(
                "use wait_for_client_data on a TCP server",
            ))),
            None => Err(self.fail(SocketError::NotCreated)),
        }
    }

    async fn await_readable(
        &self,
        timeout_dur: Duration,
        ready: impl std::future::Future<Output = std::io::Result<tokio::io::Ready>>,
    ) -> SocketResult<SocketReadiness> {
        match tokio::time::timeout(timeout_dur, ready).await {
            Err(_) => Ok(SocketReadiness::default()),
            Ok(Ok(ready)) => Ok(SocketReadiness {
                readable: ready.is_readable(),
                error_or_hangup: ready.is_error() || ready.is_read_closed(),
            }),
            Ok(Err(e)) => Err(self.fail(SocketError::Receive(format!(
                "readiness wait failed: {}",
                e
            )))),
        }
    }

    /// The raw fd is not registered with the reactor, so the wait is a
    /// classic poll(); it runs on the blocking pool to keep the executor
    /// threads free.
    async fn poll_raw_socket(
        &self,
        socket: &Socket,
        timeout_dur: Duration,
    ) -> SocketResult<SocketReadiness> {
        let millis = timeout_dur.as_millis().min(i32::MAX as u128) as i32;
        let poll_timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);
        let socket = socket
            .try_clone()
            .map_err(|e| self.fail(SocketError::Receive(format!("fd clone failed: {}", e))))?;

        let polled = tokio::task::spawn_blocking(move || {
            let mut fds = [PollFd::new(socket.as_fd(), PollFlags::POLLIN)];
            poll(&mut fds, poll_timeout).map(|n| {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                SocketReadiness {
                    readable: n > 0 && revents.contains(PollFlags::POLLIN),
                    error_or_hangup: revents
                        .intersects(PollFlags::POLLERR | PollFlags::POLLHUP),
                }
            })
        })
        .await;

        match polled {
            Ok(Ok(readiness)) => Ok(readiness),
            Ok(Err(e)) => Err(self.fail(SocketError::Receive(format!("poll failed: {}", e)))),
            Err(e) => Err(self.fail(SocketError::Receive(format!("poll task failed: {}", e)))),
        }
    }

    /// Blocks until some client has an unconsumed message or the timeout
    /// elapses. Returns immediately once the endpoint is destroyed.
    pub async fn wait_for_client_data(&self, timeout_dur: Duration) -> bool {
        let deadline = Instant::now() + timeout_dur;

        loop {
            let notified = self.state.data_ready.notified();
            tokio::pin!(notified);
            // Register for a wake-up before checking, so a store between
            // the check and the await is not lost
            notified.as_mut().enable();

            if !self.state.shared.lock().await.rcv_queue.is_empty() {
                return true;
            }
            if self.state.shutdown.load(std::sync::atomic::Ordering::SeqCst) {
                return false;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return !self.state.shared.lock().await.rcv_queue.is_empty();
            }
        }
    }

    /// Next client with an unconsumed message and that message's size,
    /// without consuming it. TCP server only.
    pub async fn pending_message(&self) -> Option<(ClientId, usize)> {
        if self.kind != SocketKind::TcpServer {
            return None;
        }
        self.state.pending_message().await
    }

    /// Pops the receive queue and returns an owned copy of the front
    /// client's latest message. TCP server only.
    pub async fn take_latest_message(&self) -> Option<Message> {
        if self.kind != SocketKind::TcpServer {
            return None;
        }
        self.state.take_latest_message().await
    }

    /// Receives one message on a client-driven endpoint kind. TCP servers
    /// consume through `take_latest_message` instead.
    pub async fn receive(&self) -> SocketResult<Received> {
        let mut inner = self.inner.lock().await;
        match inner.as_mut() {
            Some(Inner::TcpClient(stream)) => {
                let mut buf = [0u8; MAX_MESSAGE_SIZE];
                match stream.read(&mut buf).await {
                    Ok(0) => {
                        self.sink.write_line("partner closed the connection");
                        Ok(Received::Closed)
                    }
                    Ok(n) => Ok(Received::Data {
                        payload: buf[..n].to_vec(),
                        sender: None,
                    }),
                    Err(e) => Err(self.fail(SocketError::Receive(e.to_string()))),
                }
            }
            Some(Inner::Udp(socket)) => {
                let mut buf = [0u8; MAX_MESSAGE_SIZE];
                let (n, sender) = socket
                    .recv_from(&mut buf)
                    .await
                    .map_err(|e| self.fail(SocketError::Receive(e.to_string())))?;
                Ok(Received::Data {
                    payload: buf[..n].to_vec(),
                    sender: Some(sender),
                })
            }
            Some(Inner::Icmp(socket)) => {
                let mut buf = [MaybeUninit::<u8>::uninit(); MAX_MESSAGE_SIZE];
                match socket.recv_from(&mut buf) {
                    Ok((n, sender)) => {
                        // The kernel initialised the first n bytes
                        let payload = buf[..n]
                            .iter()
                            .map(|byte| unsafe { byte.assume_init() })
                            .collect();
                        Ok(Received::Data {
                            payload,
                            sender: sender.as_socket(),
                        })
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        Err(SocketError::WouldBlock)
                    }
                    Err(e) => Err(self.fail(SocketError::Receive(e.to_string()))),
                }
            }
            Some(Inner::TcpServer(_)) => Err(self.fail(SocketError::Unsupported(
                "use take_latest_message on a TCP server",
            ))),
            None => Err(self.fail(SocketError::NotCreated)),
        }
    }

    /// TCP send. On a client endpoint, writes to the connected server; on
    /// a server endpoint this is a broadcast to every client.
    pub async fn send(&self, payload: &[u8]) -> SocketResult<()> {
        if self.kind == SocketKind::TcpServer {
            return self.broadcast_send(payload).await;
        }
        self.check_payload(payload)?;

        let mut inner = self.inner.lock().await;
        match inner.as_mut() {
            Some(Inner::TcpClient(stream)) => stream
                .write_all(payload)
                .await
                .map_err(|e| self.fail(SocketError::Send(e.to_string()))),
            Some(_) => Err(self.fail(SocketError::Unsupported(
                "use udp_send on datagram endpoints",
            ))),
            None => Err(self.fail(SocketError::NotCreated)),
        }
    }

    /// Writes to a single connected client. A failure increments that
    /// client's failed-send counter; success resets it to zero. Failures
    /// are never retried internally.
    pub async fn unicast_send(&self, id: ClientId, payload: &[u8]) -> SocketResult<()> {
        if self.kind != SocketKind::TcpServer {
            return Err(self.fail(SocketError::Unsupported(
                "unicast_send requires a TCP server",
            )));
        }
        self.check_payload(payload)?;

        let mut shared = self.state.shared.lock().await;
        let client = match shared.clients.get_mut(&id) {
            Some(client) => client,
            None => return Err(self.fail(SocketError::UnknownClient(id))),
        };

        match write_bounded(&mut client.writer, payload).await {
            Ok(()) => {
                client.failed_sends = 0;
                Ok(())
            }
            Err(e) => {
                client.failed_sends = client.failed_sends.saturating_add(1);
                Err(self.fail(SocketError::Send(format!("send to {} failed: {}", id, e))))
            }
        }
    }

    /// Attempts a write to every connected client. Fails if any write
    /// fails, and also when there is no client at all to write to; the
    /// two cases are distinguishable by error variant.
    pub async fn broadcast_send(&self, payload: &[u8]) -> SocketResult<()> {
        if self.kind != SocketKind::TcpServer {
            return Err(self.fail(SocketError::Unsupported(
                "broadcast_send requires a TCP server",
            )));
        }
        self.check_payload(payload)?;

        let mut shared = self.state.shared.lock().await;
        if shared.clients.is_empty() {
            return Err(self.fail(SocketError::NoClients));
        }

        let total = shared.clients.len();
        let mut failures = 0usize;
        for (id, client) in shared.clients.iter_mut() {
            match write_bounded(&mut client.writer, payload).await {
                Ok(()) => client.failed_sends = 0,
                Err(e) => {
                    client.failed_sends = client.failed_sends.saturating_add(1);
                    failures += 1;
                    self.sink
                        .write_line(&format!("broadcast to {} failed: {}", id, e));
                }
            }
        }

        if failures > 0 {
            Err(self.fail(SocketError::Send(format!(
                "{} of {} broadcast sends failed",
                failures, total
            ))))
        } else {
            Ok(())
        }
    }

    /// Best-effort datagram send to `(target, port)`. UDP and ICMP only;
    /// for ICMP the port is carried but meaningless to the protocol.
    pub async fn udp_send(&self, target: &str, port: u16, payload: &[u8]) -> SocketResult<()> {
        if self.kind.is_tcp() {
            return Err(self.fail(SocketError::Unsupported(
                "udp_send requires a datagram or ICMP endpoint",
            )));
        }
        self.check_payload(payload)?;
        let addr = assemble_address(port, target).map_err(|e| self.fail(e))?;

        let inner = self.inner.lock().await;
        let sent = match inner.as_ref() {
            Some(Inner::Udp(socket)) => socket
                .send_to(payload, addr)
                .await
                .map_err(|e| self.fail(SocketError::Send(format!("to {}: {}", addr, e))))?,
            Some(Inner::Icmp(socket)) => socket
                .send_to(payload, &SockAddr::from(addr))
                .map_err(|e| self.fail(SocketError::Send(format!("to {}: {}", addr, e))))?,
            Some(_) => {
                return Err(self.fail(SocketError::Unsupported(
                    "udp_send requires a datagram or ICMP endpoint",
                )))
            }
            None => return Err(self.fail(SocketError::NotCreated)),
        };

        if sent != payload.len() {
            return Err(self.fail(SocketError::Send(format!(
                "wrong number of bytes sent to {}: {} of {}",
                addr,
                sent,
                payload.len()
            ))));
        }
        Ok(())
    }

    /// Whether the client id is still registered. TCP server only.
    pub async fn is_connected(&self, id: ClientId) -> bool {
        self.kind == SocketKind::TcpServer && self.state.is_connected(id).await
    }

    /// Peer address of a connected client. TCP server only.
    pub async fn client_address(&self, id: ClientId) -> Option<SocketAddr> {
        if self.kind != SocketKind::TcpServer {
            return None;
        }
        self.state.client_address(id).await
    }

    /// Consecutive failed sends to this client since the last success.
    pub async fn failed_send_count(&self, id: ClientId) -> u16 {
        if self.kind != SocketKind::TcpServer {
            return 0;
        }
        self.state.failed_send_count(id).await
    }

    /// Number of currently connected clients. TCP server only.
    pub async fn connection_count(&self) -> usize {
        if self.kind != SocketKind::TcpServer {
            return 0;
        }
        self.state.connection_count().await
    }

    /// Kills the connection to one client: stops its reader task and
    /// removes it from the registry and queue. A no-op for unknown ids.
    pub async fn drop_client(&self, id: ClientId) {
        if self.kind != SocketKind::TcpServer {
            return;
        }
        if let Some(task) = self.state.take_task(id).await {
            task.abort();
        }
        if self.state.remove_client(id).await {
            self.sink.write_line(&format!("{} dropped", id));
        }
    }

    async fn create_tcp_server(&self, port: u16, target: &str) -> SocketResult<Inner> {
        let socket = self.new_raw_socket(Type::STREAM, Protocol::TCP)?;

        // Reuse the address so a destroyed endpoint can rebind immediately
        socket.set_reuse_address(true).map_err(|e| {
            self.fail(SocketError::Option(format!("SO_REUSEADDR failed: {}", e)))
        })?;

        let addr = self.bind_address(port, target)?;
        socket
            .bind(&SockAddr::from(addr))
            .map_err(|e| self.fail(SocketError::Bind(format!("to {}: {}", addr, e))))?;
        socket
            .listen(LISTEN_BACKLOG)
            .map_err(|e| self.fail(SocketError::Listen(e.to_string())))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| self.fail(SocketError::Option(e.to_string())))?;

        let listener = TcpListener::from_std(socket.into())
            .map_err(|e| self.fail(SocketError::Create(e.to_string())))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| self.fail(SocketError::Create(e.to_string())))?;

        self.sink
            .write_line(&format!("{} bound to {} and listening", self.kind, local_addr));

        self.state.reset().await;
        let (shutdown_tx, _) = broadcast::channel(1);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.state.clone(),
            self.sink.clone(),
            shutdown_tx.clone(),
        ));

        Ok(Inner::TcpServer(ServerHandle {
            local_addr,
            shutdown_tx,
            accept_task,
        }))
    }

    async fn create_tcp_client(&self, port: u16, target: &str) -> SocketResult<Inner> {
        let addr = assemble_address(port, target).map_err(|e| self.fail(e))?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| self.fail(SocketError::Connect(format!("to {}: {}", addr, e))))?;
        self.sink
            .write_line(&format!("{} connected to {}", self.kind, addr));
        Ok(Inner::TcpClient(stream))
    }

    fn create_udp(&self, port: u16, target: &str) -> SocketResult<Inner> {
        let socket = self.new_raw_socket(Type::DGRAM, Protocol::UDP)?;

        let addr = self.bind_address(port, target)?;
        socket
            .bind(&SockAddr::from(addr))
            .map_err(|e| self.fail(SocketError::Bind(format!("to {}: {}", addr, e))))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| self.fail(SocketError::Option(e.to_string())))?;

        let socket = UdpSocket::from_std(socket.into())
            .map_err(|e| self.fail(SocketError::Create(e.to_string())))?;
        if let Ok(local) = socket.local_addr() {
            self.sink.write_line(&format!("{} bound to {}", self.kind, local));
        }
        Ok(Inner::Udp(socket))
    }

    fn create_icmp(&self) -> SocketResult<Inner> {
        // Raw socket; creation alone completes an ICMP endpoint. Usually
        // needs elevated privileges.
        let socket = self.new_raw_socket(Type::RAW, Protocol::ICMPV4)?;
        socket
            .set_nonblocking(true)
            .map_err(|e| self.fail(SocketError::Option(e.to_string())))?;
        self.sink.write_line("raw ICMP socket created");
        Ok(Inner::Icmp(socket))
    }

    fn new_raw_socket(&self, ty: Type, protocol: Protocol) -> SocketResult<Socket> {
        Socket::new(Domain::IPV4, ty, Some(protocol)).map_err(|e| {
            self.fail(SocketError::Create(format!("{} socket: {}", self.kind, e)))
        })
    }

    /// Bind address for servers and UDP endpoints: the best local
    /// interface for the target, else the wildcard.
    fn bind_address(&self, port: u16, target: &str) -> SocketResult<SocketAddr> {
        let local = best_local_address(target)
            .map(|ip| ip.to_string())
            .unwrap_or_default();
        assemble_address(port, &local).map_err(|e| self.fail(e))
    }

    fn check_payload(&self, payload: &[u8]) -> SocketResult<()> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(self.fail(SocketError::PayloadTooLarge(payload.len())));
        }
        Ok(())
    }

    /// Logs a failure through the sink, remembers it for
    /// `last_error_string`, and hands the error back for propagation.
    fn fail(&self, err: SocketError) -> SocketError {
        let line = err.to_string();
        self.sink.write_line(&line);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(line);
        }
        err
    }
}

/// Bounded write to one client. A write that makes no progress within the
/// bound may have delivered a partial payload; it counts as failed either
/// way.
async fn write_bounded(writer: &mut OwnedWriteHalf, payload: &[u8]) -> Result<(), String> {
    match tokio::time::timeout(SEND_TIMEOUT, writer.write_all(payload)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("no progress within {:?}", SEND_TIMEOUT)),
    }
}
