//! Server engine - accept loop, per-client receive loops, dispatch.
//!
//! The engine services the reserved commands itself (PING echo, CONNECT
//! handshake, DISCONNECT teardown) and routes user commands through the
//! shared [`CommandRegistry`]. Each TCP client gets a dedicated writer
//! task and a dispatch task: the receive loop never blocks on user code,
//! while completed frames still dispatch in receive order per peer. UDP
//! shares one socket; datagrams dispatch in arrival order with no
//! reordering.
//!
//! # Example
//!
//! ```ignore
//! use netwire::server::Server;
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Echo { text: String }
//!
//! let server = Server::builder()
//!     .on_client_connected(|client| println!("hello {}", client.peer()))
//!     .build();
//! server.add_command::<Echo>(&[1])?;
//! server.add_data_received(1, |msg, echo: &Echo| {
//!     println!("{} says {}", msg.peer, echo.text);
//!     true
//! })?;
//! let addr = server.run("127.0.0.1:4700".parse()?).await?;
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::clients::{ClientState, ClientTable, FrameSink};
use crate::error::{DisconnectReason, NetwireError, Result, SendError};
use crate::pool::BytePool;
use crate::protocol::{
    commands, ClientInfo, CompressionMode, Frame, FrameDecoder, FrameEncoder, Framer,
    UdpAssignment, CLOSE_TIMEOUT, REASSEMBLY_TTL, TCP_PAYLOAD_SIZE_MAX, UDP_PAYLOAD_SIZE_MAX,
};
use crate::reassembly::Reassembler;
use crate::registry::{CommandRegistry, HandlerId, InboundMessage};
use crate::writer::{spawn_writer_task, WriterConfig};

/// Engine state bit: accepting and reading.
pub const READY_RECEIVE: u8 = 0b01;

/// Engine state bit: sends allowed.
pub const READY_SEND: u8 = 0b10;

/// Socket read buffer size per client.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Queued-but-undispatched messages per peer before the receive loop
/// waits.
const DISPATCH_QUEUE_SIZE: usize = 256;

/// Tunables for a server engine.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Largest payload carried by one unchunked frame. Clamped to the
    /// transport maximum at `run` time.
    pub max_payload_size: usize,
    /// Per-client ring buffer capacity (TCP).
    pub ring_capacity: usize,
    /// Outbound payload compression.
    pub compression: CompressionMode,
    /// Per-connection writer tuning.
    pub writer: WriterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_payload_size: TCP_PAYLOAD_SIZE_MAX,
            ring_capacity: 256 * 1024,
            compression: CompressionMode::None,
            writer: WriterConfig::default(),
        }
    }
}

type ConnectedHandler = Box<dyn Fn(&Arc<ClientState>) + Send + Sync>;
type DisconnectedHandler = Box<dyn Fn(SocketAddr, DisconnectReason) + Send + Sync>;
type AcceptFilter = Box<dyn Fn(SocketAddr) -> bool + Send + Sync>;

#[derive(Default)]
struct ServerEvents {
    connected: Option<ConnectedHandler>,
    disconnected: Option<DisconnectedHandler>,
    accept: Option<AcceptFilter>,
}

/// Fluent configuration for a [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    events: ServerEvents,
}

impl ServerBuilder {
    /// Start from defaults.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            events: ServerEvents::default(),
        }
    }

    /// Set the per-frame payload limit.
    pub fn max_payload_size(mut self, bytes: usize) -> Self {
        self.config.max_payload_size = bytes;
        self
    }

    /// Set the per-client ring capacity.
    pub fn ring_capacity(mut self, bytes: usize) -> Self {
        self.config.ring_capacity = bytes;
        self
    }

    /// Enable outbound compression.
    pub fn compression(mut self, mode: CompressionMode) -> Self {
        self.config.compression = mode;
        self
    }

    /// Tune the per-connection writer tasks.
    pub fn writer(mut self, config: WriterConfig) -> Self {
        self.config.writer = config;
        self
    }

    /// Called after a peer's CONNECT is accepted, strictly before its
    /// first user-command dispatch.
    pub fn on_client_connected<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Arc<ClientState>) + Send + Sync + 'static,
    {
        self.events.connected = Some(Box::new(handler));
        self
    }

    /// Called once when a peer leaves, strictly after its last
    /// dispatch.
    pub fn on_client_disconnected<F>(mut self, handler: F) -> Self
    where
        F: Fn(SocketAddr, DisconnectReason) + Send + Sync + 'static,
    {
        self.events.disconnected = Some(Box::new(handler));
        self
    }

    /// Filter CONNECT attempts; returning `false` rejects the peer.
    pub fn accept<F>(mut self, filter: F) -> Self
    where
        F: Fn(SocketAddr) -> bool + Send + Sync + 'static,
    {
        self.events.accept = Some(Box::new(filter));
        self
    }

    /// Finish configuration.
    pub fn build(self) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                config: self.config,
                events: self.events,
                registry: Arc::new(CommandRegistry::new()),
                clients: ClientTable::new(),
                pool: BytePool::new(),
                encoder: OnceLock::new(),
                state: AtomicU8::new(0),
                disposed: AtomicBool::new(false),
                next_packet_id: AtomicU32::new(1),
                shutdown: Mutex::new(None),
            }),
        }
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ServerInner {
    config: ServerConfig,
    events: ServerEvents,
    registry: Arc<CommandRegistry>,
    clients: Arc<ClientTable>,
    pool: BytePool,
    encoder: OnceLock<FrameEncoder>,
    state: AtomicU8,
    disposed: AtomicBool,
    next_packet_id: AtomicU32,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// A message-oriented TCP/UDP server engine.
///
/// Cheaply cloneable; clones drive the same engine.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Start configuring a server.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// The shared command registry.
    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.inner.registry
    }

    /// Register a MessagePack deserializer for `T` under each id.
    pub fn add_command<T>(&self, ids: &[u16]) -> Result<()>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.inner.registry.add_command::<T>(ids)
    }

    /// Remove command registrations.
    pub fn remove_commands(&self, ids: &[u16]) -> bool {
        self.inner.registry.remove_commands(ids)
    }

    /// Subscribe a typed handler to a command id.
    pub fn add_data_received<T, F>(&self, id: u16, handler: F) -> Result<HandlerId>
    where
        T: 'static,
        F: Fn(&InboundMessage, &T) -> bool + Send + Sync + 'static,
    {
        self.inner.registry.add_data_received(id, handler)
    }

    /// Remove a subscribed handler by token.
    pub fn remove_data_received(&self, id: u16, handler: HandlerId) -> bool {
        self.inner.registry.remove_data_received(id, handler)
    }

    /// Current engine state bits.
    pub fn state(&self) -> u8 {
        self.inner.state.load(Ordering::Acquire)
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// Whether [`dispose`](Self::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Bind a TCP listener and start the accept loop.
    ///
    /// Returns the bound address (useful with port 0). The engine is
    /// ready to receive and send when this returns.
    pub async fn run(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.prepare_run(FrameEncoder::tcp(
            self.inner.config.max_payload_size.min(TCP_PAYLOAD_SIZE_MAX),
        ))?;

        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;

        let (tx, rx) = oneshot::channel();
        *self.inner.shutdown.lock() = Some(tx);
        self.inner
            .state
            .store(READY_RECEIVE | READY_SEND, Ordering::Release);

        let server = self.clone();
        tokio::spawn(server.accept_loop(listener, rx));

        info!(%local, "tcp server listening");
        Ok(local)
    }

    /// Bind a UDP socket and start the datagram loop.
    ///
    /// Returns the bound address. UDP clients use the timed reassembler:
    /// lost chunks strand partial messages, which expire after
    /// [`REASSEMBLY_TTL`].
    pub async fn run_udp(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.prepare_run(FrameEncoder::udp(
            self.inner.config.max_payload_size.min(UDP_PAYLOAD_SIZE_MAX),
        ))?;

        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;

        let (tx, rx) = oneshot::channel();
        *self.inner.shutdown.lock() = Some(tx);
        self.inner
            .state
            .store(READY_RECEIVE | READY_SEND, Ordering::Release);

        let server = self.clone();
        tokio::spawn(server.udp_loop(socket, rx));

        info!(%local, "udp server listening");
        Ok(local)
    }

    fn prepare_run(&self, encoder: FrameEncoder) -> Result<()> {
        if self.is_disposed() {
            return Err(NetwireError::Disposed);
        }
        let encoder = encoder.with_compression(self.inner.config.compression);
        self.inner
            .encoder
            .set(encoder)
            .map_err(|_| NetwireError::Misuse("server already running".to_string()))
    }

    fn encoder(&self) -> &FrameEncoder {
        self.inner.encoder.get().expect("engine running")
    }

    /// Send a user or control frame to one connected peer.
    ///
    /// Payloads past the frame limit are fragmented into chunked frames
    /// under a fresh packet id.
    pub async fn send(
        &self,
        peer: SocketAddr,
        command_id: u16,
        payload: &[u8],
    ) -> std::result::Result<(), SendError> {
        self.send_with_response_id(peer, command_id, payload, 0)
            .await
    }

    /// [`send`](Self::send) carrying a correlation id (used to answer a
    /// peer's request).
    pub async fn send_with_response_id(
        &self,
        peer: SocketAddr,
        command_id: u16,
        payload: &[u8],
        response_id: u32,
    ) -> std::result::Result<(), SendError> {
        if self.state() & READY_SEND == 0 {
            return Err(SendError::Invalid);
        }
        let state = self.inner.clients.get(&peer).ok_or(SendError::Disconnected)?;
        self.send_to_state(&state, command_id, payload, response_id)
            .await
    }

    /// Broadcast to every connected peer. Returns how many peers were
    /// reached. The client table is snapshotted under its lock; sends
    /// happen outside it.
    pub async fn send_to_all(&self, command_id: u16, payload: &[u8]) -> usize {
        if self.state() & READY_SEND == 0 {
            return 0;
        }
        let snapshot = self.inner.clients.snapshot();
        let mut reached = 0;
        for state in snapshot {
            match self.send_to_state(&state, command_id, payload, 0).await {
                Ok(()) => reached += 1,
                Err(err) => trace!(peer = %state.peer(), %err, "broadcast send failed"),
            }
        }
        reached
    }

    async fn send_to_state(
        &self,
        state: &Arc<ClientState>,
        command_id: u16,
        payload: &[u8],
        response_id: u32,
    ) -> std::result::Result<(), SendError> {
        let encoder = self.encoder();
        if payload.len() > encoder.max_payload_size() {
            let packet_id = self.allocate_packet_id();
            let frames = encoder.encode_chunks(command_id, response_id, payload, packet_id)?;
            for frame in frames {
                state.send_frame(frame).await?;
            }
            Ok(())
        } else {
            let frame = encoder.encode(command_id, response_id, payload)?;
            state.send_frame(frame).await
        }
    }

    fn allocate_packet_id(&self) -> u32 {
        loop {
            let id = self.inner.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Stop accepting work and drop every client.
    ///
    /// Idempotent. In-flight dispatches finish on their own tasks;
    /// client sockets close with a [`CLOSE_TIMEOUT`] linger (configured
    /// at accept time).
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.state.store(0, Ordering::Release);
        if let Some(tx) = self.inner.shutdown.lock().take() {
            let _ = tx.send(());
        }
        for state in self.inner.clients.drain() {
            state.mark_disconnected();
            state.reassembler().clear();
        }
        info!("server disposed");
    }

    async fn accept_loop(self, listener: TcpListener, mut shutdown: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("accept loop stopped");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if self.state() & READY_RECEIVE == 0 {
                            return;
                        }
                        debug!(%peer, "accepted connection");
                        let server = self.clone();
                        tokio::spawn(server.client_loop(stream, peer));
                    }
                    Err(err) => warn!(%err, "accept failed"),
                },
            }
        }
    }

    async fn client_loop(self, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let _ = stream.set_linger(Some(CLOSE_TIMEOUT));
        let (mut reader, write_half) = stream.into_split();

        let (writer, _writer_task) = spawn_writer_task(write_half, self.inner.config.writer.clone());
        let state = ClientState::new(
            peer,
            self.inner.clients.allocate_client_id(),
            FrameSink::Tcp(writer),
            Reassembler::new(self.inner.pool.clone()),
        );

        // Per-peer dispatch task: handlers run off the receive loop but
        // in receive order.
        let (dispatch_tx, mut dispatch_rx) = mpsc::channel::<InboundMessage>(DISPATCH_QUEUE_SIZE);
        let dispatch_task = {
            let registry = self.inner.registry.clone();
            tokio::spawn(async move {
                while let Some(msg) = dispatch_rx.recv().await {
                    registry.dispatch(&msg);
                }
            })
        };

        let mut framer = Framer::new(
            self.inner.pool.clone(),
            self.inner.config.ring_capacity,
            self.encoder().max_payload_size(),
        );
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let reason = 'receive: loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break DisconnectReason::Graceful,
                Ok(n) => n,
                Err(err) => {
                    debug!(%peer, %err, "read failed");
                    break DisconnectReason::SocketError;
                }
            };
            state.touch();

            for frame in framer.push(&buf[..n]) {
                if let Some(reason) = self.route_frame(&state, frame, &dispatch_tx).await {
                    break 'receive reason;
                }
            }

            if self.state() & READY_RECEIVE == 0 {
                break DisconnectReason::Unspecified;
            }
        };

        // Drain queued dispatches before announcing the departure:
        // on_disconnected strictly follows the last dispatch.
        drop(dispatch_tx);
        let _ = dispatch_task.await;
        self.finish_client(&state, reason);
    }

    /// Handle one completed frame from a TCP peer. A `Some` return ends
    /// the receive loop with that reason.
    async fn route_frame(
        &self,
        state: &Arc<ClientState>,
        frame: Frame,
        dispatch_tx: &mpsc::Sender<InboundMessage>,
    ) -> Option<DisconnectReason> {
        let frame = match self.reassemble(state, frame) {
            Some(frame) => frame,
            None => return None, // waiting for more chunks
        };

        match frame.command_id {
            commands::PING => {
                trace!(peer = %state.peer(), "ping");
                if let Ok(echo) =
                    self.encoder()
                        .encode(commands::PING, frame.response_id, frame.payload())
                {
                    let _ = state.send_frame(echo).await;
                }
                None
            }
            commands::CONNECT => {
                if let Some(filter) = &self.inner.events.accept {
                    if !filter(state.peer()) {
                        debug!(peer = %state.peer(), "connect rejected");
                        return Some(DisconnectReason::Unspecified);
                    }
                }
                if self.inner.clients.insert(state.clone()) {
                    if let Some(handler) = &self.inner.events.connected {
                        handler(state);
                    }
                    info!(peer = %state.peer(), client_id = state.client_id(), "client connected");
                }
                if let Ok(echo) =
                    self.encoder()
                        .encode(commands::CONNECT, frame.response_id, frame.payload())
                {
                    let _ = state.send_frame(echo).await;
                }
                let client_info = ClientInfo {
                    client_id: state.client_id() as i64,
                    name: state.peer().to_string(),
                };
                let _ = self
                    .send_to_state(state, commands::CLIENT_INFO, &client_info.encode(), 0)
                    .await;
                None
            }
            commands::DISCONNECT => Some(DisconnectReason::Graceful),
            id if frame.is_reserved() => {
                trace!(peer = %state.peer(), command_id = id, "ignoring reserved command");
                None
            }
            _ => {
                if self.inner.clients.get(&state.peer()).is_none() {
                    trace!(peer = %state.peer(), "user frame before connect, dropping");
                    return None;
                }
                let msg = InboundMessage::new(
                    state.peer(),
                    frame.command_id,
                    frame.response_id,
                    frame.payload,
                );
                if dispatch_tx.send(msg).await.is_err() {
                    warn!(peer = %state.peer(), "dispatch task gone");
                }
                None
            }
        }
    }

    /// Merge a chunked frame; `None` while the payload is incomplete.
    fn reassemble(&self, state: &Arc<ClientState>, frame: Frame) -> Option<Frame> {
        match frame.chunk {
            None => Some(frame),
            Some(chunk) => {
                let payload = state.reassembler().push(&chunk, frame.payload())?;
                Some(Frame {
                    command_id: frame.command_id,
                    response_id: frame.response_id,
                    chunk: None,
                    payload,
                })
            }
        }
    }

    /// Drop a peer whose reassembly was abandoned (UDP TTL expiry).
    fn reset_client(&self, peer: SocketAddr) {
        if let Some(state) = self.inner.clients.remove(&peer) {
            state.reassembler().clear();
            if state.mark_disconnected() {
                info!(%peer, "client reset");
                if let Some(handler) = &self.inner.events.disconnected {
                    handler(peer, DisconnectReason::TimeoutReset);
                }
            }
        }
    }

    fn finish_client(&self, state: &Arc<ClientState>, reason: DisconnectReason) {
        state.reassembler().clear();
        let was_registered = self.inner.clients.remove(&state.peer()).is_some();
        if state.mark_disconnected() && was_registered {
            info!(peer = %state.peer(), ?reason, "client disconnected");
            if let Some(handler) = &self.inner.events.disconnected {
                handler(state.peer(), reason);
            }
        }
    }

    async fn udp_loop(self, socket: Arc<UdpSocket>, mut shutdown: oneshot::Receiver<()>) {
        let decoder = FrameDecoder::new(self.inner.pool.clone(), self.encoder().max_payload_size());
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("udp loop stopped");
                    return;
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok((n, peer)) => match decoder.decode_datagram(&buf[..n]) {
                        Ok(frame) => self.route_datagram(&socket, peer, frame).await,
                        // Malformed datagrams are dropped silently.
                        Err(err) => trace!(%peer, %err, "dropping malformed datagram"),
                    },
                    Err(err) => warn!(%err, "udp receive failed"),
                },
            }
        }
    }

    async fn route_datagram(&self, socket: &Arc<UdpSocket>, peer: SocketAddr, frame: Frame) {
        if let Some(state) = self.inner.clients.get(&peer) {
            state.touch();
        }

        match frame.command_id {
            commands::CONNECT => {
                if let Some(filter) = &self.inner.events.accept {
                    if !filter(peer) {
                        debug!(%peer, "connect rejected");
                        return;
                    }
                }
                let state = match self.inner.clients.get(&peer) {
                    Some(state) => state,
                    None => {
                        // A stranded partial payload resets the peer.
                        let reset_server = self.clone();
                        let reassembler = Reassembler::with_ttl_notify(
                            self.inner.pool.clone(),
                            REASSEMBLY_TTL,
                            move |packet_id| {
                                warn!(%peer, packet_id, "reassembly abandoned, resetting peer");
                                reset_server.reset_client(peer);
                            },
                        );
                        let state = ClientState::new(
                            peer,
                            self.inner.clients.allocate_client_id(),
                            FrameSink::Udp {
                                socket: socket.clone(),
                                peer,
                            },
                            reassembler,
                        );
                        if self.inner.clients.insert(state.clone()) {
                            if let Some(handler) = &self.inner.events.connected {
                                handler(&state);
                            }
                            info!(%peer, client_id = state.client_id(), "udp client connected");
                        }
                        state
                    }
                };
                if let Ok(echo) =
                    self.encoder()
                        .encode(commands::CONNECT, frame.response_id, frame.payload())
                {
                    let _ = state.send_frame(echo).await;
                }
                let assignment = UdpAssignment {
                    peer_assigned_id: state.client_id() as u32,
                };
                let _ = self
                    .send_to_state(&state, commands::UDP_CONNECT, &assignment.encode(), 0)
                    .await;
            }
            commands::DISCONNECT => {
                if let Some(state) = self.inner.clients.remove(&peer) {
                    state.reassembler().clear();
                    if state.mark_disconnected() {
                        info!(%peer, "udp client disconnected");
                        if let Some(handler) = &self.inner.events.disconnected {
                            handler(peer, DisconnectReason::Graceful);
                        }
                    }
                }
            }
            commands::PING => {
                let Some(state) = self.inner.clients.get(&peer) else {
                    return;
                };
                if let Ok(echo) =
                    self.encoder()
                        .encode(commands::PING, frame.response_id, frame.payload())
                {
                    let _ = state.send_frame(echo).await;
                }
            }
            id if frame.is_reserved() => {
                trace!(%peer, command_id = id, "ignoring reserved command");
            }
            _ => {
                let Some(state) = self.inner.clients.get(&peer) else {
                    trace!(%peer, "user datagram from unconnected peer, dropping");
                    return;
                };
                let frame = match self.reassemble(&state, frame) {
                    Some(frame) => frame,
                    None => return,
                };
                let msg =
                    InboundMessage::new(peer, frame.command_id, frame.response_id, frame.payload);
                // UDP makes no ordering promise; offload dispatch per
                // datagram so the socket loop never blocks on user code.
                let registry = self.inner.registry.clone();
                tokio::spawn(async move {
                    registry.dispatch(&msg);
                });
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state())
            .field("clients", &self.client_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
