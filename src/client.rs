//! Client engine - connect, receive loop, send, request/response.
//!
//! The [`ClientBuilder`] configures limits, compression, and lifecycle
//! callbacks; `connect`/`connect_udp` perform the transport connect,
//! start the receive machinery, and send the CONNECT handshake frame.
//!
//! Sends come in two flavors: [`send`](Client::send) is fire-and-forget;
//! [`send_r`](Client::send_r) registers a response id, sends the frame
//! with it, and awaits the correlated reply, a timeout, or cancellation.
//!
//! # Example
//!
//! ```ignore
//! use netwire::client::Client;
//! use std::time::Duration;
//!
//! let client = Client::builder()
//!     .on_disconnected(|reason| eprintln!("gone: {reason:?}"))
//!     .connect("127.0.0.1:4700".parse()?, Duration::from_secs(5))
//!     .await?;
//!
//! client.send(7, b"fire and forget").await?;
//! let reply = client.send_r(8, b"question").await?;
//! println!("{} byte answer", reply.len());
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::clients::FrameSink;
use crate::error::{DisconnectReason, NetwireError, RequestError, Result, SendError};
use crate::pool::{BytePool, PooledBuf};
use crate::protocol::{
    commands, ClientInfo, CompressionMode, Frame, FrameDecoder, FrameEncoder, Framer, MsgPackCodec,
    PingInfo, UdpAssignment, CLOSE_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, REASSEMBLY_TTL,
    TCP_PAYLOAD_SIZE_MAX, UDP_PAYLOAD_SIZE_MAX,
};
use crate::reassembly::Reassembler;
use crate::registry::{CommandRegistry, HandlerId, InboundMessage};
use crate::response::ResponseTable;
use crate::writer::{spawn_writer_task, WriterConfig};

/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Queued-but-undispatched messages before the receive loop waits.
const DISPATCH_QUEUE_SIZE: usize = 256;

/// Tunables for a client engine.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Largest payload carried by one unchunked frame. Clamped to the
    /// transport maximum at connect time.
    pub max_payload_size: usize,
    /// Ring buffer capacity (TCP).
    pub ring_capacity: usize,
    /// Outbound payload compression.
    pub compression: CompressionMode,
    /// Default timeout for [`Client::send_r`].
    pub request_timeout: Duration,
    /// Writer task tuning.
    pub writer: WriterConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_payload_size: TCP_PAYLOAD_SIZE_MAX,
            ring_capacity: 256 * 1024,
            compression: CompressionMode::None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            writer: WriterConfig::default(),
        }
    }
}

type ConnectedHandler = Box<dyn Fn() + Send + Sync>;
type DisconnectedHandler = Box<dyn Fn(DisconnectReason) + Send + Sync>;

#[derive(Default)]
struct ClientEvents {
    connected: Option<ConnectedHandler>,
    disconnected: Option<DisconnectedHandler>,
}

/// Fluent configuration for a [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    events: ClientEvents,
}

impl ClientBuilder {
    /// Start from defaults.
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            events: ClientEvents::default(),
        }
    }

    /// Set the per-frame payload limit.
    pub fn max_payload_size(mut self, bytes: usize) -> Self {
        self.config.max_payload_size = bytes;
        self
    }

    /// Set the ring buffer capacity.
    pub fn ring_capacity(mut self, bytes: usize) -> Self {
        self.config.ring_capacity = bytes;
        self
    }

    /// Enable outbound compression.
    pub fn compression(mut self, mode: CompressionMode) -> Self {
        self.config.compression = mode;
        self
    }

    /// Set the default [`Client::send_r`] timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Tune the writer task.
    pub fn writer(mut self, config: WriterConfig) -> Self {
        self.config.writer = config;
        self
    }

    /// Called once when the server acknowledges the CONNECT handshake.
    pub fn on_connected<F>(mut self, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.events.connected = Some(Box::new(handler));
        self
    }

    /// Called once when the connection ends (peer-sent DISCONNECT,
    /// clean close, or socket error), never after `dispose`.
    pub fn on_disconnected<F>(mut self, handler: F) -> Self
    where
        F: Fn(DisconnectReason) + Send + Sync + 'static,
    {
        self.events.disconnected = Some(Box::new(handler));
        self
    }

    /// Connect over TCP.
    ///
    /// Creates the socket, performs the transport connect (bounded by
    /// `timeout`), starts the receive machinery, and sends the CONNECT
    /// frame.
    pub async fn connect(self, addr: SocketAddr, timeout: Duration) -> Result<Client> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetwireError::ConnectTimeout)??;
        let _ = stream.set_nodelay(true);
        let _ = stream.set_linger(Some(CLOSE_TIMEOUT));
        let peer = stream.peer_addr()?;
        let (reader, write_half) = stream.into_split();

        let (writer, _writer_task) = spawn_writer_task(write_half, self.config.writer.clone());
        let pool = BytePool::new();
        let max_payload = self.config.max_payload_size.min(TCP_PAYLOAD_SIZE_MAX);
        let encoder = FrameEncoder::tcp(max_payload).with_compression(self.config.compression);

        let client = Client::assemble(
            self.config,
            self.events,
            pool.clone(),
            peer,
            FrameSink::Tcp(writer),
            encoder,
            Reassembler::new(pool),
        );

        let (finished_tx, finished_rx) = oneshot::channel();
        *client.inner.finished.lock() = Some(finished_rx);
        tokio::spawn(client.clone().tcp_receive_loop(reader, finished_tx));

        client.send_handshake().await;
        info!(%peer, "tcp client connected");
        Ok(client)
    }

    /// Connect over UDP.
    ///
    /// Binds an ephemeral socket, starts the datagram loop, and sends
    /// the CONNECT frame. UDP uses the timed reassembler since lost
    /// chunks strand partial messages. Datagrams from other peers are
    /// dropped.
    pub async fn connect_udp(self, addr: SocketAddr, timeout: Duration) -> Result<Client> {
        let bind_addr: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse().expect("valid bind address")
        } else {
            "[::]:0".parse().expect("valid bind address")
        };
        let socket = Arc::new(
            tokio::time::timeout(timeout, UdpSocket::bind(bind_addr))
                .await
                .map_err(|_| NetwireError::ConnectTimeout)??,
        );

        let pool = BytePool::new();
        let max_payload = self.config.max_payload_size.min(UDP_PAYLOAD_SIZE_MAX);
        let encoder = FrameEncoder::udp(max_payload).with_compression(self.config.compression);

        let client = Client::assemble(
            self.config,
            self.events,
            pool.clone(),
            addr,
            FrameSink::Udp {
                socket: socket.clone(),
                peer: addr,
            },
            encoder,
            Reassembler::with_ttl(pool, REASSEMBLY_TTL),
        );

        let (finished_tx, finished_rx) = oneshot::channel();
        *client.inner.finished.lock() = Some(finished_rx);
        tokio::spawn(client.clone().udp_receive_loop(socket, finished_tx));

        client.send_handshake().await;
        info!(peer = %addr, "udp client connected");
        Ok(client)
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ClientInner {
    config: ClientConfig,
    events: ClientEvents,
    registry: Arc<CommandRegistry>,
    responses: ResponseTable,
    pool: BytePool,
    peer: SocketAddr,
    sink: FrameSink,
    encoder: FrameEncoder,
    reassembler: Reassembler,
    identity: Mutex<Option<ClientInfo>>,
    assignment: Mutex<Option<UdpAssignment>>,
    connected: AtomicBool,
    handshake_seen: AtomicBool,
    disposed: AtomicBool,
    next_packet_id: AtomicU32,
    loop_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    finished: Mutex<Option<oneshot::Receiver<()>>>,
}

/// A message-oriented TCP/UDP client engine.
///
/// Cheaply cloneable; clones drive the same connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Start configuring a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Connect over TCP with default configuration.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Client> {
        ClientBuilder::new().connect(addr, timeout).await
    }

    /// Connect over UDP with default configuration.
    pub async fn connect_udp(addr: SocketAddr, timeout: Duration) -> Result<Client> {
        ClientBuilder::new().connect_udp(addr, timeout).await
    }

    fn assemble(
        config: ClientConfig,
        events: ClientEvents,
        pool: BytePool,
        peer: SocketAddr,
        sink: FrameSink,
        encoder: FrameEncoder,
        reassembler: Reassembler,
    ) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                config,
                events,
                registry: Arc::new(CommandRegistry::new()),
                responses: ResponseTable::new(),
                pool,
                peer,
                sink,
                encoder,
                reassembler,
                identity: Mutex::new(None),
                assignment: Mutex::new(None),
                connected: AtomicBool::new(true),
                handshake_seen: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                next_packet_id: AtomicU32::new(1),
                loop_shutdown: Mutex::new(None),
                finished: Mutex::new(None),
            }),
        }
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

    /// Remote address.
    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Whether the connection is still up.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Number of requests awaiting responses.
    pub fn outstanding_requests(&self) -> usize {
        self.inner.responses.len()
    }

    /// Identity announced by the server (CLIENT_INFO), once received.
    pub fn client_info(&self) -> Option<ClientInfo> {
        self.inner.identity.lock().clone()
    }

    /// UDP pairing announced by the server (UDP_CONNECT), once received.
    pub fn udp_assignment(&self) -> Option<UdpAssignment> {
        *self.inner.assignment.lock()
    }

    /// Fire-and-forget send.
    ///
    /// Payloads past the frame limit are fragmented into chunked frames
    /// under a fresh packet id.
    pub async fn send(&self, command_id: u16, payload: &[u8]) -> std::result::Result<(), SendError> {
        self.send_frames(command_id, 0, payload).await
    }

    /// Fire-and-forget send of a MessagePack-encoded value.
    pub async fn send_value<T: Serialize>(
        &self,
        command_id: u16,
        value: &T,
    ) -> std::result::Result<(), SendError> {
        let payload = MsgPackCodec::encode(value).map_err(|_| SendError::Invalid)?;
        self.send(command_id, &payload).await
    }

    /// Request/response send with the configured default timeout.
    pub async fn send_r(
        &self,
        command_id: u16,
        payload: &[u8],
    ) -> std::result::Result<PooledBuf, RequestError> {
        self.send_r_with_timeout(command_id, payload, self.inner.config.request_timeout)
            .await
    }

    /// Request/response send.
    ///
    /// Registers a response id, sends the frame carrying it, and awaits
    /// the correlated reply. Yields [`RequestError::TimedOut`] or
    /// [`RequestError::Cancelled`] when no reply arrives; either way the
    /// response slot is released and a late reply's buffer returns to
    /// the pool.
    pub async fn send_r_with_timeout(
        &self,
        command_id: u16,
        payload: &[u8],
        timeout: Duration,
    ) -> std::result::Result<PooledBuf, RequestError> {
        let pending = self.inner.responses.register();
        self.send_frames(command_id, pending.response_id(), payload)
            .await?;
        pending.wait(timeout).await
    }

    /// [`send_r`](Self::send_r), decoding the reply as MessagePack.
    pub async fn send_r_as<T: DeserializeOwned>(
        &self,
        command_id: u16,
        payload: &[u8],
    ) -> std::result::Result<T, RequestError> {
        let reply = self.send_r(command_id, payload).await?;
        Ok(rmp_serde::from_slice(&reply)?)
    }

    /// Round-trip a PING through the server and return the echoed
    /// timestamp payload.
    pub async fn ping(&self) -> std::result::Result<PingInfo, RequestError> {
        let request = PingInfo::now();
        let reply = self.send_r(commands::PING, &request.encode()).await?;
        PingInfo::decode(&reply).ok_or(RequestError::BadResponse)
    }

    /// Stop the engine: best-effort DISCONNECT frame, receive loop
    /// shutdown, socket close with a [`CLOSE_TIMEOUT`] linger
    /// (configured at connect time). Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.is_connected() {
            let _ = self.send_frames(commands::DISCONNECT, 0, &[]).await;
        }
        self.inner.connected.store(false, Ordering::Release);
        if let Some(tx) = self.inner.loop_shutdown.lock().take() {
            let _ = tx.send(());
        }
        info!(peer = %self.inner.peer, "client disposed");
    }

    /// Block until the receive loop ends (peer closed, socket error, or
    /// dispose).
    pub async fn wait_for_shutdown(&self) {
        let rx = self.inner.finished.lock().take();
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }

    async fn send_handshake(&self) {
        if let Err(err) = self.send_frames(commands::CONNECT, 0, &[]).await {
            warn!(%err, "handshake send failed");
        }
    }

    async fn send_frames(
        &self,
        command_id: u16,
        response_id: u32,
        payload: &[u8],
    ) -> std::result::Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::Disconnected);
        }
        let encoder = &self.inner.encoder;
        if payload.len() > encoder.max_payload_size() {
            let packet_id = self.allocate_packet_id();
            for frame in encoder.encode_chunks(command_id, response_id, payload, packet_id)? {
                self.inner.sink.send(frame).await?;
            }
            Ok(())
        } else {
            let frame = encoder.encode(command_id, response_id, payload)?;
            self.inner.sink.send(frame).await
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

    async fn tcp_receive_loop(
        self,
        mut reader: tokio::net::tcp::OwnedReadHalf,
        finished_tx: oneshot::Sender<()>,
    ) {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.inner.loop_shutdown.lock() = Some(shutdown_tx);

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
            self.inner.encoder.max_payload_size(),
        );
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let reason = 'receive: loop {
            tokio::select! {
                _ = &mut shutdown_rx => break DisconnectReason::Graceful,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break DisconnectReason::Graceful,
                    Ok(n) => {
                        for frame in framer.push(&buf[..n]) {
                            if let Some(reason) = self.route_frame(frame, &dispatch_tx).await {
                                break 'receive reason;
                            }
                        }
                    }
                    Err(err) => {
                        debug!(%err, "read failed");
                        break DisconnectReason::SocketError;
                    }
                },
            }
        };

        drop(dispatch_tx);
        let _ = dispatch_task.await;
        self.finish(reason);
        let _ = finished_tx.send(());
    }

    async fn udp_receive_loop(self, socket: Arc<UdpSocket>, finished_tx: oneshot::Sender<()>) {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.inner.loop_shutdown.lock() = Some(shutdown_tx);

        let (dispatch_tx, mut dispatch_rx) = mpsc::channel::<InboundMessage>(DISPATCH_QUEUE_SIZE);
        let dispatch_task = {
            let registry = self.inner.registry.clone();
            tokio::spawn(async move {
                while let Some(msg) = dispatch_rx.recv().await {
                    registry.dispatch(&msg);
                }
            })
        };

        let decoder = FrameDecoder::new(self.inner.pool.clone(), self.inner.encoder.max_payload_size());
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let reason = loop {
            tokio::select! {
                _ = &mut shutdown_rx => break DisconnectReason::Graceful,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((n, from)) => {
                        if from != self.inner.peer {
                            trace!(%from, "datagram from unknown peer, dropping");
                            continue;
                        }
                        match decoder.decode_datagram(&buf[..n]) {
                            Ok(frame) => {
                                if let Some(reason) = self.route_frame(frame, &dispatch_tx).await {
                                    break reason;
                                }
                            }
                            // Malformed datagrams are dropped silently.
                            Err(err) => trace!(%err, "dropping malformed datagram"),
                        }
                    }
                    Err(err) => {
                        debug!(%err, "udp receive failed");
                        break DisconnectReason::SocketError;
                    }
                },
            }
        };

        drop(dispatch_tx);
        let _ = dispatch_task.await;
        self.finish(reason);
        let _ = finished_tx.send(());
    }

    /// Handle one completed inbound frame. A `Some` return ends the
    /// receive loop with that reason; `finish` then performs the single
    /// flip-and-notify.
    async fn route_frame(
        &self,
        frame: Frame,
        dispatch_tx: &mpsc::Sender<InboundMessage>,
    ) -> Option<DisconnectReason> {
        let frame = match frame.chunk {
            None => frame,
            Some(chunk) => {
                let Some(payload) = self.inner.reassembler.push(&chunk, frame.payload()) else {
                    return None; // waiting for more chunks
                };
                Frame {
                    command_id: frame.command_id,
                    response_id: frame.response_id,
                    chunk: None,
                    payload,
                }
            }
        };

        // Correlated replies resolve the response table, whatever the
        // command id; the awaiter owns the buffer from here.
        if frame.response_id != 0 {
            self.inner.responses.complete(frame.response_id, frame.payload);
            return None;
        }

        match frame.command_id {
            commands::CONNECT => {
                if !self.inner.handshake_seen.swap(true, Ordering::AcqRel) {
                    debug!(peer = %self.inner.peer, "handshake acknowledged");
                    if let Some(handler) = &self.inner.events.connected {
                        handler();
                    }
                }
                None
            }
            commands::CLIENT_INFO => {
                match ClientInfo::decode(frame.payload()) {
                    Some(info) => {
                        debug!(client_id = info.client_id, name = %info.name, "identity assigned");
                        *self.inner.identity.lock() = Some(info);
                    }
                    None => trace!("malformed CLIENT_INFO payload"),
                }
                None
            }
            commands::UDP_CONNECT => {
                match UdpAssignment::decode(frame.payload()) {
                    Some(assignment) => {
                        debug!(peer_id = assignment.peer_assigned_id, "udp pairing assigned");
                        *self.inner.assignment.lock() = Some(assignment);
                    }
                    None => trace!("malformed UDP_CONNECT payload"),
                }
                None
            }
            commands::DISCONNECT => {
                debug!(peer = %self.inner.peer, "peer requested disconnect");
                Some(DisconnectReason::Graceful)
            }
            id if frame.is_reserved() => {
                trace!(command_id = id, "ignoring reserved command");
                None
            }
            _ => {
                let msg = InboundMessage::new(
                    self.inner.peer,
                    frame.command_id,
                    frame.response_id,
                    frame.payload,
                );
                if dispatch_tx.send(msg).await.is_err() {
                    warn!("dispatch task gone");
                }
                None
            }
        }
    }

    fn finish(&self, reason: DisconnectReason) {
        // `dispose` already flipped the flag; only an unexpected end
        // reports the disconnect.
        if self.inner.connected.swap(false, Ordering::AcqRel) {
            info!(peer = %self.inner.peer, ?reason, "connection ended");
            if let Some(handler) = &self.inner.events.disconnected {
                handler(reason);
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("peer", &self.inner.peer)
            .field("connected", &self.is_connected())
            .field("outstanding", &self.outstanding_requests())
            .finish()
    }
}
