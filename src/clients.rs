//! Server-side client table and per-client state.
//!
//! The server engine owns one [`ClientTable`]; each connected peer owns
//! its [`ClientState`], which exclusively holds the peer's outbound
//! frame sink and reassembler. The table lock is a short critical
//! section; broadcast snapshots under it and sends outside it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::error::SendError;
use crate::reassembly::Reassembler;
use crate::writer::WriterHandle;

/// Outbound frame sink for one peer.
///
/// TCP peers queue onto their connection's writer task; UDP peers share
/// the server socket, addressed per send.
#[derive(Clone)]
pub enum FrameSink {
    /// Dedicated writer task of a TCP connection.
    Tcp(WriterHandle),
    /// Shared UDP socket plus the peer's address.
    Udp {
        /// The server's bound socket.
        socket: Arc<UdpSocket>,
        /// Destination address.
        peer: SocketAddr,
    },
}

impl FrameSink {
    /// Send one encoded frame to the peer.
    pub async fn send(&self, frame: Bytes) -> Result<(), SendError> {
        match self {
            FrameSink::Tcp(writer) => writer.send(frame).await,
            FrameSink::Udp { socket, peer } => socket
                .send_to(&frame, *peer)
                .await
                .map(|_| ())
                .map_err(|_| SendError::SocketError),
        }
    }
}

impl std::fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameSink::Tcp(_) => f.write_str("FrameSink::Tcp"),
            FrameSink::Udp { peer, .. } => write!(f, "FrameSink::Udp({peer})"),
        }
    }
}

/// Engine-side state for one connected peer.
#[derive(Debug)]
pub struct ClientState {
    peer: SocketAddr,
    client_id: u64,
    sink: FrameSink,
    reassembler: Reassembler,
    last_receive: Mutex<Instant>,
    connected: AtomicBool,
}

impl ClientState {
    /// Create state for a freshly accepted peer.
    pub fn new(
        peer: SocketAddr,
        client_id: u64,
        sink: FrameSink,
        reassembler: Reassembler,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            client_id,
            sink,
            reassembler,
            last_receive: Mutex::new(Instant::now()),
            connected: AtomicBool::new(true),
        })
    }

    /// Transport-level identity of the peer.
    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Server-assigned client id.
    #[inline]
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// The peer's reassembler.
    #[inline]
    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    /// Record receive activity.
    pub fn touch(&self) {
        *self.last_receive.lock() = Instant::now();
    }

    /// Time since the last received frame.
    pub fn idle_time(&self) -> Duration {
        self.last_receive.lock().elapsed()
    }

    /// Whether the peer is still considered connected.
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Flip to disconnected. Returns `true` only for the caller that
    /// performed the flip, so disconnect handling runs exactly once.
    pub fn mark_disconnected(&self) -> bool {
        self.connected.swap(false, Ordering::AcqRel)
    }

    /// Send one encoded frame to this peer.
    pub async fn send_frame(&self, frame: Bytes) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::Disconnected);
        }
        self.sink.send(frame).await
    }
}

/// Map of connected peers, keyed by their transport address.
pub struct ClientTable {
    map: Mutex<HashMap<SocketAddr, Arc<ClientState>>>,
    next_client_id: AtomicU64,
}

impl ClientTable {
    /// Create an empty table.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            map: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
        })
    }

    /// Allocate an id for a peer about to be inserted.
    pub fn allocate_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a peer. Returns `false` (and leaves the table unchanged)
    /// when the address is already present.
    pub fn insert(&self, state: Arc<ClientState>) -> bool {
        let mut map = self.map.lock();
        match map.entry(state.peer()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(state);
                true
            }
        }
    }

    /// Look up a peer by address.
    pub fn get(&self, peer: &SocketAddr) -> Option<Arc<ClientState>> {
        self.map.lock().get(peer).cloned()
    }

    /// Remove a peer by address.
    pub fn remove(&self, peer: &SocketAddr) -> Option<Arc<ClientState>> {
        self.map.lock().remove(peer)
    }

    /// Copy of every connected peer, taken under the lock so broadcast
    /// sends can run outside it.
    pub fn snapshot(&self) -> Vec<Arc<ClientState>> {
        self.map.lock().values().cloned().collect()
    }

    /// Remove and return every peer (dispose path).
    pub fn drain(&self) -> Vec<Arc<ClientState>> {
        self.map.lock().drain().map(|(_, state)| state).collect()
    }

    /// Number of connected peers.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// Whether no peers are connected.
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

impl std::fmt::Debug for ClientTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTable").field("len", &self.len()).finish()
    }
}
