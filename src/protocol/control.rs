//! Fixed payload layouts for reserved control commands.
//!
//! Unlike user payloads (MessagePack), the engine's own commands use
//! fixed little-endian layouts so peers can service them without any
//! serializer:
//!
//! - `PING`: `timestamp: i64` (8 bytes)
//! - `UDP_CONNECT`: `peer_assigned_id: u32` (4 bytes)
//! - `CLIENT_INFO`: `client_id: i64` (8 bytes), `name` length (2 bytes),
//!   UTF-8 name bytes

use std::time::{SystemTime, UNIX_EPOCH};

/// PING payload: a caller-chosen timestamp echoed back verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingInfo {
    /// Milliseconds since the Unix epoch at send time.
    pub timestamp: i64,
}

impl PingInfo {
    /// Ping payload stamped with the current wall clock.
    pub fn now() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self { timestamp }
    }

    /// Encode to the 8-byte wire layout.
    pub fn encode(&self) -> [u8; 8] {
        self.timestamp.to_le_bytes()
    }

    /// Decode from the wire layout.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        Some(Self {
            timestamp: i64::from_le_bytes(bytes.get(..8)?.try_into().ok()?),
        })
    }
}

/// UDP_CONNECT payload: the id the server assigned to this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpAssignment {
    /// Server-assigned peer id.
    pub peer_assigned_id: u32,
}

impl UdpAssignment {
    /// Encode to the 4-byte wire layout.
    pub fn encode(&self) -> [u8; 4] {
        self.peer_assigned_id.to_le_bytes()
    }

    /// Decode from the wire layout.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        Some(Self {
            peer_assigned_id: u32::from_le_bytes(bytes.get(..4)?.try_into().ok()?),
        })
    }
}

/// CLIENT_INFO payload: server-assigned identity for a connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Server-assigned client id.
    pub client_id: i64,
    /// Human-readable client name.
    pub name: String,
}

impl ClientInfo {
    /// Encode to the wire layout (id, name length, name bytes).
    pub fn encode(&self) -> Vec<u8> {
        let name = self.name.as_bytes();
        let mut buf = Vec::with_capacity(10 + name.len());
        buf.extend_from_slice(&self.client_id.to_le_bytes());
        buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
        buf.extend_from_slice(name);
        buf
    }

    /// Decode from the wire layout.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let client_id = i64::from_le_bytes(bytes.get(..8)?.try_into().ok()?);
        let name_len = u16::from_le_bytes(bytes.get(8..10)?.try_into().ok()?) as usize;
        let name = std::str::from_utf8(bytes.get(10..10 + name_len)?).ok()?;
        Some(Self {
            client_id,
            name: name.to_string(),
        })
    }
}
