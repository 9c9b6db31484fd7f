//! Multi-chunk payload reassembly.
//!
//! Payloads larger than the per-frame maximum travel as chunked frames
//! sharing a nonzero `packet_id`. Each peer owns one [`Reassembler`], so
//! reassemblies are keyed by `(peer, packet_id)` without a shared table.
//!
//! A pending reassembly rents its full-size target buffer from the pool
//! on first chunk, copies each chunk into its disjoint region, and counts
//! outstanding bytes down to zero, at which point the completed buffer is
//! handed back to the caller and the entry removed.
//!
//! The timed variant (used for UDP peers, where chunk loss strands a
//! partial message) expires entries after a quiet period; expired buffers
//! return to the pool. TCP peers use the untimed variant: an ordered
//! stream either delivers every chunk or drops the connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::pool::{BytePool, PooledBuf};
use crate::protocol::ChunkInfo;

/// Hard cap on a reassembled payload.
pub const MAX_REASSEMBLY_SIZE: usize = 1 << 30;

struct Pending {
    buffer: PooledBuf,
    bytes_remaining: usize,
    deadline: Instant,
    generation: u64,
}

type ExpiryHook = Box<dyn Fn(u32) + Send + Sync>;

struct Inner {
    pool: BytePool,
    ttl: Option<Duration>,
    expired: Option<ExpiryHook>,
    entries: Mutex<HashMap<u32, Pending>>,
    next_generation: AtomicU64,
}

/// Reassembles chunked payloads keyed by packet id.
///
/// Cheaply cloneable; clones share the same table.
#[derive(Clone)]
pub struct Reassembler {
    inner: Arc<Inner>,
}

impl Reassembler {
    /// Untimed variant: entries live until completed or
    /// [`clear`](Self::clear)ed.
    pub fn new(pool: BytePool) -> Self {
        Self::build(pool, None, None)
    }

    /// Timed variant: entries untouched for `ttl` are discarded and
    /// their buffers returned to the pool.
    ///
    /// Must be used inside a tokio runtime (the expiry watchdog is a
    /// spawned task).
    pub fn with_ttl(pool: BytePool, ttl: Duration) -> Self {
        Self::build(pool, Some(ttl), None)
    }

    /// Timed variant that also reports each expired packet id, so the
    /// owner can reset the peer the stranded payload belonged to.
    pub fn with_ttl_notify<F>(pool: BytePool, ttl: Duration, notify: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        Self::build(pool, Some(ttl), Some(Box::new(notify)))
    }

    fn build(pool: BytePool, ttl: Option<Duration>, expired: Option<ExpiryHook>) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                ttl,
                expired,
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Merge one chunk. Returns the completed payload when this chunk
    /// was the last outstanding piece.
    ///
    /// Invalid chunks (zero packet id, out-of-bounds region, total
    /// length disagreeing with the pending entry) are discarded; chunk
    /// transport is unreliable by design and recovery is the sender's
    /// concern.
    pub fn push(&self, chunk: &ChunkInfo, payload: &[u8]) -> Option<PooledBuf> {
        let total = chunk.total_length as usize;
        let offset = chunk.chunk_offset as usize;

        if chunk.packet_id == 0
            || payload.is_empty()
            || total == 0
            || total > MAX_REASSEMBLY_SIZE
            || offset + payload.len() > total
        {
            trace!(
                packet_id = chunk.packet_id,
                offset,
                len = payload.len(),
                total,
                "discarding invalid chunk"
            );
            return None;
        }

        let mut entries = self.inner.entries.lock();

        let entry = entries.entry(chunk.packet_id).or_insert_with(|| {
            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
            if let Some(ttl) = self.inner.ttl {
                spawn_watchdog(self.inner.clone(), chunk.packet_id, generation, ttl);
            }
            Pending {
                buffer: self.inner.pool.rent(total),
                bytes_remaining: total,
                deadline: Instant::now() + self.inner.ttl.unwrap_or(Duration::ZERO),
                generation,
            }
        });

        if entry.buffer.len() != total {
            trace!(
                packet_id = chunk.packet_id,
                claimed = total,
                pending = entry.buffer.len(),
                "chunk disagrees on total length, discarding"
            );
            return None;
        }

        entry.buffer[offset..offset + payload.len()].copy_from_slice(payload);
        entry.bytes_remaining = entry.bytes_remaining.saturating_sub(payload.len());

        if entry.bytes_remaining == 0 {
            let done = entries.remove(&chunk.packet_id).expect("entry present");
            return Some(done.buffer);
        }

        if let Some(ttl) = self.inner.ttl {
            entry.deadline = Instant::now() + ttl;
        }
        None
    }

    /// Number of incomplete reassemblies.
    pub fn pending(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Drop every incomplete reassembly (peer went away); buffers return
    /// to the pool.
    pub fn clear(&self) {
        self.inner.entries.lock().clear();
    }
}

impl std::fmt::Debug for Reassembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reassembler")
            .field("pending", &self.pending())
            .field("ttl", &self.inner.ttl)
            .finish()
    }
}

/// Watches one pending entry and removes it once its deadline passes
/// without being pushed forward.
fn spawn_watchdog(inner: Arc<Inner>, packet_id: u32, generation: u64, ttl: Duration) {
    tokio::spawn(async move {
        let mut deadline = Instant::now() + ttl;
        loop {
            tokio::time::sleep_until(deadline).await;

            let expired = {
                let mut entries = inner.entries.lock();
                match entries.get(&packet_id) {
                    // Completed, cleared, or replaced by a newer entry.
                    None => return,
                    Some(e) if e.generation != generation => return,
                    Some(e) if e.deadline <= Instant::now() => {
                        warn!(packet_id, "reassembly expired, discarding partial payload");
                        entries.remove(&packet_id);
                        true
                    }
                    Some(e) => {
                        deadline = e.deadline;
                        false
                    }
                }
            };

            if expired {
                // Hook runs outside the table lock.
                if let Some(notify) = &inner.expired {
                    notify(packet_id);
                }
                return;
            }
        }
    });
}
