//! Dedicated per-connection writer task.
//!
//! Senders hand fully encoded frames to an mpsc channel; one task per
//! connection drains it and writes to the socket. This keeps the send
//! path lock-free and lets bursts of frames coalesce into single
//! vectored writes.
//!
//! ```text
//! engine / handlers ──► mpsc::Sender<Bytes> ──► writer task ──► socket
//! ```
//!
//! A shared pending counter provides backpressure: past the configured
//! limit, `send` waits (bounded by a timeout) for the task to drain.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::SendError;

/// Default maximum queued frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default wait for backpressure to clear.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between backpressure re-checks.
const CHECK_INTERVAL: Duration = Duration::from_micros(100);

/// Maximum frames coalesced into one vectored write.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for a connection's writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum queued frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
    /// How long `send` waits for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Cheaply cloneable handle for queueing frames onto a writer task.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    /// Queue an encoded frame, waiting out backpressure if necessary.
    ///
    /// [`SendError::Disconnected`] when the writer task is gone,
    /// [`SendError::SocketError`] when backpressure never cleared.
    pub async fn send(&self, frame: Bytes) -> Result<(), SendError> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            SendError::Disconnected
        })
    }

    /// Queue a frame without waiting; fails immediately at capacity.
    pub fn try_send(&self, frame: Bytes) -> Result<(), SendError> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            return Err(SendError::SocketError);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.try_send(frame).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => SendError::SocketError,
                mpsc::error::TrySendError::Closed(_) => SendError::Disconnected,
            }
        })
    }

    /// Frames queued but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the queue is at its backpressure limit.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    async fn wait_for_backpressure(&self) -> Result<(), SendError> {
        let start = Instant::now();
        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }
            if start.elapsed() > self.timeout {
                return Err(SendError::SocketError);
            }
            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }
}

/// Spawn the writer task for `writer` and return the sending handle plus
/// the task's join handle.
///
/// The task ends cleanly when every [`WriterHandle`] is dropped, or with
/// the I/O error that broke the socket.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<std::io::Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
        max_pending: config.max_pending_frames,
        timeout: config.backpressure_timeout,
    };

    let task = tokio::spawn(writer_loop(rx, writer, pending));
    (handle, task)
}

/// Drain the queue, batching ready frames into vectored writes.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch: Vec<Bytes> = Vec::with_capacity(MAX_BATCH_SIZE);

    loop {
        let first = match rx.recv().await {
            Some(frame) => frame,
            None => {
                trace!("writer channel closed, shutting down");
                return Ok(());
            }
        };

        batch.clear();
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let result = write_batch(&mut writer, &batch).await;
        pending.fetch_sub(batch.len(), Ordering::Release);
        result?;
    }
}

/// Write a batch of frames with as few syscalls as the kernel allows.
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = batch.iter().map(Bytes::len).sum();
    let mut written = 0usize;

    while written < total {
        let slices = remaining_slices(batch, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            ));
        }
        written += n;
    }

    writer.flush().await
}

/// Slice views over the unwritten tail of a batch.
fn remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut consumed = 0usize;

    for frame in batch {
        let end = consumed + frame.len();
        if skip_bytes < end {
            let start = skip_bytes.saturating_sub(consumed);
            slices.push(IoSlice::new(&frame[start..]));
        }
        consumed = end;
    }
    slices
}
