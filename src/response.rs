//! Response table - request/response correlation.
//!
//! Client-local. Allocates monotonically increasing response ids
//! (skipping 0 on wrap; 0 means "no correlation" on the wire) and keeps
//! one pending completion per outstanding request.
//!
//! Exactly one of `complete`, `cancel`, or the awaiter's timeout
//! observes an entry; the losers are no-ops. A response that arrives
//! after its entry is gone is dropped, which returns its buffer to the
//! pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::RequestError;
use crate::pool::PooledBuf;

struct TableInner {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<PooledBuf>>>,
}

/// Outstanding-request table for one client engine.
///
/// Cheaply cloneable; clones share the same table.
#[derive(Clone)]
pub struct ResponseTable {
    inner: Arc<TableInner>,
}

impl ResponseTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TableInner {
                next_id: AtomicU32::new(1),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Allocate a fresh response id and insert a pending completion.
    ///
    /// The returned handle resolves exactly once: response, timeout, or
    /// cancellation. Dropping it without waiting releases the slot.
    pub fn register(&self) -> PendingResponse {
        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);
        PendingResponse {
            id,
            rx: Some(rx),
            table: self.clone(),
        }
    }

    /// Fulfill an outstanding request. Returns whether an entry was
    /// present; a late payload is dropped (and thereby recycled).
    pub fn complete(&self, response_id: u32, payload: PooledBuf) -> bool {
        let Some(tx) = self.inner.pending.lock().remove(&response_id) else {
            trace!(response_id, "late response, recycling payload");
            return false;
        };
        // A receiver that gave up between removal and send drops the
        // payload the same way.
        tx.send(payload).is_ok()
    }

    /// Cancel an outstanding request; its awaiter observes
    /// [`RequestError::Cancelled`]. Returns whether an entry was
    /// present.
    pub fn cancel(&self, response_id: u32) -> bool {
        self.inner.pending.lock().remove(&response_id).is_some()
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Whether no requests are outstanding.
    pub fn is_empty(&self) -> bool {
        self.inner.pending.lock().is_empty()
    }

    fn allocate_id(&self) -> u32 {
        loop {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for ResponseTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResponseTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseTable")
            .field("outstanding", &self.len())
            .finish()
    }
}

/// Awaitable handle for one outstanding request.
pub struct PendingResponse {
    id: u32,
    rx: Option<oneshot::Receiver<PooledBuf>>,
    table: ResponseTable,
}

impl PendingResponse {
    /// The response id carried by the request frame.
    #[inline]
    pub fn response_id(&self) -> u32 {
        self.id
    }

    /// Await the response, up to `timeout`.
    ///
    /// On timeout the slot is released, so a late response recycles its
    /// buffer instead of resolving anything.
    pub async fn wait(mut self, timeout: Duration) -> Result<PooledBuf, RequestError> {
        let rx = self.rx.take().expect("wait called once");
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(RequestError::Cancelled),
            Err(_) => {
                self.table.cancel(self.id);
                Err(RequestError::TimedOut)
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        // Never awaited: release the slot.
        if self.rx.is_some() {
            self.table.cancel(self.id);
        }
    }
}
