//! Size-classed byte buffer pool.
//!
//! The engine rents a buffer on every receive and returns it after
//! dispatch; this pool keeps those buffers out of the allocator. Buffers
//! are grouped into power-of-two size classes from 64 bytes to 128 KiB.
//! Requests above the largest class bypass the pool entirely.
//!
//! Rented buffers are [`PooledBuf`] guards: dropping one places its
//! storage back on the free list for its class.
//!
//! # Example
//!
//! ```
//! use netwire::pool::BytePool;
//!
//! let pool = BytePool::new();
//! let buf = pool.rent(100);
//! assert_eq!(buf.len(), 100);
//! assert_eq!(buf.capacity(), 128); // next power of two
//! drop(buf); // storage returns to the pool
//! ```

use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// Smallest size class.
pub const MIN_CLASS: usize = 64;

/// Largest size class. Larger requests bypass the pool.
pub const MAX_CLASS: usize = 128 * 1024;

/// Number of size classes (64, 128, ..., 131072).
const CLASS_COUNT: usize = 12;

/// Default cap on free buffers retained per class.
const DEFAULT_MAX_PER_CLASS: usize = 64;

struct PoolInner {
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
    max_per_class: usize,
}

/// Thread-safe, size-classed buffer pool.
///
/// Cheaply cloneable; clones share the same free lists. Each class keeps
/// its own list behind a short critical-section lock.
#[derive(Clone)]
pub struct BytePool {
    inner: Arc<PoolInner>,
}

impl BytePool {
    /// Create a pool with the default per-class retention cap.
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_MAX_PER_CLASS)
    }

    /// Create a pool retaining at most `max_per_class` free buffers per
    /// size class.
    pub fn with_retention(max_per_class: usize) -> Self {
        let classes = (0..CLASS_COUNT).map(|_| Mutex::new(Vec::new())).collect();
        Self {
            inner: Arc::new(PoolInner {
                classes,
                max_per_class,
            }),
        }
    }

    /// Rent a buffer of exactly `len` bytes (zero-initialized).
    ///
    /// The backing capacity is `len` rounded up to the next power-of-two
    /// class, minimum 64. Requests above [`MAX_CLASS`] are served by a
    /// plain allocation that is dropped, not pooled, when the guard goes
    /// away.
    pub fn rent(&self, len: usize) -> PooledBuf {
        let class = class_size(len);
        if class > MAX_CLASS {
            return PooledBuf {
                data: vec![0u8; len],
                pool: None,
            };
        }

        let mut data = self.inner.classes[class_index(class)]
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(class));
        data.clear();
        data.resize(len, 0);

        PooledBuf {
            data,
            pool: Some(self.clone()),
        }
    }

    /// Wrap an existing vector so that its storage is offered back to the
    /// pool on drop (adopted only when its capacity matches a class).
    pub fn adopt(&self, data: Vec<u8>) -> PooledBuf {
        PooledBuf {
            data,
            pool: Some(self.clone()),
        }
    }

    /// Number of free buffers currently retained for the class serving
    /// `len`-byte requests.
    pub fn free_count(&self, len: usize) -> usize {
        let class = class_size(len);
        if class > MAX_CLASS {
            return 0;
        }
        self.inner.classes[class_index(class)].lock().len()
    }

    fn give_back(&self, data: Vec<u8>) {
        let cap = data.capacity();
        if !cap.is_power_of_two() || !(MIN_CLASS..=MAX_CLASS).contains(&cap) {
            return; // oversize or foreign storage, let it drop
        }
        let mut free = self.inner.classes[class_index(cap)].lock();
        if free.len() < self.inner.max_per_class {
            free.push(data);
        }
    }
}

impl Default for BytePool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BytePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BytePool")
            .field("classes", &CLASS_COUNT)
            .field("max_per_class", &self.inner.max_per_class)
            .finish()
    }
}

/// Round `len` up to its size class.
fn class_size(len: usize) -> usize {
    len.next_power_of_two().max(MIN_CLASS)
}

/// Index of an exact class size (64 -> 0, 128 -> 1, ...).
fn class_index(class: usize) -> usize {
    (class.trailing_zeros() - MIN_CLASS.trailing_zeros()) as usize
}

/// A rented byte buffer that returns to its pool on drop.
///
/// Dereferences to `[u8]`. Ownership of a `PooledBuf` is ownership of the
/// payload: the engine hands it to dispatch, dispatch drops it after the
/// last subscriber, and the storage recycles.
pub struct PooledBuf {
    data: Vec<u8>,
    pool: Option<BytePool>,
}

impl PooledBuf {
    /// Wrap a plain vector with no pool attached.
    pub fn unpooled(data: Vec<u8>) -> Self {
        Self { data, pool: None }
    }

    /// Buffer length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Backing capacity (the size class, for pooled buffers).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Borrow the contents.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Borrow the contents mutably.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Detach the storage from the pool and take it as a plain `Vec`.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.pool = None;
        mem::take(&mut self.data)
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl AsRef<[u8]> for PooledBuf {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.data.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.give_back(mem::take(&mut self.data));
        }
    }
}
