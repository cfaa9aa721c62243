//! Pooled byte buffers handed from backends to request listeners.
//!
//! A backend leases a buffer from a [`BufferPool`], fills it, and freezes it
//! into a [`PooledBuffer`] that travels inside a success event. The buffer
//! goes back to its pool exactly once, when the last handle is dropped or
//! explicitly released.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::PoolConfig;

/// Source of reusable byte buffers.
///
/// Implementations hand out zero-filled vectors of the requested length and
/// take them back for reuse once the consumer is done with them.
pub trait BufferPool: Send + Sync {
    /// Returns a zero-filled vector of exactly `len` bytes.
    fn allocate(&self, len: usize) -> Vec<u8>;

    /// Takes a vector back for reuse.
    fn recycle(&self, buffer: Vec<u8>);
}

/// Shared handle to a buffer pool.
pub type PoolHandle = Arc<dyn BufferPool>;

/// Free-list buffer pool guarded by a single mutex.
///
/// Returned buffers are cleared and trimmed to `trim_capacity` before being
/// kept; once `max_buffers` are idle, further returns are dropped.
pub struct SharedBufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_buffers: usize,
    trim_capacity: usize,
}

impl SharedBufferPool {
    /// Creates a pool from configuration.
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(config.max_buffers.min(16))),
            max_buffers: config.max_buffers,
            trim_capacity: config.trim_capacity,
        }
    }

    /// Creates a pool with default configuration, wrapped in a shared handle.
    pub fn shared() -> PoolHandle {
        Arc::new(Self::new(&PoolConfig::default()))
    }

    /// Number of idle buffers currently held for reuse.
    pub fn idle_buffers(&self) -> usize {
        self.free.lock().len()
    }
}

impl BufferPool for SharedBufferPool {
    fn allocate(&self, len: usize) -> Vec<u8> {
        let mut buffer = self.free.lock().pop().unwrap_or_default();
        buffer.resize(len, 0);
        buffer
    }

    fn recycle(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        buffer.shrink_to(self.trim_capacity);
        if buffer.capacity() == 0 {
            return;
        }

        let mut free = self.free.lock();
        if free.len() < self.max_buffers {
            free.push(buffer);
        }
    }
}

impl fmt::Debug for SharedBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBufferPool")
            .field("idle", &self.idle_buffers())
            .field("max_buffers", &self.max_buffers)
            .field("trim_capacity", &self.trim_capacity)
            .finish()
    }
}

/// Owns a vector checked out from a pool and gives it back on drop.
struct PoolSlot {
    data: Vec<u8>,
    pool: PoolHandle,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.pool.recycle(std::mem::take(&mut self.data));
    }
}

/// Exclusively owned buffer being filled by a backend.
///
/// Dropping a lease on an early-return or error path returns the buffer to
/// the pool immediately.
pub struct BufferLease {
    slot: PoolSlot,
}

impl BufferLease {
    /// Leases a zero-filled buffer of `len` bytes from `pool`.
    pub fn new(pool: &PoolHandle, len: usize) -> Self {
        Self {
            slot: PoolSlot {
                data: pool.allocate(len),
                pool: Arc::clone(pool),
            },
        }
    }

    /// Shortens the buffer to the number of bytes actually filled.
    pub fn truncate(&mut self, len: usize) {
        self.slot.data.truncate(len);
    }

    /// Converts the lease into an immutable, shareable buffer.
    pub fn freeze(self) -> PooledBuffer {
        PooledBuffer {
            slot: Arc::new(self.slot),
        }
    }
}

impl Deref for BufferLease {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.slot.data
    }
}

impl DerefMut for BufferLease {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.slot.data
    }
}

/// Reference-counted, read-only buffer borrowed from a pool.
///
/// Clones share the same storage; the storage returns to the pool when the
/// last clone is dropped or released.
#[derive(Clone)]
pub struct PooledBuffer {
    slot: Arc<PoolSlot>,
}

impl PooledBuffer {
    /// Copies `bytes` into a freshly leased buffer.
    pub fn copy_from(pool: &PoolHandle, bytes: &[u8]) -> Self {
        let mut lease = BufferLease::new(pool, bytes.len());
        lease.copy_from_slice(bytes);
        lease.freeze()
    }

    /// Number of bytes held.
    pub fn len(&self) -> usize {
        self.slot.data.len()
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.slot.data.is_empty()
    }

    /// Gives this handle back. The storage is recycled once no other handle
    /// refers to it.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.slot.data
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.slot.data
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .finish()
    }
}
