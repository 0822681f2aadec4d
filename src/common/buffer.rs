//! Shared buffer pool for forwarder copy loops.
//!
//! Copy loops churn through 32 KiB scratch buffers at connection rate;
//! recycling them through a free list keeps allocation out of the hot path.
//! Acquisition is scoped: [`PooledBuf`] returns its buffer on drop, so every
//! exit path of a copy loop (EOF, error, cancellation) releases.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

/// Buffer size: 32 KiB, matches a typical TCP window / TLS record.
pub const BUF_SIZE: usize = 32 * 1024;

pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Take a buffer from the free list, allocating a fresh one when empty.
    pub fn acquire(&self) -> PooledBuf<'_> {
        if let Ok(mut free) = self.free.lock() {
            if let Some(buf) = free.pop() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return PooledBuf {
                    buf: Some(buf),
                    pool: self,
                };
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        PooledBuf {
            buf: Some(vec![0u8; BUF_SIZE]),
            pool: self,
        }
    }

    fn release(&self, buf: Vec<u8>) {
        // Buffers are never resized, but guard against a swapped-in stranger.
        if buf.capacity() < BUF_SIZE {
            return;
        }
        if let Ok(mut free) = self.free.lock() {
            free.push(buf);
        }
    }

    /// (hits, misses) counters.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    #[cfg(test)]
    fn free_len(&self) -> usize {
        self.free.lock().map(|f| f.len()).unwrap_or(0)
    }
}

/// A buffer on loan from the pool. Dereferences to `[u8; BUF_SIZE]` storage
/// and goes back to the free list on drop.
pub struct PooledBuf<'a> {
    buf: Option<Vec<u8>>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuf<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().expect("buffer taken")
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

/// Process-wide pool singleton.
pub fn global_pool() -> &'static BufferPool {
    static POOL: OnceLock<BufferPool> = OnceLock::new();
    POOL.get_or_init(BufferPool::new)
}
