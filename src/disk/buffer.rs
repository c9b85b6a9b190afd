//! The pool of reusable block-sized disk buffers.
//!
//! All block data that passes through the disk task is staged in 16 KiB
//! buffers drawn from this pool: peer sessions fill them with incoming
//! payload, read-ahead fills them from disk, and the read cache retains them
//! until eviction. Returning a buffer is implicit: when the last reference to
//! a [`DiskBuffer`] is dropped, its allocation goes back to the pool.

use std::{
    fmt,
    mem,
    ops::{Deref, DerefMut},
    sync::{Arc, Weak},
};

use crossbeam_queue::ArrayQueue;

use crate::BLOCK_LEN;

/// A thread-safe pool of 16 KiB buffers.
pub(crate) struct DiskBufferPool {
    queue: Arc<ArrayQueue<Vec<u8>>>,
}

impl DiskBufferPool {
    /// Creates a pool that retains at most `capacity` idle buffers.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
        }
    }

    /// Takes a buffer of the given length from the pool, allocating a new one
    /// if the pool is empty. The buffer's contents are zeroed.
    ///
    /// `len` must not exceed the 16 KiB block length.
    pub fn get(&self, len: usize) -> DiskBuffer {
        debug_assert!(len > 0);
        debug_assert!(len <= BLOCK_LEN as usize);
        let mut buf = self
            .queue
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(BLOCK_LEN as usize));
        buf.clear();
        buf.resize(len, 0);
        DiskBuffer {
            buf,
            pool: Arc::downgrade(&self.queue),
        }
    }

    /// The number of idle buffers currently held by the pool.
    #[cfg(test)]
    pub fn idle_count(&self) -> usize {
        self.queue.len()
    }
}

/// A single pooled buffer. Dereferences to its byte contents and returns its
/// allocation to the pool on drop.
pub struct DiskBuffer {
    buf: Vec<u8>,
    pool: Weak<ArrayQueue<Vec<u8>>>,
}

impl DiskBuffer {
    /// Wraps an existing byte vector without tying it to a pool. Used where
    /// block data originates outside the disk task.
    pub(crate) fn unpooled(buf: Vec<u8>) -> Self {
        Self {
            buf,
            pool: Weak::new(),
        }
    }
}

impl Deref for DiskBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for DiskBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl fmt::Debug for DiskBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DiskBuffer(len: {})", self.buf.len())
    }
}

impl Drop for DiskBuffer {
    fn drop(&mut self) {
        if let Some(queue) = self.pool.upgrade() {
            // if the pool is full the allocation is simply freed
            let _ = queue.push(mem::take(&mut self.buf));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returns_buffer_to_pool_on_drop() {
        let pool = DiskBufferPool::new(4);
        assert_eq!(pool.idle_count(), 0);

        let buf = pool.get(BLOCK_LEN as usize);
        assert_eq!(buf.len(), BLOCK_LEN as usize);
        drop(buf);
        assert_eq!(pool.idle_count(), 1);

        // the returned allocation is handed out again
        let buf = pool.get(100);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(buf.len(), 100);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_pool_capacity_is_bounded() {
        let pool = DiskBufferPool::new(2);
        let bufs: Vec<_> = (0..4).map(|_| pool.get(16)).collect();
        drop(bufs);
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn test_unpooled_buffer() {
        let buf = DiskBuffer::unpooled(vec![1, 2, 3]);
        assert_eq!(&*buf, &[1, 2, 3]);
    }
}
