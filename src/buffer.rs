//! Shared buffer pool with cap-based recycling.
//!
//! Codec and framing paths borrow scratch buffers from a process-wide
//! pool instead of allocating per message. Buffers above the recycle
//! cap are dropped on release so one oversized message cannot pin a
//! large allocation for the lifetime of the pool.

use bytes::BytesMut;
use parking_lot::Mutex;

/// Capacity of freshly-constructed buffers.
pub const INITIAL_BUFFER_SIZE: usize = 512;

/// Buffers whose capacity grew beyond this are not recycled (8 MiB).
pub const MAX_RECYCLE_BUFFER_SIZE: usize = 8 << 20;

/// A concurrency-safe pool of reusable byte buffers.
///
/// The pool is conceptually unbounded and may discard entries at any
/// time; callers must assume [`BufferPool::acquire`] may construct a
/// fresh buffer.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a buffer from the pool, or allocate a fresh one with
    /// [`INITIAL_BUFFER_SIZE`] capacity. The returned buffer is empty.
    pub fn acquire(&self) -> BytesMut {
        match self.free.lock().pop() {
            Some(buffer) => buffer,
            None => BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
        }
    }

    /// Return a buffer to the pool.
    ///
    /// Buffers with capacity above [`MAX_RECYCLE_BUFFER_SIZE`] are
    /// dropped; others are cleared and kept for reuse.
    pub fn release(&self, mut buffer: BytesMut) {
        if buffer.capacity() > MAX_RECYCLE_BUFFER_SIZE {
            return;
        }
        buffer.clear();
        self.free.lock().push(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_fresh_buffer() {
        let pool = BufferPool::new();
        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= INITIAL_BUFFER_SIZE);
    }

    #[test]
    fn test_release_then_acquire_reuses() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"scratch");
        let ptr = buf.as_ptr();
        pool.release(buf);

        let reused = pool.acquire();
        assert!(reused.is_empty());
        assert_eq!(reused.as_ptr(), ptr);
    }

    #[test]
    fn test_oversized_buffer_not_recycled() {
        let pool = BufferPool::new();
        let big = BytesMut::with_capacity(MAX_RECYCLE_BUFFER_SIZE + 1);
        pool.release(big);

        // The next acquire must not hand back the oversized buffer.
        let buf = pool.acquire();
        assert!(buf.capacity() <= MAX_RECYCLE_BUFFER_SIZE);
    }

    #[test]
    fn test_buffer_at_cap_is_recycled() {
        let pool = BufferPool::new();
        let at_cap = BytesMut::with_capacity(MAX_RECYCLE_BUFFER_SIZE);
        let ptr = at_cap.as_ptr();
        pool.release(at_cap);
        assert_eq!(pool.acquire().as_ptr(), ptr);
    }

    #[test]
    fn test_release_clears_contents() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"left over");
        pool.release(buf);
        assert!(pool.acquire().is_empty());
    }
}
