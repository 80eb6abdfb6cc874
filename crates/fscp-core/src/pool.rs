//! Fixed-block memory pool for datagram I/O.
//!
//! Preallocates `block_count` blocks of `block_size` bytes. Allocation pops
//! a free block in constant time; dropping a buffer returns its block. When
//! the pool is exhausted and heap fallback is enabled, overflow buffers come
//! from the heap and are simply freed on drop; with fallback disabled,
//! allocation fails.
//!
//! Buffers can be frozen into reference-counted [`SharedBuffer`]s so the
//! same bytes can sit in a retransmission slot and a send queue at once.
//! Every per-datagram allocation in the engine goes through this pool.

use crate::error::Error;
use std::sync::{Arc, Mutex};

/// Memory pool sizing
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Size of each block in bytes
    pub block_size: usize,
    /// Number of preallocated blocks
    pub block_count: usize,
    /// Allocate from the heap when the pool is exhausted
    pub heap_fallback: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            block_size: 65536,
            block_count: 32,
            heap_fallback: true,
        }
    }
}

struct PoolInner {
    config: PoolConfig,
    free: Mutex<Vec<Box<[u8]>>>,
}

/// A pool of fixed-size I/O buffers.
///
/// Cheap to clone; all clones share the same blocks.
#[derive(Clone)]
pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

impl MemoryPool {
    /// Create a pool, preallocating all blocks up front.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let free = (0..config.block_count)
            .map(|_| vec![0u8; config.block_size].into_boxed_slice())
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                config,
                free: Mutex::new(free),
            }),
        }
    }

    /// The configured block size
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.inner.config.block_size
    }

    /// Number of blocks currently free
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.free.lock().map(|free| free.len()).unwrap_or(0)
    }

    /// Allocate a buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] when no block is free and heap
    /// fallback is disabled.
    pub fn allocate(&self) -> Result<PooledBuffer, Error> {
        let block = self
            .inner
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop());

        match block {
            Some(storage) => Ok(PooledBuffer {
                storage: Some(storage),
                len: 0,
                from_pool: true,
                pool: Arc::clone(&self.inner),
            }),
            None if self.inner.config.heap_fallback => Ok(PooledBuffer {
                storage: Some(vec![0u8; self.inner.config.block_size].into_boxed_slice()),
                len: 0,
                from_pool: false,
                pool: Arc::clone(&self.inner),
            }),
            None => Err(Error::PoolExhausted),
        }
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

/// An exclusively owned buffer backed by the pool (or heap overflow).
///
/// Tracks a logical length within the fixed-size block. The block returns
/// to the pool on drop.
pub struct PooledBuffer {
    storage: Option<Box<[u8]>>,
    len: usize,
    from_pool: bool,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Full block capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.storage.as_ref().map_or(0, |s| s.len())
    }

    /// Logical length
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the logical length is zero
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the logical length after writing into the block.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the block capacity; that is a programming
    /// error, not a runtime condition.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity(), "length exceeds block capacity");
        self.len = len;
    }

    /// The valid bytes
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match &self.storage {
            Some(storage) => &storage[..self.len],
            None => &[],
        }
    }

    /// The whole block, for writing
    pub fn block_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Some(storage) => storage,
            None => &mut [],
        }
    }

    /// The valid bytes, mutably
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len;
        match &mut self.storage {
            Some(storage) => &mut storage[..len],
            None => &mut [],
        }
    }

    /// Copy `data` into the buffer and set the logical length.
    ///
    /// # Panics
    ///
    /// Panics if `data` exceeds the block capacity.
    pub fn copy_from(&mut self, data: &[u8]) {
        assert!(data.len() <= self.capacity(), "data exceeds block capacity");
        self.block_mut()[..data.len()].copy_from_slice(data);
        self.len = data.len();
    }

    /// Freeze into a reference-counted immutable buffer.
    #[must_use]
    pub fn freeze(self) -> SharedBuffer {
        SharedBuffer(Arc::new(self))
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if self.from_pool {
            if let Some(storage) = self.storage.take() {
                if let Ok(mut free) = self.pool.free.lock() {
                    free.push(storage);
                }
            }
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("from_pool", &self.from_pool)
            .finish()
    }
}

/// Immutable, cloneable view of a frozen [`PooledBuffer`].
///
/// The underlying block returns to the pool once the last clone drops.
#[derive(Clone, Debug)]
pub struct SharedBuffer(Arc<PooledBuffer>);

impl SharedBuffer {
    /// The valid bytes
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    /// Logical length
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the logical length is zero
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for SharedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_return() {
        let pool = MemoryPool::new(PoolConfig {
            block_size: 128,
            block_count: 2,
            heap_fallback: false,
        });
        assert_eq!(pool.available(), 2);

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_eq!(pool.available(), 0);
        assert_eq!(a.capacity(), 128);

        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_exhaustion_without_fallback() {
        let pool = MemoryPool::new(PoolConfig {
            block_size: 64,
            block_count: 1,
            heap_fallback: false,
        });
        let _held = pool.allocate().unwrap();
        assert!(matches!(pool.allocate(), Err(Error::PoolExhausted)));
    }

    #[test]
    fn test_heap_fallback() {
        let pool = MemoryPool::new(PoolConfig {
            block_size: 64,
            block_count: 1,
            heap_fallback: true,
        });
        let _held = pool.allocate().unwrap();
        let overflow = pool.allocate().unwrap();
        assert_eq!(overflow.capacity(), 64);

        // Heap overflow buffers do not grow the pool when dropped.
        drop(overflow);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_write_and_read_back() {
        let pool = MemoryPool::default();
        let mut buf = pool.allocate().unwrap();
        buf.block_mut()[..5].copy_from_slice(b"hello");
        buf.set_len(5);
        assert_eq!(buf.as_slice(), b"hello");
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_copy_from() {
        let pool = MemoryPool::default();
        let mut buf = pool.allocate().unwrap();
        buf.copy_from(b"datagram bytes");
        assert_eq!(buf.as_slice(), b"datagram bytes");
    }

    #[test]
    #[should_panic(expected = "length exceeds block capacity")]
    fn test_set_len_past_capacity_panics() {
        let pool = MemoryPool::new(PoolConfig {
            block_size: 8,
            block_count: 1,
            heap_fallback: false,
        });
        let mut buf = pool.allocate().unwrap();
        buf.set_len(9);
    }

    #[test]
    fn test_shared_buffer_clones_one_block() {
        let pool = MemoryPool::new(PoolConfig {
            block_size: 32,
            block_count: 1,
            heap_fallback: false,
        });
        let mut buf = pool.allocate().unwrap();
        buf.copy_from(b"shared");
        let shared = buf.freeze();
        let clone = shared.clone();
        assert_eq!(shared.as_slice(), b"shared");
        assert_eq!(clone.as_slice(), b"shared");
        assert_eq!(pool.available(), 0);

        drop(shared);
        assert_eq!(pool.available(), 0);
        drop(clone);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_reuse_after_drop_is_clean_slate() {
        let pool = MemoryPool::new(PoolConfig {
            block_size: 16,
            block_count: 1,
            heap_fallback: false,
        });
        {
            let mut buf = pool.allocate().unwrap();
            buf.copy_from(b"old contents");
        }
        let buf = pool.allocate().unwrap();
        assert_eq!(buf.len(), 0);
        assert!(buf.as_slice().is_empty());
    }
}
