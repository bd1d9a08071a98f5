use crate::config::BufferPoolLimits;
use crossbeam::queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Fixed-size reusable byte buffers shared by every connection task.
///
/// The pool is a reuse cache, not a semaphore: [`acquire`](BufferPool::acquire)
/// never waits. When the free list is empty a fresh buffer is allocated and
/// counted; [`release`] returns a buffer to the list only while it is under
/// capacity, otherwise the buffer is dropped.
///
/// Buffers are zeroed on release so no request ever observes bytes from a
/// previous one.
#[derive(Debug)]
pub(crate) struct BufferPool {
    free: ArrayQueue<Box<[u8]>>,
    buffer_size: usize,

    outstanding: AtomicU64,
    total_allocated: AtomicU64,
}

impl BufferPool {
    pub(crate) fn new(limits: &BufferPoolLimits) -> Arc<Self> {
        Arc::new(Self {
            free: ArrayQueue::new(limits.capacity.max(1)),
            buffer_size: limits.size,
            outstanding: AtomicU64::new(0),
            total_allocated: AtomicU64::new(0),
        })
    }

    /// Takes a buffer from the pool, allocating when none is pooled.
    pub(crate) fn acquire(self: &Arc<Self>) -> PooledBuf {
        let data = match self.free.pop() {
            Some(buf) => buf,
            None => {
                self.total_allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.buffer_size].into_boxed_slice()
            }
        };

        self.outstanding.fetch_add(1, Ordering::Relaxed);
        PooledBuf {
            data: Some(data),
            pool: self.clone(),
        }
    }

    fn release(&self, mut data: Box<[u8]>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);

        data.fill(0);
        // Full free list: let the allocation die here.
        let _ = self.free.push(data);
    }

    /// Buffer capacity in bytes, identical for every buffer in the pool.
    #[inline]
    pub(crate) fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// `(outstanding, pooled, total_ever_allocated)`.
    pub(crate) fn stats(&self) -> (u64, usize, u64) {
        (
            self.outstanding.load(Ordering::Relaxed),
            self.free.len(),
            self.total_allocated.load(Ordering::Relaxed),
        )
    }
}

/// RAII handle for a pooled buffer; returns it on drop.
#[derive(Debug)]
pub(crate) struct PooledBuf {
    data: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.data.as_ref().unwrap()
    }
}

impl DerefMut for PooledBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_mut().unwrap()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.release(data);
        }
    }
}

#[cfg(test)]
mod pool_tests {
    use super::*;

    fn limits(size: usize, capacity: usize) -> BufferPoolLimits {
        BufferPoolLimits {
            size,
            capacity,
            ..BufferPoolLimits::default()
        }
    }

    #[test]
    fn acquire_release_reuses() {
        let pool = BufferPool::new(&limits(64, 4));

        for _ in 0..16 {
            let buf = pool.acquire();
            assert_eq!(buf.len(), 64);
            drop(buf);
        }

        // One buffer was ever allocated; the rest were reuses.
        let (outstanding, pooled, total) = pool.stats();
        assert_eq!(outstanding, 0);
        assert_eq!(pooled, 1);
        assert_eq!(total, 1);
    }

    #[test]
    fn allocation_tracks_peak_concurrency() {
        let pool = BufferPool::new(&limits(16, 8));

        let held: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        let (outstanding, _, total) = pool.stats();
        assert_eq!(outstanding, 5);
        assert_eq!(total, 5);
        drop(held);

        // Steady state: no new allocations.
        let held: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        let (_, _, total) = pool.stats();
        assert_eq!(total, 5);
        drop(held);
    }

    #[test]
    fn overflow_is_discarded() {
        let pool = BufferPool::new(&limits(16, 2));

        let held: Vec<_> = (0..4).map(|_| pool.acquire()).collect();
        drop(held);

        let (outstanding, pooled, total) = pool.stats();
        assert_eq!(outstanding, 0);
        assert_eq!(pooled, 2);
        assert_eq!(total, 4);
    }

    #[test]
    fn buffers_cleared_on_release() {
        let pool = BufferPool::new(&limits(8, 1));

        let mut buf = pool.acquire();
        buf.copy_from_slice(b"secret!!");
        drop(buf);

        let buf = pool.acquire();
        assert_eq!(&*buf, &[0u8; 8]);
    }
}
