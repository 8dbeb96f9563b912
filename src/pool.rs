//! Bounded pool of fixed-size copy buffers.

use std::{
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex},
};

/// Size of every buffer handed out by a [`BufferPool`].
pub const BUFFER_SIZE: usize = 64 * 1024;

/// Pool of [`BUFFER_SIZE`] byte buffers used by the response copy loop.
///
/// Leasing never waits: if no idle buffer is available a new one is allocated. At most
/// `max_retained` idle buffers are kept, any surplus is freed when its lease ends.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    idle: Mutex<Vec<Box<[u8]>>>,
    max_retained: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(parallelism * 2)
    }
}

impl BufferPool {
    pub fn new(max_retained: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::with_capacity(max_retained)),
                max_retained,
            }),
        }
    }

    /// Takes a buffer out of the pool. It goes back when the lease is dropped.
    pub fn lease(&self) -> BufferLease {
        let buf = self
            .inner
            .idle
            .lock()
            .ok()
            .and_then(|mut idle| idle.pop())
            .unwrap_or_else(|| vec![0u8; BUFFER_SIZE].into_boxed_slice());
        BufferLease {
            buf: Some(buf),
            pool: self.inner.clone(),
        }
    }

    /// Number of idle buffers currently held by the pool.
    pub fn idle(&self) -> usize {
        self.inner.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}

/// Exclusive use of one pooled buffer.
#[derive(Debug)]
pub struct BufferLease {
    buf: Option<Box<[u8]>>,
    pool: Arc<PoolInner>,
}

impl Deref for BufferLease {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for BufferLease {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        let Some(buf) = self.buf.take() else {
            return;
        };
        if let Ok(mut idle) = self.pool.idle.lock() {
            if idle.len() < self.pool.max_retained {
                idle.push(buf);
            }
        }
    }
}
