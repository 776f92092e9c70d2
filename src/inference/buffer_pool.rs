/// Pooled f32 buffers for KV cache storage.
///
/// Buffers are keyed by length and recycled on drop, so steady-state
/// operation allocates nothing: after warm-up every acquire is a pop.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct FloatBufferPool {
    available: Mutex<HashMap<usize, Vec<Box<[f32]>>>>,
    allocated_bytes: AtomicUsize,
    pooled_bytes: AtomicUsize,
}

impl FloatBufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            available: Mutex::new(HashMap::new()),
            allocated_bytes: AtomicUsize::new(0),
            pooled_bytes: AtomicUsize::new(0),
        })
    }

    /// Acquire a zeroed buffer of exactly `len` floats, reusing a pooled
    /// one when available.
    pub fn acquire(self: &Arc<Self>, len: usize) -> PooledBuffer {
        let reused = self.available.lock().get_mut(&len).and_then(Vec::pop);
        let data = match reused {
            Some(mut buf) => {
                self.pooled_bytes
                    .fetch_sub(len * std::mem::size_of::<f32>(), Ordering::Relaxed);
                buf.fill(0.0);
                buf
            }
            None => {
                self.allocated_bytes
                    .fetch_add(len * std::mem::size_of::<f32>(), Ordering::Relaxed);
                vec![0.0f32; len].into_boxed_slice()
            }
        };
        PooledBuffer {
            data: Some(data),
            pool: Arc::clone(self),
        }
    }

    fn release(&self, buf: Box<[f32]>) {
        self.pooled_bytes
            .fetch_add(buf.len() * std::mem::size_of::<f32>(), Ordering::Relaxed);
        self.available.lock().entry(buf.len()).or_default().push(buf);
    }

    /// Drop all pooled (idle) buffers.
    pub fn clear(&self) {
        let mut available = self.available.lock();
        for (_, bufs) in available.drain() {
            for buf in bufs {
                self.allocated_bytes
                    .fetch_sub(buf.len() * std::mem::size_of::<f32>(), Ordering::Relaxed);
                self.pooled_bytes
                    .fetch_sub(buf.len() * std::mem::size_of::<f32>(), Ordering::Relaxed);
            }
        }
    }

    pub fn statistics(&self) -> PoolStats {
        PoolStats {
            allocated_bytes: self.allocated_bytes.load(Ordering::Relaxed),
            pooled_bytes: self.pooled_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pool accounting.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Bytes of every buffer this pool has handed out and not freed.
    pub allocated_bytes: usize,
    /// Bytes sitting idle in the pool.
    pub pooled_bytes: usize,
}

/// An owned buffer that returns itself to its pool on drop.
pub struct PooledBuffer {
    data: Option<Box<[f32]>>,
    pool: Arc<FloatBufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        self.data.as_ref().unwrap()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [f32] {
        self.data.as_mut().unwrap()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.data.take() {
            self.pool.release(buf);
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.deref().len())
            .finish()
    }
}
