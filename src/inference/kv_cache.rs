/// Per-session KV cache with bounded capacity and LRU eviction.
///
/// A process-wide store maps session ids to cache entries and keeps a
/// doubly-linked LRU order, both under a single reader/writer lock; every
/// mutation is a hash lookup plus O(1) list relinks. Entry buffers come
/// from a shared `FloatBufferPool` and go back to it when the entry is
/// evicted or its last handle drops.
///
/// Entry buffers are exclusive to one forward call at a time (the
/// scheduler never puts one session in two batches), so each entry sits
/// behind its own mutex and the store lock is held only for index work.
use super::buffer_pool::{FloatBufferPool, PooledBuffer};
use crate::error::{NoctuaError, NoctuaResult};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub type SessionId = u64;

/// Geometry of one session's cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvShape {
    pub layers: usize,
    pub kv_heads: usize,
    pub head_dim: usize,
    /// Maximum tokens the entry can hold.
    pub capacity: usize,
}

impl KvShape {
    /// Floats in one K (or V) row: one token across all KV heads.
    pub fn row_len(&self) -> usize {
        self.kv_heads * self.head_dim
    }

    fn layer_buffer_len(&self) -> usize {
        self.capacity * self.row_len()
    }

    /// Total buffer bytes for K and V across all layers.
    pub fn total_bytes(&self) -> usize {
        2 * self.layers * self.layer_buffer_len() * std::mem::size_of::<f32>()
    }
}

/// One session's keys and values, per layer, in row-major
/// `[token][kv_head][head_dim]` order.
///
/// Appends are commit-late: the forward pass writes rows past `len` and
/// bumps the length only once the whole pass has been checked for
/// divergence. A failed pass simply never commits, which is the rollback
/// rule: the length snaps back to the pre-call position.
pub struct KvEntry {
    session: SessionId,
    shape: KvShape,
    len: usize,
    k: Vec<PooledBuffer>,
    v: Vec<PooledBuffer>,
}

impl KvEntry {
    /// Standalone entry. Normal creation goes through the store, which
    /// also tracks the entry's bytes against the configured bounds.
    pub fn new(session: SessionId, shape: KvShape, pool: &Arc<FloatBufferPool>) -> Self {
        let layer_len = shape.layer_buffer_len();
        let k = (0..shape.layers).map(|_| pool.acquire(layer_len)).collect();
        let v = (0..shape.layers).map(|_| pool.acquire(layer_len)).collect();
        Self {
            session,
            shape,
            len: 0,
            k,
            v,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn shape(&self) -> KvShape {
        self.shape
    }

    /// Valid token count. Rows below this are complete for every layer.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.shape.capacity
    }

    /// Fail fast when an append of `extra` tokens would run past capacity.
    pub fn ensure_capacity(&self, extra: usize) -> NoctuaResult<()> {
        let required = self.len + extra;
        if required > self.shape.capacity {
            return Err(NoctuaError::KvCacheOverflow {
                capacity: self.shape.capacity,
                required,
            });
        }
        Ok(())
    }

    /// All K rows of a layer; positions `0..len()` plus any rows staged by
    /// an in-flight append.
    pub fn k_rows(&self, layer: usize) -> &[f32] {
        &self.k[layer]
    }

    pub fn v_rows(&self, layer: usize) -> &[f32] {
        &self.v[layer]
    }

    /// Mutable K row at `pos`, for staging an append.
    pub fn k_row_mut(&mut self, layer: usize, pos: usize) -> &mut [f32] {
        let row = self.shape.row_len();
        &mut self.k[layer][pos * row..(pos + 1) * row]
    }

    pub fn v_row_mut(&mut self, layer: usize, pos: usize) -> &mut [f32] {
        let row = self.shape.row_len();
        &mut self.v[layer][pos * row..(pos + 1) * row]
    }

    /// Commit `extra` staged tokens. The length field only ever grows.
    pub fn commit(&mut self, extra: usize) {
        debug_assert!(self.len + extra <= self.shape.capacity);
        self.len += extra;
    }

    /// Reset to empty, keeping the buffers. Used when a driver restarts
    /// prefill after an overflow.
    pub fn reset(&mut self) {
        self.len = 0;
    }

    pub fn memory_bytes(&self) -> usize {
        self.shape.total_bytes()
    }

    pub fn utilization(&self) -> f32 {
        if self.shape.capacity == 0 {
            0.0
        } else {
            self.len as f32 / self.shape.capacity as f32
        }
    }
}

/// Atomic telemetry counters; readers never take the store lock.
#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    bytes_in_use: AtomicUsize,
    entries: AtomicUsize,
}

/// Snapshot of cache telemetry.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub bytes_in_use: usize,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f32 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f32 / total as f32) * 100.0
        }
    }
}

struct StoreSlot {
    entry: Arc<Mutex<KvEntry>>,
    bytes: usize,
    last_access: u64,
    prev: Option<SessionId>,
    next: Option<SessionId>,
}

#[derive(Default)]
struct StoreInner {
    slots: HashMap<SessionId, StoreSlot>,
    /// Most recently used.
    head: Option<SessionId>,
    /// Least recently used; the eviction victim.
    tail: Option<SessionId>,
    total_bytes: usize,
}

impl StoreInner {
    fn unlink(&mut self, id: SessionId) {
        let (prev, next) = {
            let slot = &self.slots[&id];
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slots.get_mut(&p).unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots.get_mut(&n).unwrap().prev = prev,
            None => self.tail = prev,
        }
        let slot = self.slots.get_mut(&id).unwrap();
        slot.prev = None;
        slot.next = None;
    }

    fn push_front(&mut self, id: SessionId) {
        let old_head = self.head;
        {
            let slot = self.slots.get_mut(&id).unwrap();
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(h) = old_head {
            self.slots.get_mut(&h).unwrap().prev = Some(id);
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
    }
}

/// Process-wide KV cache store.
pub struct KvCacheStore {
    inner: RwLock<StoreInner>,
    pool: Arc<FloatBufferPool>,
    max_bytes: usize,
    max_entries: usize,
    counters: CacheCounters,
    clock: AtomicU64,
}

impl KvCacheStore {
    pub fn new(pool: Arc<FloatBufferPool>, max_bytes: usize, max_entries: usize) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            pool,
            max_bytes,
            max_entries,
            counters: CacheCounters::default(),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up or create the entry for `session`, marking it most recently
    /// used. Creation may evict the LRU tail to stay within bounds.
    pub fn acquire(&self, session: SessionId, shape: KvShape) -> NoctuaResult<Arc<Mutex<KvEntry>>> {
        let now = self.tick();
        let mut inner = self.inner.write();

        if inner.slots.contains_key(&session) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            inner.unlink(session);
            inner.push_front(session);
            let slot = inner.slots.get_mut(&session).unwrap();
            slot.last_access = now;
            return Ok(Arc::clone(&slot.entry));
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let bytes = shape.total_bytes();
        if bytes > self.max_bytes {
            return Err(NoctuaError::KvCacheOverflow {
                capacity: self.max_bytes,
                required: bytes,
            });
        }

        let entry = Arc::new(Mutex::new(KvEntry::new(session, shape, &self.pool)));
        inner.slots.insert(
            session,
            StoreSlot {
                entry: Arc::clone(&entry),
                bytes,
                last_access: now,
                prev: None,
                next: None,
            },
        );
        inner.push_front(session);
        inner.total_bytes += bytes;
        self.counters.bytes_in_use.store(inner.total_bytes, Ordering::Relaxed);
        self.counters.entries.store(inner.slots.len(), Ordering::Relaxed);

        self.evict_over_bounds(&mut inner);
        Ok(entry)
    }

    fn evict_over_bounds(&self, inner: &mut StoreInner) {
        while inner.slots.len() > self.max_entries || inner.total_bytes > self.max_bytes {
            let Some(victim) = inner.tail else { break };
            if inner.slots.len() == 1 {
                // never evict the sole (just-inserted) entry
                break;
            }
            self.evict_one(inner, victim);
        }
    }

    fn evict_one(&self, inner: &mut StoreInner, victim: SessionId) {
        inner.unlink(victim);
        if let Some(slot) = inner.slots.remove(&victim) {
            inner.total_bytes -= slot.bytes;
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(session = victim, bytes = slot.bytes, "evicted kv cache entry");
            // dropping the Arc returns the buffers to the pool once any
            // in-flight forward call releases its handle
        }
        self.counters.bytes_in_use.store(inner.total_bytes, Ordering::Relaxed);
        self.counters.entries.store(inner.slots.len(), Ordering::Relaxed);
    }

    /// Remove one session outright (disposal or invalidation).
    pub fn drop_session(&self, session: SessionId) {
        let mut inner = self.inner.write();
        if inner.slots.contains_key(&session) {
            inner.unlink(session);
            if let Some(slot) = inner.slots.remove(&session) {
                inner.total_bytes -= slot.bytes;
            }
            self.counters.bytes_in_use.store(inner.total_bytes, Ordering::Relaxed);
            self.counters.entries.store(inner.slots.len(), Ordering::Relaxed);
        }
    }

    /// Evict LRU entries until the store is back within its bounds.
    pub fn trim(&self) {
        let mut inner = self.inner.write();
        while inner.slots.len() > self.max_entries || inner.total_bytes > self.max_bytes {
            let Some(victim) = inner.tail else { break };
            self.evict_one(&mut inner, victim);
        }
    }

    pub fn contains(&self, session: SessionId) -> bool {
        self.inner.read().slots.contains_key(&session)
    }

    /// Session ids from most to least recently used.
    pub fn sessions_by_recency(&self) -> Vec<SessionId> {
        let inner = self.inner.read();
        let mut out = Vec::with_capacity(inner.slots.len());
        let mut cursor = inner.head;
        while let Some(id) = cursor {
            out.push(id);
            cursor = inner.slots[&id].next;
        }
        out
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            bytes_in_use: self.counters.bytes_in_use.load(Ordering::Relaxed),
            entries: self.counters.entries.load(Ordering::Relaxed),
        }
    }
}
