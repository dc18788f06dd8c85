//! Frame buffer pool
//!
//! Preallocates and recycles pixel buffers to keep per-frame heap churn off
//! the capture path. Buffers are partitioned into size classes (one per
//! active resolution); each class has its own lock so acquire and release on
//! different classes never contend.

use crate::error::PipelineError;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// How many recycled buffers a single size class keeps around
const MAX_FREE_PER_CLASS: usize = 8;

struct SizeClass {
    free: Mutex<Vec<Vec<u8>>>,
}

struct PoolInner {
    classes: RwLock<HashMap<usize, Arc<SizeClass>>>,
    outstanding: AtomicUsize,
    misses: AtomicU64,
    hits: AtomicU64,
    cap: usize,
}

impl PoolInner {
    fn class(&self, byte_len: usize) -> Arc<SizeClass> {
        if let Some(class) = self.classes.read().get(&byte_len) {
            return Arc::clone(class);
        }
        let mut classes = self.classes.write();
        Arc::clone(classes.entry(byte_len).or_insert_with(|| {
            Arc::new(SizeClass {
                free: Mutex::new(Vec::new()),
            })
        }))
    }

    fn release(&self, storage: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        let class = self.class(storage.len());
        let mut free = class.free.lock();
        if free.len() < MAX_FREE_PER_CLASS {
            free.push(storage);
        }
    }
}

/// Size-classed, capped buffer pool
///
/// `acquire` never blocks: an empty class allocates a fresh buffer (counted
/// as a pool miss), bounded by a hard cap on outstanding buffers. Exceeding
/// the cap is a resource-exhaustion error that the quality loop treats as a
/// max-severity memory-pressure signal.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                classes: RwLock::new(HashMap::new()),
                outstanding: AtomicUsize::new(0),
                misses: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                cap,
            }),
        }
    }

    /// Acquire a buffer of exactly `byte_len` bytes
    pub fn acquire(&self, byte_len: usize) -> Result<PooledBuffer, PipelineError> {
        let outstanding = self.inner.outstanding.load(Ordering::SeqCst);
        if outstanding >= self.inner.cap {
            return Err(PipelineError::PoolExhausted {
                outstanding,
                cap: self.inner.cap,
            });
        }

        let class = self.inner.class(byte_len);
        let storage = class.free.lock().pop();
        let storage = match storage {
            Some(mut recycled) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                recycled.resize(byte_len, 0);
                recycled
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(byte_len, "pool miss, allocating fresh buffer");
                vec![0u8; byte_len]
            }
        };

        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(PooledBuffer {
            slot: BufferSlot {
                data: storage,
                pool: Arc::downgrade(&self.inner),
            },
        })
    }

    /// Buffers currently handed out and not yet released
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Acquisitions that had to allocate because the class free list was empty
    pub fn misses(&self) -> u64 {
        self.inner.misses.load(Ordering::Relaxed)
    }

    /// Acquisitions served from a free list
    pub fn hits(&self) -> u64 {
        self.inner.hits.load(Ordering::Relaxed)
    }

    /// Whether the pool is at its outstanding-buffer cap
    pub fn is_exhausted(&self) -> bool {
        self.outstanding() >= self.inner.cap
    }
}

struct BufferSlot {
    data: Vec<u8>,
    pool: Weak<PoolInner>,
}

impl Drop for BufferSlot {
    fn drop(&mut self) {
        let storage = std::mem::take(&mut self.data);
        if let Some(pool) = self.pool.upgrade() {
            pool.release(storage);
        }
    }
}

/// A uniquely-owned, writable buffer checked out of the pool
///
/// Freeze it into a [`FrameBuffer`] to share it read-only between consumers.
/// Dropping either form returns the storage to the pool.
pub struct PooledBuffer {
    slot: BufferSlot,
}

impl PooledBuffer {
    /// Convert into a shared, immutable frame buffer
    pub fn freeze(self) -> FrameBuffer {
        FrameBuffer {
            shared: Arc::new(self.slot),
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.slot.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.slot.data
    }
}

/// Shared, immutable pixel storage
///
/// Clones share one allocation; the storage returns to its pool when the
/// last clone drops.
#[derive(Clone)]
pub struct FrameBuffer {
    shared: Arc<BufferSlot>,
}

impl Deref for FrameBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.shared.data
    }
}

impl FrameBuffer {
    /// Build a frame buffer from plain storage, bypassing any pool
    ///
    /// Intended for callers that source pixels outside the pipeline's pool.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            shared: Arc::new(BufferSlot {
                data,
                pool: Weak::new(),
            }),
        }
    }
}
