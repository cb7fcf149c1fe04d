//! Process-wide chunk pool.
//!
//! # Responsibilities
//! - Hand out sealed, reference-counted chunks for copied-in data
//! - Bound allocation churn under sustained throughput
//! - Track issue statistics for diagnostics
//!
//! # Design Decisions
//! - Each thread owns a `BytesMut` arena; no lock on the hot path
//! - Chunks are split off the arena and frozen, so they are immutable once issued
//! - `BytesMut::reserve` reclaims arena storage once every chunk cut from it is dropped
//! - Statistics are global atomics, safe to read from any thread

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use bytes::{Bytes, BytesMut};

/// Default chunk size (16 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

static POOL: OnceLock<ChunkPool> = OnceLock::new();

thread_local! {
    static ARENA: RefCell<BytesMut> = RefCell::new(BytesMut::new());
}

/// Snapshot of pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    /// Number of sealed chunks handed out.
    pub chunks_issued: u64,
    /// Total bytes copied into issued chunks.
    pub bytes_issued: u64,
    /// Number of times a thread arena had to grow or reclaim storage.
    pub refills: u64,
}

/// Shared chunk allocator used by [`ByteBuffer`](super::ByteBuffer) producers.
#[derive(Debug)]
pub struct ChunkPool {
    chunk_size: usize,
    chunks_issued: AtomicU64,
    bytes_issued: AtomicU64,
    refills: AtomicU64,
}

/// Initialize the process-wide pool with the given chunk size.
///
/// Only the first call configures the pool; later calls return the existing
/// instance and log when the requested size differs.
pub fn init(chunk_size: usize) -> &'static ChunkPool {
    let pool = POOL.get_or_init(|| ChunkPool::new(chunk_size));
    if pool.chunk_size != chunk_size {
        tracing::warn!(
            configured = pool.chunk_size,
            requested = chunk_size,
            "Chunk pool already initialized; keeping existing chunk size"
        );
    }
    pool
}

/// Get the process-wide pool, initializing it with defaults if needed.
pub fn global() -> &'static ChunkPool {
    POOL.get_or_init(|| ChunkPool::new(DEFAULT_CHUNK_SIZE))
}

impl ChunkPool {
    fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunks_issued: AtomicU64::new(0),
            bytes_issued: AtomicU64::new(0),
            refills: AtomicU64::new(0),
        }
    }

    /// Size of a single chunk in bytes.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Copy `data` into a sealed chunk.
    ///
    /// `data` must not be larger than [`chunk_size`](Self::chunk_size);
    /// callers split larger inputs first.
    pub fn seal(&self, data: &[u8]) -> Bytes {
        ARENA.with(|arena| {
            let mut arena = arena.borrow_mut();
            if arena.capacity() - arena.len() < data.len() {
                arena.reserve(self.chunk_size.max(data.len()));
                self.refills.fetch_add(1, Ordering::Relaxed);
            }
            arena.extend_from_slice(data);
            self.chunks_issued.fetch_add(1, Ordering::Relaxed);
            self.bytes_issued
                .fetch_add(data.len() as u64, Ordering::Relaxed);
            arena.split().freeze()
        })
    }

    /// Get a fresh read buffer sized to one chunk, for I/O producers.
    pub fn read_buffer(&self) -> BytesMut {
        self.refills.fetch_add(1, Ordering::Relaxed);
        BytesMut::with_capacity(self.chunk_size)
    }

    /// Record a chunk produced outside the arena (e.g. filled by a socket read).
    pub fn record_external(&self, len: usize) {
        self.chunks_issued.fetch_add(1, Ordering::Relaxed);
        self.bytes_issued.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Take a snapshot of the pool statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            chunks_issued: self.chunks_issued.load(Ordering::Relaxed),
            bytes_issued: self.bytes_issued.load(Ordering::Relaxed),
            refills: self.refills.load(Ordering::Relaxed),
        }
    }
}
