//! Byte storage subsystem.
//!
//! # Data Flow
//! ```text
//! socket read / stage transform
//!     → pool.rs (thread arena, sealed chunk)
//!     → ByteBuffer (list of shared chunk views)
//!     → slice / shift / append (no copy)
//!     → to_contiguous (the only copy path)
//! ```
//!
//! # Design Decisions
//! - Chunks are `bytes::Bytes`: immutable once sealed, freed with the last view
//! - Editing means building a new buffer from views, never mutating a chunk

mod byte_buffer;
pub mod pool;

pub use byte_buffer::ByteBuffer;
pub use pool::{ChunkPool, PoolStats, DEFAULT_CHUNK_SIZE};
