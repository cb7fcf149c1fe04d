//! Chunked, reference-counted byte container.

use std::collections::VecDeque;
use std::fmt;

use bytes::{Bytes, BytesMut};

use super::pool;

/// An ordered sequence of bytes stored as shared, immutable chunks.
///
/// Slicing and shifting never copy: they produce new views over the same
/// reference-counted chunks. A chunk is freed when the last `ByteBuffer`
/// referencing any part of it is dropped.
#[derive(Clone, Default)]
pub struct ByteBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl ByteBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of bytes.
    pub fn size(&self) -> usize {
        self.len
    }

    /// Alias of [`size`](Self::size).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of underlying chunk views.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Iterate over the chunk views in order.
    pub fn chunks(&self) -> impl Iterator<Item = &Bytes> {
        self.chunks.iter()
    }

    /// Copy `data` in, allocating pooled chunks as needed.
    pub fn push(&mut self, data: &[u8]) {
        let pool = pool::global();
        for piece in data.chunks(pool.chunk_size()) {
            self.push_bytes(pool.seal(piece));
        }
    }

    /// Append an existing chunk without copying.
    pub fn push_bytes(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Append all chunks of `other` without copying.
    pub fn append(&mut self, other: ByteBuffer) {
        self.len += other.len;
        self.chunks.extend(other.chunks);
    }

    /// Return a view of `length` bytes starting at `offset`.
    ///
    /// The range is clamped to the bytes available.
    pub fn slice(&self, offset: usize, length: usize) -> ByteBuffer {
        let mut out = ByteBuffer::new();
        let mut skip = offset.min(self.len);
        let mut want = length.min(self.len - skip);

        for chunk in &self.chunks {
            if want == 0 {
                break;
            }
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }
            let end = chunk.len().min(skip + want);
            out.push_bytes(chunk.slice(skip..end));
            want -= end - skip;
            skip = 0;
        }
        out
    }

    /// Remove and return the first `n` bytes, advancing the remainder in place.
    pub fn shift(&mut self, n: usize) -> ByteBuffer {
        let mut remaining = n.min(self.len);
        let mut out = ByteBuffer::new();

        while remaining > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                if let Some(chunk) = self.chunks.pop_front() {
                    self.len -= chunk.len();
                    out.push_bytes(chunk);
                }
            } else {
                let head = front.split_to(remaining);
                self.len -= head.len();
                out.push_bytes(head);
                remaining = 0;
            }
        }
        out
    }

    /// Position of the first occurrence of `byte`, if any.
    pub fn find(&self, byte: u8) -> Option<usize> {
        self.find_from(byte, 0)
    }

    /// Like [`find`](Self::find), skipping the first `start` bytes without
    /// inspecting them.
    pub fn find_from(&self, byte: u8, start: usize) -> Option<usize> {
        let mut base = 0;
        for chunk in &self.chunks {
            let end = base + chunk.len();
            if end > start {
                let skip = start.saturating_sub(base);
                if let Some(pos) = chunk[skip..].iter().position(|b| *b == byte) {
                    return Some(base + skip + pos);
                }
            }
            base = end;
        }
        None
    }

    /// Materialize one contiguous copy.
    ///
    /// A single-chunk buffer returns a shared view; only multi-chunk
    /// buffers are copied.
    pub fn to_contiguous(&self) -> Bytes {
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks[0].clone(),
            _ => {
                let mut out = BytesMut::with_capacity(self.len);
                for chunk in &self.chunks {
                    out.extend_from_slice(chunk);
                }
                out.freeze()
            }
        }
    }

    /// Drop all chunk references.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }

    fn bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.chunks.iter().flat_map(|c| c.iter().copied())
    }
}

impl PartialEq for ByteBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.bytes().eq(other.bytes())
    }
}

impl Eq for ByteBuffer {}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 64;
        let preview: Vec<u8> = self.bytes().take(PREVIEW).collect();
        write!(f, "ByteBuffer({} bytes, {:?}", self.len, String::from_utf8_lossy(&preview))?;
        if self.len > PREVIEW {
            f.write_str("...")?;
        }
        f.write_str(")")
    }
}

impl From<Bytes> for ByteBuffer {
    fn from(chunk: Bytes) -> Self {
        let mut buf = ByteBuffer::new();
        buf.push_bytes(chunk);
        buf
    }
}

impl From<&[u8]> for ByteBuffer {
    fn from(data: &[u8]) -> Self {
        let mut buf = ByteBuffer::new();
        buf.push(data);
        buf
    }
}

impl From<&str> for ByteBuffer {
    fn from(s: &str) -> Self {
        ByteBuffer::from(s.as_bytes())
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(v: Vec<u8>) -> Self {
        ByteBuffer::from(Bytes::from(v))
    }
}

impl From<String> for ByteBuffer {
    fn from(s: String) -> Self {
        ByteBuffer::from(s.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunked(parts: &[&str]) -> ByteBuffer {
        let mut buf = ByteBuffer::new();
        for p in parts {
            buf.push_bytes(Bytes::copy_from_slice(p.as_bytes()));
        }
        buf
    }

    #[test]
    fn size_is_sum_of_chunks() {
        let buf = chunked(&["ab", "cde", "f"]);
        assert_eq!(buf.size(), 6);
        assert_eq!(buf.chunk_count(), 3);
        assert_eq!(buf.chunks().map(|c| c.len()).sum::<usize>(), buf.size());
    }

    #[test]
    fn slice_spans_chunks_without_copying() {
        let buf = chunked(&["ab", "cde", "f"]);
        let s = buf.slice(1, 4);
        assert_eq!(&s.to_contiguous()[..], b"bcde");
        assert_eq!(s.chunk_count(), 2);

        let first = s.chunks().next().unwrap();
        let orig = buf.chunks().next().unwrap();
        assert_eq!(first.as_ptr(), orig[1..].as_ptr());
    }

    #[test]
    fn slice_clamps_out_of_range() {
        let buf = chunked(&["abc"]);
        assert!(buf.slice(10, 2).is_empty());
        assert_eq!(&buf.slice(1, 100).to_contiguous()[..], b"bc");
    }

    #[test]
    fn shift_splits_partial_chunk() {
        let mut buf = chunked(&["ab", "cdef"]);
        let head = buf.shift(3);
        assert_eq!(&head.to_contiguous()[..], b"abc");
        assert_eq!(&buf.to_contiguous()[..], b"def");
        assert_eq!(buf.size(), 3);
    }

    #[test]
    fn shift_past_end_takes_everything() {
        let mut buf = chunked(&["ab", "c"]);
        let all = buf.shift(10);
        assert_eq!(all.size(), 3);
        assert!(buf.is_empty());
    }

    #[test]
    fn push_splits_into_pool_chunks() {
        let size = pool::global().chunk_size();
        let data = vec![7u8; size * 2 + 1];
        let buf = ByteBuffer::from(&data[..]);
        assert_eq!(buf.size(), data.len());
        assert_eq!(buf.chunk_count(), 3);
    }

    #[test]
    fn single_chunk_contiguous_is_shared() {
        let chunk = Bytes::from_static(b"hello");
        let buf = ByteBuffer::from(chunk.clone());
        assert_eq!(buf.to_contiguous().as_ptr(), chunk.as_ptr());
    }

    #[test]
    fn equality_ignores_chunking() {
        assert_eq!(chunked(&["ab", "cd"]), chunked(&["a", "bcd"]));
        assert_ne!(chunked(&["ab"]), chunked(&["abc"]));
    }

    #[test]
    fn find_locates_byte_across_chunks() {
        let buf = chunked(&["ab", "c\nd"]);
        assert_eq!(buf.find(b'\n'), Some(3));
        assert_eq!(buf.find(b'z'), None);
    }

    #[test]
    fn find_from_skips_scanned_prefix() {
        let buf = chunked(&["a\nb", "c\nd"]);
        assert_eq!(buf.find_from(b'\n', 0), Some(1));
        assert_eq!(buf.find_from(b'\n', 2), Some(4));
        assert_eq!(buf.find_from(b'\n', 3), Some(4));
        assert_eq!(buf.find_from(b'\n', 5), None);
        assert_eq!(buf.find_from(b'\n', 99), None);
    }

    #[test]
    fn shared_chunk_survives_original_drop() {
        let buf = chunked(&["shared"]);
        let view = buf.slice(0, 3);
        drop(buf);
        assert_eq!(&view.to_contiguous()[..], b"sha");
    }
}
