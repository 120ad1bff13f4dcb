//! Pooled buffer view.
//!
//! A `PooledBuf` is a window into a chunk's backing region: an offset, a
//! caller-visible length, and the normalized length actually reserved for it
//! (`max_length`). The arena creates it on allocation and consumes it on
//! free; dropping it without returning it to the arena leaks the region
//! until the owning chunk is destroyed.

use std::ptr::NonNull;

use super::chunk::PoolChunk;

pub struct PooledBuf {
    base: Option<NonNull<u8>>,
    offset: usize,
    length: usize,
    max_length: usize,
    max_capacity: usize,
    reader_index: usize,
    writer_index: usize,
    pub(crate) chunk: Option<NonNull<PoolChunk>>,
    pub(crate) handle: u64,
}

// Safety: the buffer's region belongs exclusively to its handle while the
// handle is outstanding; no two live buffers from one arena alias.
unsafe impl Send for PooledBuf {}

impl PooledBuf {
    pub(crate) fn new(max_capacity: usize) -> Self {
        Self {
            base: None,
            offset: 0,
            length: 0,
            max_length: 0,
            max_capacity,
            reader_index: 0,
            writer_index: 0,
            chunk: None,
            handle: 0,
        }
    }

    pub(crate) fn init(
        &mut self,
        base: NonNull<u8>,
        chunk: NonNull<PoolChunk>,
        handle: u64,
        offset: usize,
        length: usize,
        max_length: usize,
    ) {
        debug_assert!(length <= max_length);
        self.base = Some(base);
        self.chunk = Some(chunk);
        self.handle = handle;
        self.offset = offset;
        self.length = length;
        self.max_length = max_length;
        self.reader_index = 0;
        self.writer_index = 0;
    }

    pub(crate) fn init_unpooled(&mut self, base: NonNull<u8>, chunk: NonNull<PoolChunk>, length: usize) {
        self.init(base, chunk, 0, 0, length, length);
    }

    /// Caller-visible capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.length
    }

    /// Upper bound this buffer may be reallocated to.
    #[must_use]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Normalized size reserved in the chunk (the free-time size class).
    #[must_use]
    pub(crate) fn max_length(&self) -> usize {
        self.max_length
    }

    #[must_use]
    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    pub(crate) fn memory(&self) -> Option<NonNull<u8>> {
        self.base
    }

    #[must_use]
    pub fn reader_index(&self) -> usize {
        self.reader_index
    }

    #[must_use]
    pub fn writer_index(&self) -> usize {
        self.writer_index
    }

    /// Set both indices.
    ///
    /// # Panics
    ///
    /// Panics unless `reader <= writer <= capacity` (caller error).
    pub fn set_index(&mut self, reader: usize, writer: usize) {
        assert!(
            reader <= writer && writer <= self.length,
            "index out of bounds: reader {reader}, writer {writer}, capacity {}",
            self.length
        );
        self.reader_index = reader;
        self.writer_index = writer;
    }

    #[must_use]
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    #[must_use]
    pub fn writable_bytes(&self) -> usize {
        self.length - self.writer_index
    }

    /// The whole capacity as a byte slice.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self.base {
            // Safety: offset..offset+length is inside the chunk region and
            // exclusively owned by this buffer's handle.
            Some(base) => unsafe {
                std::slice::from_raw_parts(base.as_ptr().add(self.offset), self.length)
            },
            None => &[],
        }
    }

    /// The whole capacity as a mutable byte slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.base {
            // Safety: as in `as_slice`, plus `&mut self` for uniqueness.
            Some(base) => unsafe {
                std::slice::from_raw_parts_mut(base.as_ptr().add(self.offset), self.length)
            },
            None => &mut [],
        }
    }

    /// Append bytes at the writer index.
    ///
    /// # Panics
    ///
    /// Panics when `src` does not fit into the writable region.
    pub fn write_bytes(&mut self, src: &[u8]) {
        let w = self.writer_index;
        assert!(
            src.len() <= self.length - w,
            "write of {} bytes exceeds writable {}",
            src.len(),
            self.length - w
        );
        self.as_mut_slice()[w..w + src.len()].copy_from_slice(src);
        self.writer_index = w + src.len();
    }

    /// Consume bytes at the reader index.
    ///
    /// # Panics
    ///
    /// Panics when fewer than `dst.len()` bytes are readable.
    pub fn read_bytes(&mut self, dst: &mut [u8]) {
        let r = self.reader_index;
        assert!(
            dst.len() <= self.writer_index - r,
            "read of {} bytes exceeds readable {}",
            dst.len(),
            self.writer_index - r
        );
        dst.copy_from_slice(&self.as_slice()[r..r + dst.len()]);
        self.reader_index = r + dst.len();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::pool::mem::{Backing, ChunkMem};

    fn backed_buf(mem: &ChunkMem, offset: usize, length: usize) -> PooledBuf {
        let mut buf = PooledBuf::new(usize::MAX);
        buf.base = Some(mem.base());
        buf.offset = offset;
        buf.length = length;
        buf.max_length = length;
        buf
    }

    #[test]
    fn test_empty_buf_slices() {
        let buf = PooledBuf::new(16);
        assert!(buf.as_slice().is_empty());
        assert_eq!(buf.capacity(), 0);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mem = ChunkMem::allocate(Backing::Heap, 256).unwrap();
        let mut buf = backed_buf(&mem, 64, 32);
        buf.write_bytes(&[1, 2, 3, 4]);
        assert_eq!(buf.readable_bytes(), 4);
        let mut out = [0u8; 4];
        buf.read_bytes(&mut out);
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    #[should_panic(expected = "index out of bounds")]
    fn test_set_index_rejects_inverted() {
        let mem = ChunkMem::allocate(Backing::Heap, 64).unwrap();
        let mut buf = backed_buf(&mem, 0, 32);
        buf.set_index(10, 5);
    }

    #[test]
    #[should_panic(expected = "exceeds writable")]
    fn test_write_past_capacity_panics() {
        let mem = ChunkMem::allocate(Backing::Heap, 64).unwrap();
        let mut buf = backed_buf(&mem, 0, 8);
        buf.write_bytes(&[0u8; 9]);
    }
}
