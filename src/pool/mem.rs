//! Chunk backing memory.
//!
//! The arena comes in two flavors, selected by a [`Backing`] value at
//! construction: `Heap` chunks live on the process heap, `Direct` chunks are
//! anonymous read/write memory mappings outside the allocator's reach. Both
//! hand the rest of the pool the same `NonNull<u8>` region, so nothing above
//! this module branches on the flavor.

use std::ptr::NonNull;

use super::PoolError;

/// Where chunk storage comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Zero-initialized heap allocation.
    Heap,
    /// Anonymous read/write mapping (mmap on unix). Falls back to the heap
    /// under loom/miri and on targets without mmap.
    Direct,
}

/// Alignment of heap-backed chunks.
const HEAP_ALIGN: usize = 16;

/// Abstract interface for direct-region operations.
pub(crate) trait RegionOps {
    /// Map an anonymous read/write region of `len` bytes.
    unsafe fn map(len: usize) -> Result<NonNull<u8>, PoolError>;

    /// Unmap a region previously returned by [`map`](Self::map).
    unsafe fn unmap(ptr: NonNull<u8>, len: usize);
}

pub(crate) struct PlatformRegionOps;

#[cfg(all(unix, not(any(loom, miri))))]
impl RegionOps for PlatformRegionOps {
    unsafe fn map(len: usize) -> Result<NonNull<u8>, PoolError> {
        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(PoolError::ReservationFailed {
                size: len,
                source: std::io::Error::last_os_error(),
            });
        }

        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| PoolError::ReservationFailed {
            size: len,
            source: std::io::Error::other("mmap returned null"),
        })
    }

    unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
        // Safety: FFI call to munmap; ptr/len came from a successful map.
        unsafe {
            libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), len);
        }
    }
}

// Heap fallback: loom and Miri cannot issue real VM syscalls, and non-unix
// targets have no mmap. Plain zeroed heap memory is sufficient for the pool
// logic; only the release path differs from a real mapping.
#[cfg(any(loom, miri, not(unix)))]
impl RegionOps for PlatformRegionOps {
    unsafe fn map(len: usize) -> Result<NonNull<u8>, PoolError> {
        heap_alloc(len)
    }

    unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
        // Safety: ptr was allocated by heap_alloc with the same len.
        unsafe { heap_free(ptr, len) };
    }
}

fn heap_alloc(len: usize) -> Result<NonNull<u8>, PoolError> {
    let layout = std::alloc::Layout::from_size_align(len, HEAP_ALIGN)
        .map_err(|e| PoolError::ReservationFailed {
            size: len,
            source: std::io::Error::other(e),
        })?;
    // Safety: layout has non-zero size (chunk sizes are never zero).
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    NonNull::new(ptr).ok_or_else(|| PoolError::ReservationFailed {
        size: len,
        source: std::io::Error::new(std::io::ErrorKind::OutOfMemory, "alloc returned null"),
    })
}

/// # Safety
/// `ptr` must come from `heap_alloc(len)` and must not be freed twice.
unsafe fn heap_free(ptr: NonNull<u8>, len: usize) {
    let layout = std::alloc::Layout::from_size_align(len, HEAP_ALIGN)
        .expect("layout was valid at allocation time");
    // Safety: same layout as the allocation, upheld by caller.
    unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
}

/// One chunk's contiguous backing region. Owns the memory; releases it on
/// drop through whichever path allocated it.
pub(crate) struct ChunkMem {
    base: NonNull<u8>,
    len: usize,
    backing: Backing,
}

// Safety: ChunkMem exclusively owns its region.
unsafe impl Send for ChunkMem {}
// Safety: ChunkMem itself is immutable after construction; writes go through
// raw pointers handed out by the pool under its own locking discipline.
unsafe impl Sync for ChunkMem {}

impl ChunkMem {
    pub fn allocate(backing: Backing, len: usize) -> Result<Self, PoolError> {
        debug_assert!(len > 0);
        let base = match backing {
            Backing::Heap => heap_alloc(len)?,
            // Safety: len is non-zero.
            Backing::Direct => unsafe { PlatformRegionOps::map(len)? },
        };
        Ok(Self { base, len, backing })
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for ChunkMem {
    fn drop(&mut self) {
        match self.backing {
            // Safety: base/len are the original allocation; ownership is
            // unique, so this is the only release.
            Backing::Heap => unsafe { heap_free(self.base, self.len) },
            // Safety: as above, via the mapping path.
            Backing::Direct => unsafe { PlatformRegionOps::unmap(self.base, self.len) },
        }
    }
}

/// Platform memory-copy hook used by reallocation.
///
/// # Safety
/// Both regions must be live, at least `len` bytes past their offsets, and
/// must not overlap (handles from the same arena never alias).
pub(crate) unsafe fn memory_copy(
    src: NonNull<u8>,
    src_off: usize,
    dst: NonNull<u8>,
    dst_off: usize,
    len: usize,
) {
    if len == 0 {
        return;
    }
    // Safety: upheld by caller.
    unsafe {
        std::ptr::copy_nonoverlapping(src.as_ptr().add(src_off), dst.as_ptr().add(dst_off), len);
    }
}
