//! Arena: size-class routing, the Huge path, and reallocation.
//!
//! Locking discipline:
//! - every subpage ring has its own mutex; ring traversal and subpage slot
//!   state are touched only under it;
//! - chunk lists, buddy trees and the Normal/deallocation counters live
//!   behind the single pooled mutex (lock order: pooled, then ring);
//! - Tiny/Small/Huge allocation counters are atomics because their hot
//!   paths never take the pooled mutex;
//! - chunk destruction always happens after the pooled guard is released.

use std::fmt;
use std::ptr::NonNull;

use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{Mutex, MutexGuard};

use super::buffer::PooledBuf;
use super::cache::{CacheEntry, PoolThreadCache};

fn reborrow_cache<'a, 'b: 'a>(
    cache: &'a mut Option<&'b mut dyn PoolThreadCache>,
) -> Option<&'a mut dyn PoolThreadCache> {
    match cache {
        Some(c) => Some(&mut **c),
        None => None,
    }
}
use super::chunk::PoolChunk;
use super::chunk_list::{ChunkListSet, ALLOC_ORDER, LIST_NAMES};
use super::mem::{memory_copy, Backing};
use super::size_class::{self, SizeClass};
use super::stats::Counter;
use super::subpage::SubpageRings;
use super::PoolError;

/// Arena geometry. `page_size` must be a power of two of at least 4096 and
/// `max_order` at most 14; `chunk_size = page_size << max_order`.
#[derive(Debug, Clone, Copy)]
pub struct ArenaConfig {
    page_size: usize,
    max_order: u32,
}

impl ArenaConfig {
    /// # Errors
    ///
    /// Returns `PoolError::Config` when the constraints above are violated.
    pub fn new(page_size: usize, max_order: u32) -> Result<Self, PoolError> {
        if !page_size.is_power_of_two() || page_size < 4096 {
            return Err(PoolError::Config(format!(
                "page_size {page_size} must be a power of two >= 4096"
            )));
        }
        if max_order > 14 {
            return Err(PoolError::Config(format!(
                "max_order {max_order} exceeds maximum 14"
            )));
        }
        if page_size.checked_shl(max_order).is_none() {
            return Err(PoolError::Config(format!(
                "chunk size {page_size} << {max_order} overflows"
            )));
        }
        Ok(Self {
            page_size,
            max_order,
        })
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn page_shifts(&self) -> u32 {
        self.page_size.ilog2()
    }

    #[must_use]
    pub fn max_order(&self) -> u32 {
        self.max_order
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.page_size << self.max_order
    }
}

impl Default for ArenaConfig {
    /// 8 KiB pages, order 11: 16 MiB chunks.
    fn default() -> Self {
        Self {
            page_size: 8192,
            max_order: 11,
        }
    }
}

struct PooledState {
    lists: ChunkListSet,
    allocations_normal: u64,
    deallocations_normal: u64,
    deallocations_small: u64,
    deallocations_tiny: u64,
}

pub struct PoolArena {
    config: ArenaConfig,
    backing: Backing,
    rings: SubpageRings,
    pooled: Mutex<PooledState>,
    allocations_tiny: Counter,
    allocations_small: Counter,
    allocations_huge: Counter,
    deallocations_huge: Counter,
    num_thread_caches: AtomicUsize,
}

impl PoolArena {
    pub fn new(config: ArenaConfig, backing: Backing) -> Self {
        log::debug!(
            "new {:?} arena: page_size={} max_order={} chunk_size={}",
            backing,
            config.page_size(),
            config.max_order(),
            config.chunk_size(),
        );
        Self {
            config,
            backing,
            rings: SubpageRings::new(config.page_shifts()),
            pooled: Mutex::new(PooledState {
                lists: ChunkListSet::new(),
                allocations_normal: 0,
                deallocations_normal: 0,
                deallocations_small: 0,
                deallocations_tiny: 0,
            }),
            allocations_tiny: Counter::new(),
            allocations_small: Counter::new(),
            allocations_huge: Counter::new(),
            deallocations_huge: Counter::new(),
            num_thread_caches: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    #[must_use]
    pub fn is_direct(&self) -> bool {
        matches!(self.backing, Backing::Direct)
    }

    /// Canonicalize a requested capacity (idempotent and monotone).
    #[must_use]
    pub fn normalize(&self, req_capacity: usize) -> usize {
        size_class::normalize(req_capacity, self.config.chunk_size())
    }

    fn lock_pooled(&self) -> MutexGuard<'_, PooledState> {
        self.pooled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Allocate a buffer of `req_capacity` bytes, growable up to
    /// `max_capacity`.
    ///
    /// # Errors
    ///
    /// `PoolError::BadRequest` when `req_capacity > max_capacity`, or a
    /// reservation error when fresh chunk memory cannot be obtained.
    pub fn allocate(
        &self,
        cache: Option<&mut dyn PoolThreadCache>,
        req_capacity: usize,
        max_capacity: usize,
    ) -> Result<PooledBuf, PoolError> {
        if req_capacity > max_capacity {
            return Err(PoolError::BadRequest {
                requested: req_capacity,
                max: max_capacity,
            });
        }
        let mut buf = PooledBuf::new(max_capacity);
        self.allocate_into(cache, &mut buf, req_capacity)?;
        Ok(buf)
    }

    fn allocate_into(
        &self,
        mut cache: Option<&mut dyn PoolThreadCache>,
        buf: &mut PooledBuf,
        req_capacity: usize,
    ) -> Result<(), PoolError> {
        let norm = self.normalize(req_capacity);
        if size_class::is_subpage(norm, self.config.page_size()) {
            let tiny = size_class::is_tiny(norm);
            if let Some(c) = cache.as_mut() {
                let hit = if tiny {
                    c.allocate_tiny(self, buf, req_capacity, norm)
                } else {
                    c.allocate_small(self, buf, req_capacity, norm)
                };
                if hit {
                    return Ok(());
                }
            }
            // Ring fast path: exactly one slot from the first linked
            // subpage, touching nothing but ring-guarded state.
            let ring = self.rings.ring_for(norm);
            let mut guard = ring.lock();
            let head = guard.head();
            // Safety: ring guard held.
            let s = unsafe { head.as_ref().ring_next(&guard) };
            if s != head {
                // Safety: ring guard held; ring members are live subpages.
                let handle = unsafe {
                    let sp = s.as_ref();
                    debug_assert_eq!(sp.elem_size(&guard), norm);
                    sp.allocate(&mut guard)
                };
                if let Some(handle) = handle {
                    // Safety: ring members always belong to a live chunk.
                    let chunk = unsafe { s.as_ref() }
                        .chunk()
                        .expect("ring members belong to a chunk");
                    drop(guard);
                    // Safety: the chunk stays live while its handle is out.
                    unsafe { chunk.as_ref() }.init_buf_with_subpage(buf, handle, req_capacity, norm);
                    if tiny {
                        self.allocations_tiny.add(1);
                    } else {
                        self.allocations_small.add(1);
                    }
                    return Ok(());
                }
            }
            drop(guard);
            return self.allocate_normal(buf, req_capacity, norm);
        }
        if norm <= self.config.chunk_size() {
            if let Some(c) = cache.as_mut() {
                if c.allocate_normal(self, buf, req_capacity, norm) {
                    return Ok(());
                }
            }
            return self.allocate_normal(buf, req_capacity, norm);
        }
        self.allocate_huge(buf, req_capacity)
    }

    fn allocate_normal(
        &self,
        buf: &mut PooledBuf,
        req_capacity: usize,
        norm_capacity: usize,
    ) -> Result<(), PoolError> {
        let mut pooled = self.lock_pooled();
        pooled.allocations_normal += 1;
        for &li in &ALLOC_ORDER {
            // Safety: pooled guard held.
            if unsafe {
                pooled
                    .lists
                    .allocate(li, buf, req_capacity, norm_capacity, &self.rings)
            } {
                return Ok(());
            }
        }
        // Total miss: grow the pool by one chunk.
        let chunk = PoolChunk::new(self.backing, &self.config)?;
        let cptr = NonNull::from(Box::leak(chunk));
        // Safety: pooled guard held; the chunk is fresh and empty.
        unsafe {
            let handle = cptr
                .as_ref()
                .allocate(norm_capacity, &self.rings)
                .expect("a fresh chunk satisfies any pooled allocation");
            cptr.as_ref().init_buf(buf, handle, req_capacity, norm_capacity);
            pooled.lists.add_new(cptr);
        }
        Ok(())
    }

    fn allocate_huge(&self, buf: &mut PooledBuf, req_capacity: usize) -> Result<(), PoolError> {
        let chunk = PoolChunk::new_unpooled(self.backing, req_capacity)?;
        self.allocations_huge.add(1);
        let cptr = NonNull::from(Box::leak(chunk));
        // Safety: fresh chunk, exclusively referenced by the buffer.
        let base = unsafe { cptr.as_ref() }.base();
        buf.init_unpooled(base, cptr, req_capacity);
        Ok(())
    }

    /// Return a buffer's allocation to the pool. The freed handle is first
    /// offered to `cache`; Huge buffers bypass the cache and destroy their
    /// chunk immediately.
    pub fn free(&self, mut buf: PooledBuf, cache: Option<&mut dyn PoolThreadCache>) {
        let Some(chunk) = buf.chunk.take() else {
            return;
        };
        let entry = CacheEntry {
            chunk,
            handle: buf.handle,
            offset: buf.offset(),
            max_length: buf.max_length(),
        };
        self.free_entry(entry, cache);
    }

    fn free_entry(&self, entry: CacheEntry, cache: Option<&mut dyn PoolThreadCache>) {
        // Safety: the chunk stays live while its handle is outstanding.
        if unsafe { entry.chunk.as_ref() }.unpooled() {
            self.deallocations_huge.add(1);
            // Safety: sole handle of an unpooled chunk; pooled guard not held.
            unsafe { PoolChunk::destroy(entry.chunk) };
            return;
        }
        let norm = entry.max_length;
        let class = SizeClass::of(norm, self.config.page_size(), self.config.chunk_size());
        if let Some(c) = cache {
            if c.add(self, entry, norm, class) {
                return;
            }
        }
        self.free_chunk(entry, class);
    }

    fn free_chunk(&self, entry: CacheEntry, class: SizeClass) {
        let destroy = {
            let mut pooled = self.lock_pooled();
            match class {
                SizeClass::Normal => pooled.deallocations_normal += 1,
                SizeClass::Small => pooled.deallocations_small += 1,
                SizeClass::Tiny => pooled.deallocations_tiny += 1,
                SizeClass::Huge => unreachable!("huge frees never reach the pooled path"),
            }
            // Safety: pooled guard held.
            !unsafe {
                pooled
                    .lists
                    .free(entry.chunk, entry.handle, entry.max_length, &self.rings)
            }
        };
        if destroy {
            // Safety: the chunk is fully free and unlinked; guard released,
            // so the potentially expensive release happens outside it.
            unsafe { PoolChunk::destroy(entry.chunk) };
        }
    }

    /// Redeem a cached entry into `buf`. Part of the thread-cache boundary.
    pub fn init_cached(&self, buf: &mut PooledBuf, entry: CacheEntry, req_capacity: usize) {
        debug_assert!(req_capacity <= entry.max_length);
        // Safety: parked entries keep their chunk alive (the slot is still
        // allocated from the chunk's point of view).
        let base = unsafe { entry.chunk.as_ref() }.base();
        buf.init(
            base,
            entry.chunk,
            entry.handle,
            entry.offset,
            req_capacity,
            entry.max_length,
        );
    }

    /// Return an evicted cache entry to its chunk list.
    pub fn free_cached(&self, entry: CacheEntry) {
        let class = SizeClass::of(
            entry.max_length,
            self.config.page_size(),
            self.config.chunk_size(),
        );
        self.free_chunk(entry, class);
    }

    /// Move `buf` to a region of `new_capacity` bytes, copying live data.
    ///
    /// On growth the whole old capacity is copied; on shrink only
    /// `[reader_index, writer_index)` clamped to the new capacity survives,
    /// and both indices are clamped. When `free_old` is set the old region
    /// is released (through `cache` when one is supplied).
    ///
    /// # Errors
    ///
    /// `PoolError::BadRequest` when `new_capacity > buf.max_capacity()`;
    /// reservation errors propagate from allocation. The buffer is left
    /// unchanged on error.
    pub fn reallocate(
        &self,
        buf: &mut PooledBuf,
        new_capacity: usize,
        free_old: bool,
        mut cache: Option<&mut dyn PoolThreadCache>,
    ) -> Result<(), PoolError> {
        if new_capacity > buf.max_capacity() {
            return Err(PoolError::BadRequest {
                requested: new_capacity,
                max: buf.max_capacity(),
            });
        }
        let old_capacity = buf.capacity();
        if old_capacity == new_capacity {
            return Ok(());
        }

        let old_memory = buf.memory();
        let old_offset = buf.offset();
        let old_chunk = buf.chunk.take();
        let old_handle = buf.handle;
        let old_max_length = buf.max_length();
        let mut reader = buf.reader_index();
        let mut writer = buf.writer_index();

        let reborrowed = reborrow_cache(&mut cache);
        if let Err(e) = self.allocate_into(reborrowed, buf, new_capacity) {
            // Leave the buffer exactly as it was.
            buf.chunk = old_chunk;
            return Err(e);
        }

        if let Some(old_mem) = old_memory {
            let new_mem = buf.memory().expect("freshly allocated buffer has memory");
            if new_capacity > old_capacity {
                // Safety: distinct outstanding handles never alias; both
                // regions are live and long enough.
                unsafe { memory_copy(old_mem, old_offset, new_mem, buf.offset(), old_capacity) };
            } else if reader < new_capacity {
                if writer > new_capacity {
                    writer = new_capacity;
                }
                // Safety: as above.
                unsafe {
                    memory_copy(
                        old_mem,
                        old_offset + reader,
                        new_mem,
                        buf.offset() + reader,
                        writer - reader,
                    )
                };
            } else {
                reader = new_capacity;
                writer = new_capacity;
            }
        }
        buf.set_index(reader, writer);

        if free_old {
            if let Some(chunk) = old_chunk {
                self.free_entry(
                    CacheEntry {
                        chunk,
                        handle: old_handle,
                        offset: old_offset,
                        max_length: old_max_length,
                    },
                    cache,
                );
            }
        }
        Ok(())
    }

    /// Record a thread cache binding to this arena (diagnostic only).
    pub fn register_thread_cache(&self) {
        self.num_thread_caches.fetch_add(1, Ordering::Relaxed);
    }

    /// Undo [`register_thread_cache`](Self::register_thread_cache).
    pub fn deregister_thread_cache(&self) {
        self.num_thread_caches.fetch_sub(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn metrics(&self) -> ArenaMetrics {
        let (allocations_normal, deallocations_normal, deallocations_small, deallocations_tiny) = {
            let pooled = self.lock_pooled();
            (
                pooled.allocations_normal,
                pooled.deallocations_normal,
                pooled.deallocations_small,
                pooled.deallocations_tiny,
            )
        };
        ArenaMetrics {
            allocations_tiny: self.allocations_tiny.get(),
            allocations_small: self.allocations_small.get(),
            allocations_normal,
            allocations_huge: self.allocations_huge.get(),
            deallocations_tiny,
            deallocations_small,
            deallocations_normal,
            deallocations_huge: self.deallocations_huge.get(),
            num_thread_caches: self.num_thread_caches.load(Ordering::Relaxed),
        }
    }

    /// Usage percentages of every pooled chunk, per list
    /// (qInit, q000, q025, q050, q075, q100).
    #[must_use]
    pub fn list_usages(&self) -> [Vec<isize>; 6] {
        let pooled = self.lock_pooled();
        // Safety: pooled guard held.
        unsafe { pooled.lists.usages() }
    }

    /// `(elem_size, num_avail, max_num_elems)` of the subpages in tiny ring
    /// `idx`. Index 0 is the reserved sentinel class and always empty.
    #[must_use]
    pub fn tiny_subpages(&self, idx: usize) -> Vec<(usize, usize, usize)> {
        self.rings.tiny()[idx].snapshot()
    }

    /// As [`tiny_subpages`](Self::tiny_subpages) for small ring `idx`.
    #[must_use]
    pub fn small_subpages(&self, idx: usize) -> Vec<(usize, usize, usize)> {
        self.rings.small()[idx].snapshot()
    }
}

impl fmt::Display for PoolArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, usages) in LIST_NAMES.iter().zip(self.list_usages()) {
            writeln!(f, "{name}: {usages:?}")?;
        }
        writeln!(f, "tiny subpages:")?;
        // Index 0 is the sentinel class, intentionally skipped.
        for idx in 1..self.rings.tiny().len() {
            let snap = self.rings.tiny()[idx].snapshot();
            if !snap.is_empty() {
                writeln!(f, "{idx}: {snap:?}")?;
            }
        }
        writeln!(f, "small subpages:")?;
        for (idx, ring) in self.rings.small().iter().enumerate() {
            let snap = ring.snapshot();
            if !snap.is_empty() {
                writeln!(f, "{idx}: {snap:?}")?;
            }
        }
        Ok(())
    }
}

/// Point-in-time counter snapshot.
#[derive(Debug, Clone, Copy)]
pub struct ArenaMetrics {
    pub allocations_tiny: u64,
    pub allocations_small: u64,
    pub allocations_normal: u64,
    pub allocations_huge: u64,
    pub deallocations_tiny: u64,
    pub deallocations_small: u64,
    pub deallocations_normal: u64,
    pub deallocations_huge: u64,
    pub num_thread_caches: usize,
}

impl ArenaMetrics {
    #[must_use]
    pub fn num_allocations(&self) -> u64 {
        self.allocations_tiny
            + self.allocations_small
            + self.allocations_normal
            + self.allocations_huge
    }

    #[must_use]
    pub fn num_deallocations(&self) -> u64 {
        self.deallocations_tiny
            + self.deallocations_small
            + self.deallocations_normal
            + self.deallocations_huge
    }

    #[must_use]
    pub fn num_active_allocations(&self) -> u64 {
        self.num_allocations()
            .saturating_sub(self.num_deallocations())
    }

    #[must_use]
    pub fn num_active_huge(&self) -> u64 {
        self.allocations_huge
            .saturating_sub(self.deallocations_huge)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::pool::cache::BoundedThreadCache;

    fn default_arena() -> PoolArena {
        PoolArena::new(ArenaConfig::default(), Backing::Heap)
    }

    // 4 KiB pages, 16 pages, 64 KiB chunks: cheap to exhaust in tests.
    fn small_arena() -> PoolArena {
        PoolArena::new(ArenaConfig::new(4096, 4).unwrap(), Backing::Heap)
    }

    #[test]
    fn test_s1_tiny_allocation() {
        let arena = default_arena();
        let buf = arena.allocate(None, 24, usize::MAX).unwrap();
        assert_eq!(arena.normalize(24), 32);
        assert_eq!(buf.capacity(), 24);
        assert_eq!(buf.max_length(), 32);
        // One page became a 32-byte subpage: 8192/32 = 256 slots, one taken.
        assert_eq!(arena.tiny_subpages(2), vec![(32, 255, 256)]);
        // The page itself was carved out of a fresh chunk via the normal
        // path (the ring was still empty).
        assert_eq!(arena.metrics().allocations_normal, 1);
        arena.free(buf, None);
    }

    #[test]
    fn test_tiny_ring_fast_path() {
        let arena = default_arena();
        let a = arena.allocate(None, 24, usize::MAX).unwrap();
        let b = arena.allocate(None, 30, usize::MAX).unwrap();
        // Second allocation of the same class comes from the ring.
        assert_eq!(arena.metrics().allocations_tiny, 1);
        assert_eq!(arena.tiny_subpages(2), vec![(32, 254, 256)]);
        assert_ne!(a.handle, b.handle);
        arena.free(a, None);
        arena.free(b, None);
        assert_eq!(arena.metrics().deallocations_tiny, 2);
    }

    #[test]
    fn test_s2_small_allocation() {
        let arena = default_arena();
        let buf = arena.allocate(None, 3000, usize::MAX).unwrap();
        assert_eq!(arena.normalize(3000), 4096);
        assert_eq!(buf.max_length(), 4096);
        // One page split into 8192/4096 = 2 slots; small index 2.
        assert_eq!(arena.small_subpages(2), vec![(4096, 1, 2)]);
        let buf2 = arena.allocate(None, 4000, usize::MAX).unwrap();
        assert_eq!(arena.metrics().allocations_small, 1);
        arena.free(buf, None);
        arena.free(buf2, None);
    }

    #[test]
    fn test_s3_normal_allocation() {
        let arena = default_arena();
        let buf = arena.allocate(None, 40000, usize::MAX).unwrap();
        // 40000 normalizes to 2^16: an 8-page run.
        assert_eq!(buf.max_length(), 65536);
        assert_eq!(buf.capacity(), 40000);
        assert_eq!(arena.metrics().allocations_normal, 1);
        arena.free(buf, None);
        assert_eq!(arena.metrics().deallocations_normal, 1);
    }

    #[test]
    fn test_s4_huge_allocation() {
        let arena = default_arena();
        let chunk_size = arena.config().chunk_size();
        let mut buf = arena.allocate(None, chunk_size + 1, usize::MAX).unwrap();
        assert_eq!(buf.capacity(), chunk_size + 1);
        buf.as_mut_slice()[chunk_size] = 0x7F;
        let m = arena.metrics();
        assert_eq!(m.allocations_huge, 1);
        assert_eq!(m.num_active_huge(), 1);
        // Huge chunks are never pooled.
        assert!(arena.list_usages().iter().all(Vec::is_empty));
        arena.free(buf, None);
        let m = arena.metrics();
        assert_eq!(m.deallocations_huge, 1);
        assert_eq!(m.num_active_huge(), 0);
    }

    #[test]
    fn test_s5_usage_band_promotion() {
        let arena = default_arena();
        let quarter = arena.config().chunk_size() / 4;

        let b1 = arena.allocate(None, quarter, usize::MAX).unwrap();
        assert_eq!(arena.list_usages()[crate::pool::chunk_list::Q_INIT], vec![25]);

        let b2 = arena.allocate(None, quarter, usize::MAX).unwrap();
        assert_eq!(arena.list_usages()[crate::pool::chunk_list::Q000], vec![50]);

        let b3 = arena.allocate(None, quarter, usize::MAX).unwrap();
        assert_eq!(arena.list_usages()[crate::pool::chunk_list::Q050], vec![75]);

        let b4 = arena.allocate(None, quarter, usize::MAX).unwrap();
        assert_eq!(arena.list_usages()[crate::pool::chunk_list::Q100], vec![100]);

        // Demotion mirrors the climb, and the last free destroys the chunk.
        arena.free(b4, None);
        assert_eq!(arena.list_usages()[crate::pool::chunk_list::Q075], vec![75]);
        arena.free(b3, None);
        assert_eq!(arena.list_usages()[crate::pool::chunk_list::Q050], vec![50]);
        arena.free(b2, None);
        assert_eq!(arena.list_usages()[crate::pool::chunk_list::Q025], vec![25]);
        arena.free(b1, None);
        assert!(arena.list_usages().iter().all(Vec::is_empty));
        assert_eq!(arena.metrics().num_active_allocations(), 0);
    }

    #[test]
    fn test_outstanding_buffers_do_not_alias() {
        let arena = small_arena();
        let mut bufs: Vec<PooledBuf> = (0..8)
            .map(|i| arena.allocate(None, 100 + i * 10, usize::MAX).unwrap())
            .collect();
        for (i, buf) in bufs.iter_mut().enumerate() {
            buf.as_mut_slice().fill(i as u8);
        }
        for (i, buf) in bufs.iter().enumerate() {
            assert!(buf.as_slice().iter().all(|&b| b == i as u8));
        }
        for buf in bufs {
            arena.free(buf, None);
        }
    }

    #[test]
    fn test_handles_are_distinct_while_outstanding_and_reusable() {
        let arena = small_arena();
        let a = arena.allocate(None, 5000, usize::MAX).unwrap();
        let b = arena.allocate(None, 5000, usize::MAX).unwrap();
        assert_ne!((a.handle, a.offset()), (b.handle, b.offset()));
        let a_handle = a.handle;
        arena.free(a, None);
        let c = arena.allocate(None, 5000, usize::MAX).unwrap();
        // The freed run is the best fit again.
        assert_eq!(c.handle, a_handle);
        arena.free(b, None);
        arena.free(c, None);
    }

    #[test]
    fn test_bad_request_rejected() {
        let arena = small_arena();
        assert!(matches!(
            arena.allocate(None, 100, 50),
            Err(PoolError::BadRequest { requested: 100, max: 50 })
        ));
    }

    #[test]
    fn test_reallocate_grow_copies_all_data() {
        let arena = small_arena();
        let mut buf = arena.allocate(None, 1000, usize::MAX).unwrap();
        buf.write_bytes(&[0xAA; 600]);
        buf.set_index(100, 600);
        arena.reallocate(&mut buf, 3000, true, None).unwrap();
        assert_eq!(buf.capacity(), 3000);
        assert_eq!(buf.reader_index(), 100);
        assert_eq!(buf.writer_index(), 600);
        assert!(buf.as_slice()[..600].iter().all(|&b| b == 0xAA));
        arena.free(buf, None);
    }

    #[test]
    fn test_reallocate_shrink_truncates_tail() {
        let arena = small_arena();
        let mut buf = arena.allocate(None, 4000, usize::MAX).unwrap();
        let pattern: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        buf.write_bytes(&[0u8; 100]);
        buf.write_bytes(&pattern);
        buf.set_index(100, 300);
        arena.reallocate(&mut buf, 150, true, None).unwrap();
        assert_eq!(buf.capacity(), 150);
        assert_eq!(buf.reader_index(), 100);
        // Writer clamped to the new capacity.
        assert_eq!(buf.writer_index(), 150);
        assert_eq!(&buf.as_slice()[100..150], &pattern[..50]);
        arena.free(buf, None);
    }

    #[test]
    fn test_reallocate_reader_past_new_capacity() {
        let arena = small_arena();
        let mut buf = arena.allocate(None, 4000, usize::MAX).unwrap();
        buf.set_index(3000, 3500);
        arena.reallocate(&mut buf, 1000, true, None).unwrap();
        assert_eq!(buf.reader_index(), 1000);
        assert_eq!(buf.writer_index(), 1000);
        arena.free(buf, None);
    }

    #[test]
    fn test_reallocate_rejects_past_max_capacity() {
        let arena = small_arena();
        let mut buf = arena.allocate(None, 100, 200).unwrap();
        assert!(arena.reallocate(&mut buf, 300, true, None).is_err());
        // Buffer unchanged and still freeable.
        assert_eq!(buf.capacity(), 100);
        arena.free(buf, None);
    }

    #[test]
    fn test_thread_cache_hit_and_decline() {
        let arena = small_arena();
        let mut cache = BoundedThreadCache::with_limits(1, 1, 1);
        arena.register_thread_cache();

        let a = arena.allocate(Some(&mut cache), 100, usize::MAX).unwrap();
        let b = arena.allocate(Some(&mut cache), 100, usize::MAX).unwrap();
        let a_handle = a.handle;
        let a_offset = a.offset();

        // First free parks in the cache, second exceeds the cap of 1 and
        // goes back to the arena.
        arena.free(a, Some(&mut cache));
        assert_eq!(cache.cached_len(), 1);
        arena.free(b, Some(&mut cache));
        assert_eq!(cache.cached_len(), 1);
        assert_eq!(arena.metrics().deallocations_tiny, 1);

        // Cache hit hands back the parked slot without touching the pool
        // (100 normalizes to the same 112-byte class).
        let c = arena.allocate(Some(&mut cache), 100, usize::MAX).unwrap();
        assert_eq!((c.handle, c.offset()), (a_handle, a_offset));
        assert_eq!(cache.cached_len(), 0);

        arena.free(c, None);
        cache.clear(&arena);
        arena.deregister_thread_cache();
        assert_eq!(arena.metrics().num_thread_caches, 0);
    }

    #[test]
    fn test_direct_backing() {
        let arena = PoolArena::new(ArenaConfig::new(4096, 4).unwrap(), Backing::Direct);
        assert!(arena.is_direct());
        let mut buf = arena.allocate(None, 10000, usize::MAX).unwrap();
        buf.as_mut_slice().fill(0x5C);
        assert!(buf.as_slice().iter().all(|&b| b == 0x5C));
        arena.free(buf, None);
    }

    #[test]
    fn test_exhausted_pool_grows_a_second_chunk() {
        let arena = small_arena();
        // Two half-chunk runs fill chunk one; the third forces a new chunk.
        let a = arena.allocate(None, 32 * 1024, usize::MAX).unwrap();
        let b = arena.allocate(None, 32 * 1024, usize::MAX).unwrap();
        let c = arena.allocate(None, 32 * 1024, usize::MAX).unwrap();
        let usages = arena.list_usages();
        assert_eq!(usages.iter().map(Vec::len).sum::<usize>(), 2);
        for buf in [a, b, c] {
            arena.free(buf, None);
        }
        assert!(arena.list_usages().iter().all(Vec::is_empty));
    }

    #[test]
    fn test_display_skips_tiny_sentinel() {
        let arena = default_arena();
        let buf = arena.allocate(None, 24, usize::MAX).unwrap();
        let dump = format!("{arena}");
        assert!(dump.contains("qInit"));
        assert!(dump.contains("tiny subpages:"));
        assert!(dump.contains("2: [(32, 255, 256)]"));
        arena.free(buf, None);
    }

    #[test]
    fn test_normalize_matches_module_function() {
        let arena = default_arena();
        for r in [0, 1, 24, 496, 500, 512, 3000, 8192, 40000] {
            assert_eq!(
                arena.normalize(r),
                crate::pool::size_class::normalize(r, arena.config().chunk_size())
            );
        }
    }
}
