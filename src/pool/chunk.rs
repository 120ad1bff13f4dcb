//! Chunk: a buddy allocator over pages.
//!
//! The memory map is a complete binary tree indexed from 1 with one byte per
//! node holding the shallowest depth still allocatable under that node. A
//! node is free at its own depth, partially used when its value is deeper,
//! and fully used at `unusable = max_order + 1`. Runs of `2^k` pages are
//! carved by descending to depth `max_order - k` (left child first);
//! sub-page requests take a leaf and delegate to a [`PoolSubpage`].
//!
//! Every allocation is encoded as a 64-bit handle:
//! bits 0..32 hold the memory-map index, bits 32..64 hold
//! `0x4000_0000 | slot` for subpage handles and 0 for whole runs.

use std::ptr::NonNull;

use crate::sync::cell::UnsafeCell;
use crate::sync::unsafe_cell_get_mut;

use super::arena::ArenaConfig;
use super::buffer::PooledBuf;
use super::mem::{Backing, ChunkMem};
use super::subpage::{PoolSubpage, SubpageRings};
use super::PoolError;

/// List index meaning "not linked into any chunk list".
pub(crate) const LIST_DETACHED: usize = usize::MAX;

#[inline]
pub(crate) fn memory_map_idx(handle: u64) -> u32 {
    handle as u32
}

#[inline]
fn bitmap_field(handle: u64) -> u32 {
    (handle >> 32) as u32
}

#[inline]
pub(crate) fn bitmap_idx(handle: u64) -> u32 {
    bitmap_field(handle) & 0x3FFF_FFFF
}

#[inline]
pub(crate) fn is_subpage_handle(handle: u64) -> bool {
    bitmap_field(handle) != 0
}

pub(crate) struct PoolChunk {
    mem: ChunkMem,
    unpooled: bool,
    page_size: usize,
    page_shifts: u32,
    max_order: u32,
    chunk_size: usize,
    log2_chunk_size: u32,
    /// Number of leaves (= pages); also the index of the leftmost leaf.
    max_subpage_allocs: u32,
    unusable: u8,
    /// `depth_map[id]` is the tree depth of node `id`; immutable.
    depth_map: Box<[u8]>,
    /// Guarded by the owning arena's pooled mutex.
    state: UnsafeCell<ChunkState>,
}

struct ChunkState {
    memory_map: Box<[u8]>,
    free_bytes: usize,
    subpages: Box<[Option<NonNull<PoolSubpage>>]>,
    prev: Option<NonNull<PoolChunk>>,
    next: Option<NonNull<PoolChunk>>,
    list: usize,
}

// Safety: mutable state is confined behind the arena's pooled mutex (tree,
// links, free bytes) or the subpage ring mutexes (slot state); everything
// else is immutable after construction.
unsafe impl Send for PoolChunk {}
// Safety: as above.
unsafe impl Sync for PoolChunk {}

impl PoolChunk {
    pub(crate) fn new(backing: Backing, cfg: &ArenaConfig) -> Result<Box<Self>, PoolError> {
        let chunk_size = cfg.chunk_size();
        let mem = ChunkMem::allocate(backing, chunk_size)?;
        let page_count = 1usize << cfg.max_order();

        let mut depth_map = vec![0u8; page_count << 1].into_boxed_slice();
        for d in 0..=cfg.max_order() {
            for id in (1usize << d)..(1usize << (d + 1)) {
                depth_map[id] = d as u8;
            }
        }
        // Initially every node is free at its own depth.
        let memory_map = depth_map.clone();

        Ok(Box::new(Self {
            mem,
            unpooled: false,
            page_size: cfg.page_size(),
            page_shifts: cfg.page_shifts(),
            max_order: cfg.max_order(),
            chunk_size,
            log2_chunk_size: chunk_size.ilog2(),
            max_subpage_allocs: page_count as u32,
            unusable: (cfg.max_order() + 1) as u8,
            depth_map,
            state: UnsafeCell::new(ChunkState {
                memory_map,
                free_bytes: chunk_size,
                subpages: vec![None; page_count].into_boxed_slice(),
                prev: None,
                next: None,
                list: LIST_DETACHED,
            }),
        }))
    }

    /// A dedicated chunk for one Huge allocation: no tree, never pooled.
    pub(crate) fn new_unpooled(backing: Backing, capacity: usize) -> Result<Box<Self>, PoolError> {
        let mem = ChunkMem::allocate(backing, capacity)?;
        Ok(Box::new(Self {
            mem,
            unpooled: true,
            page_size: 0,
            page_shifts: 0,
            max_order: 0,
            chunk_size: capacity,
            log2_chunk_size: 0,
            max_subpage_allocs: 0,
            unusable: 0,
            depth_map: Box::new([]),
            state: UnsafeCell::new(ChunkState {
                memory_map: Box::new([]),
                free_bytes: 0,
                subpages: Box::new([]),
                prev: None,
                next: None,
                list: LIST_DETACHED,
            }),
        }))
    }

    #[inline]
    pub(crate) fn unpooled(&self) -> bool {
        self.unpooled
    }

    #[inline]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.mem.base()
    }

    /// # Safety
    /// Caller must hold the owning arena's pooled guard; the returned borrow
    /// must end before chunk state is borrowed again.
    unsafe fn state_mut<'a>(&self) -> &'a mut ChunkState {
        unsafe_cell_get_mut!(self.state)
    }

    #[inline]
    fn depth(&self, id: u32) -> u8 {
        self.depth_map[id as usize]
    }

    #[inline]
    pub(crate) fn run_length(&self, id: u32) -> usize {
        1usize << (self.log2_chunk_size - u32::from(self.depth(id)))
    }

    #[inline]
    pub(crate) fn run_offset(&self, id: u32) -> usize {
        let shift = id ^ (1u32 << self.depth(id));
        shift as usize * self.run_length(id)
    }

    /// Usage percentage: `100 * (chunk_size - free_bytes) / chunk_size`.
    /// 100 is reached only when the chunk is completely full.
    ///
    /// # Safety
    /// Caller holds the pooled guard.
    pub(crate) unsafe fn usage(&self) -> isize {
        // Safety: forwarded contract.
        let free = unsafe { self.free_bytes() };
        (100 * (self.chunk_size - free) / self.chunk_size) as isize
    }

    /// # Safety
    /// Caller holds the pooled guard.
    pub(crate) unsafe fn free_bytes(&self) -> usize {
        // Safety: pooled guard held.
        unsafe { self.state_mut() }.free_bytes
    }

    /// Allocate a normalized capacity: a page run at or above the page size,
    /// a subpage slot below it. `None` iff the chunk has no fitting space.
    ///
    /// # Safety
    /// Caller holds the pooled guard.
    pub(crate) unsafe fn allocate(&self, norm_capacity: usize, rings: &SubpageRings) -> Option<u64> {
        debug_assert!(!self.unpooled);
        if norm_capacity >= self.page_size {
            // Safety: pooled guard held.
            unsafe { self.allocate_run(norm_capacity) }
        } else {
            // Safety: pooled guard held.
            unsafe { self.allocate_subpage(norm_capacity, rings) }
        }
    }

    /// # Safety
    /// Caller holds the pooled guard.
    unsafe fn allocate_run(&self, norm_capacity: usize) -> Option<u64> {
        debug_assert!(norm_capacity.is_power_of_two());
        // Safety: pooled guard held.
        let st = unsafe { self.state_mut() };
        let d = self.max_order - (norm_capacity.ilog2() - self.page_shifts);
        let id = self.allocate_node(st, d)?;
        st.free_bytes -= self.run_length(id);
        Some(u64::from(id))
    }

    /// # Safety
    /// Caller holds the pooled guard. Takes the matching ring guard before
    /// touching ring links (lock order: pooled, then ring).
    unsafe fn allocate_subpage(&self, norm_capacity: usize, rings: &SubpageRings) -> Option<u64> {
        let ring = rings.ring_for(norm_capacity);
        let mut guard = ring.lock();
        let sp = {
            // Safety: pooled guard held.
            let st = unsafe { self.state_mut() };
            let id = self.allocate_node(st, self.max_order)?;
            st.free_bytes -= self.page_size;
            let sp_idx = (id ^ self.max_subpage_allocs) as usize;
            match st.subpages[sp_idx] {
                Some(p) => p,
                None => {
                    let p = PoolSubpage::boxed(NonNull::from(self), id, self.page_size);
                    st.subpages[sp_idx] = Some(p);
                    p
                }
            }
        };
        // Safety: ring guard held; the leaf was just taken from the tree, so
        // the subpage has no outstanding slots.
        unsafe {
            sp.as_ref().init(&mut guard, norm_capacity);
            sp.as_ref().allocate(&mut guard)
        }
    }

    /// Descend from the root looking for a node free at depth `d`.
    fn allocate_node(&self, st: &mut ChunkState, d: u32) -> Option<u32> {
        // Low `d` bits clear: `id & initial == 0` while above depth d.
        let initial = u32::MAX << d;
        let mut id: u32 = 1;
        let mut val = st.memory_map[1];
        if u32::from(val) > d {
            return None;
        }
        while u32::from(val) < d || (id & initial) == 0 {
            id <<= 1;
            val = st.memory_map[id as usize];
            if u32::from(val) > d {
                // Left subtree cannot fit; take the sibling.
                id ^= 1;
                val = st.memory_map[id as usize];
            }
        }
        debug_assert_eq!(u32::from(val), d);
        st.memory_map[id as usize] = self.unusable;
        self.update_parents_alloc(st, id);
        Some(id)
    }

    fn update_parents_alloc(&self, st: &mut ChunkState, mut id: u32) {
        while id > 1 {
            let parent = id >> 1;
            let v1 = st.memory_map[id as usize];
            let v2 = st.memory_map[(id ^ 1) as usize];
            st.memory_map[parent as usize] = v1.min(v2);
            id = parent;
        }
    }

    fn update_parents_free(&self, st: &mut ChunkState, mut id: u32) {
        let mut log_child = i32::from(self.depth(id)) + 1;
        while id > 1 {
            let parent = id >> 1;
            let v1 = st.memory_map[id as usize];
            let v2 = st.memory_map[(id ^ 1) as usize];
            log_child -= 1;
            if i32::from(v1) == log_child && i32::from(v2) == log_child {
                // Both buddies free at their natural depth: collapse.
                st.memory_map[parent as usize] = (log_child - 1) as u8;
            } else {
                st.memory_map[parent as usize] = v1.min(v2);
            }
            id = parent;
        }
    }

    /// Release a handle. Must only be called with handles this chunk issued.
    ///
    /// # Safety
    /// Caller holds the pooled guard; `norm_capacity` is the handle's
    /// normalized (free-time) capacity.
    pub(crate) unsafe fn free(&self, handle: u64, norm_capacity: usize, rings: &SubpageRings) {
        let mm_idx = memory_map_idx(handle);
        if is_subpage_handle(handle) {
            let slot = bitmap_idx(handle) as usize;
            let sp = {
                // Safety: pooled guard held.
                let st = unsafe { self.state_mut() };
                st.subpages[(mm_idx ^ self.max_subpage_allocs) as usize]
                    .expect("subpage handle refers to an initialized subpage")
            };
            let ring = rings.ring_for(norm_capacity);
            let mut guard = ring.lock();
            // Safety: ring guard held.
            if unsafe { sp.as_ref().free(&mut guard, slot) } {
                return;
            }
            // Subpage fully freed and left its ring: reclaim the page below.
        }
        // Safety: pooled guard held.
        let st = unsafe { self.state_mut() };
        st.free_bytes += self.run_length(mm_idx);
        st.memory_map[mm_idx as usize] = self.depth(mm_idx);
        self.update_parents_free(st, mm_idx);
    }

    /// Point the caller's buffer view at the allocation behind `handle`.
    pub(crate) fn init_buf(&self, buf: &mut PooledBuf, handle: u64, req_capacity: usize, norm_capacity: usize) {
        if is_subpage_handle(handle) {
            self.init_buf_with_subpage(buf, handle, req_capacity, norm_capacity);
        } else {
            let id = memory_map_idx(handle);
            let len = self.run_length(id);
            debug_assert!(req_capacity <= len);
            buf.init(
                self.mem.base(),
                NonNull::from(self),
                handle,
                self.run_offset(id),
                req_capacity,
                len,
            );
        }
    }

    /// As [`init_buf`](Self::init_buf) for a subpage handle; `elem_size` is
    /// the slot size (the class's normalized capacity).
    pub(crate) fn init_buf_with_subpage(
        &self,
        buf: &mut PooledBuf,
        handle: u64,
        req_capacity: usize,
        elem_size: usize,
    ) {
        debug_assert!(is_subpage_handle(handle));
        debug_assert!(req_capacity <= elem_size);
        let id = memory_map_idx(handle);
        let slot = bitmap_idx(handle) as usize;
        let offset = self.run_offset(id) + slot * elem_size;
        buf.init(
            self.mem.base(),
            NonNull::from(self),
            handle,
            offset,
            req_capacity,
            elem_size,
        );
    }

    // ----- chunk-list bookkeeping, all under the pooled guard -----

    /// # Safety
    /// Caller holds the pooled guard.
    pub(crate) unsafe fn list(&self) -> usize {
        // Safety: pooled guard held.
        unsafe { self.state_mut() }.list
    }

    /// # Safety
    /// Caller holds the pooled guard.
    pub(crate) unsafe fn set_list(&self, list: usize) {
        // Safety: pooled guard held.
        unsafe { self.state_mut() }.list = list;
    }

    /// # Safety
    /// Caller holds the pooled guard.
    pub(crate) unsafe fn prev(&self) -> Option<NonNull<PoolChunk>> {
        // Safety: pooled guard held.
        unsafe { self.state_mut() }.prev
    }

    /// # Safety
    /// Caller holds the pooled guard.
    pub(crate) unsafe fn set_prev(&self, prev: Option<NonNull<PoolChunk>>) {
        // Safety: pooled guard held.
        unsafe { self.state_mut() }.prev = prev;
    }

    /// # Safety
    /// Caller holds the pooled guard.
    pub(crate) unsafe fn next(&self) -> Option<NonNull<PoolChunk>> {
        // Safety: pooled guard held.
        unsafe { self.state_mut() }.next
    }

    /// # Safety
    /// Caller holds the pooled guard.
    pub(crate) unsafe fn set_next(&self, next: Option<NonNull<PoolChunk>>) {
        // Safety: pooled guard held.
        unsafe { self.state_mut() }.next = next;
    }

    /// Free the chunk and everything it owns.
    ///
    /// # Safety
    /// `chunk` was produced by `Box::into_raw`, no handles into it are
    /// outstanding, and the caller is outside the pooled guard (releasing
    /// backing memory can be expensive).
    pub(crate) unsafe fn destroy(chunk: NonNull<PoolChunk>) {
        // Safety: exclusive ownership per the contract above.
        unsafe { drop(Box::from_raw(chunk.as_ptr())) };
    }
}

impl Drop for PoolChunk {
    fn drop(&mut self) {
        // `&mut self`: exclusive, no guard needed.
        let st = unsafe_cell_get_mut!(self.state);
        for slot in st.subpages.iter_mut() {
            if let Some(sp) = slot.take() {
                // Safety: subpages are exclusively owned by their chunk; any
                // ring membership ended before the chunk was detached.
                unsafe { drop(Box::from_raw(sp.as_ptr())) };
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::pool::size_class::normalize;

    // 4 KiB pages, 16 pages, 64 KiB chunk.
    fn small_cfg() -> ArenaConfig {
        ArenaConfig::new(4096, 4).unwrap()
    }

    fn chunk_and_rings() -> (Box<PoolChunk>, SubpageRings) {
        let cfg = small_cfg();
        (
            PoolChunk::new(Backing::Heap, &cfg).unwrap(),
            SubpageRings::new(cfg.page_shifts()),
        )
    }

    #[test]
    fn test_run_allocation_and_free_bytes() {
        let (chunk, rings) = chunk_and_rings();
        // Safety: single-threaded test owns the chunk.
        unsafe {
            assert_eq!(chunk.free_bytes(), 64 * 1024);
            let h = chunk.allocate(8192, &rings).unwrap();
            assert!(!is_subpage_handle(h));
            assert_eq!(chunk.free_bytes(), 64 * 1024 - 8192);
            assert_eq!(chunk.run_length(memory_map_idx(h)), 8192);
            chunk.free(h, 8192, &rings);
            assert_eq!(chunk.free_bytes(), 64 * 1024);
        }
    }

    #[test]
    fn test_whole_chunk_run() {
        let (chunk, rings) = chunk_and_rings();
        // Safety: single-threaded test owns the chunk.
        unsafe {
            let h = chunk.allocate(64 * 1024, &rings).unwrap();
            assert_eq!(memory_map_idx(h), 1);
            assert_eq!(chunk.free_bytes(), 0);
            assert_eq!(chunk.usage(), 100);
            assert!(chunk.allocate(4096, &rings).is_none());
            chunk.free(h, 64 * 1024, &rings);
            assert_eq!(chunk.usage(), 0);
        }
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let (chunk, rings) = chunk_and_rings();
        // Safety: single-threaded test owns the chunk.
        unsafe {
            let mut handles = Vec::new();
            for _ in 0..16 {
                handles.push(chunk.allocate(4096, &rings).unwrap());
            }
            assert!(chunk.allocate(4096, &rings).is_none());
            for h in handles {
                chunk.free(h, 4096, &rings);
            }
            assert_eq!(chunk.free_bytes(), 64 * 1024);
        }
    }

    #[test]
    fn test_buddy_collapse_allows_larger_run() {
        let (chunk, rings) = chunk_and_rings();
        // Safety: single-threaded test owns the chunk.
        unsafe {
            // Take every page, then free them all; the tree must collapse so
            // a full-chunk run fits again.
            let handles: Vec<u64> = (0..16)
                .map(|_| chunk.allocate(4096, &rings).unwrap())
                .collect();
            for h in handles {
                chunk.free(h, 4096, &rings);
            }
            let h = chunk.allocate(64 * 1024, &rings).unwrap();
            assert_eq!(memory_map_idx(h), 1);
            chunk.free(h, 64 * 1024, &rings);
        }
    }

    #[test]
    fn test_distinct_runs_do_not_overlap() {
        let (chunk, rings) = chunk_and_rings();
        // Safety: single-threaded test owns the chunk.
        unsafe {
            let a = chunk.allocate(8192, &rings).unwrap();
            let b = chunk.allocate(8192, &rings).unwrap();
            let (ia, ib) = (memory_map_idx(a), memory_map_idx(b));
            assert_ne!(ia, ib);
            let (oa, ob) = (chunk.run_offset(ia), chunk.run_offset(ib));
            assert!(oa + 8192 <= ob || ob + 8192 <= oa);
        }
    }

    #[test]
    fn test_subpage_allocation() {
        let (chunk, rings) = chunk_and_rings();
        // Safety: single-threaded test owns the chunk.
        unsafe {
            let norm = normalize(24, 64 * 1024);
            assert_eq!(norm, 32);
            let h = chunk.allocate(norm, &rings).unwrap();
            assert!(is_subpage_handle(h));
            assert_eq!(bitmap_idx(h), 0);
            // One page consumed, carved into 4096/32 = 128 slots.
            assert_eq!(chunk.free_bytes(), 64 * 1024 - 4096);
            let snap = rings.ring_for(norm).snapshot();
            assert_eq!(snap, vec![(32, 127, 128)]);
            chunk.free(h, norm, &rings);
            let snap = rings.ring_for(norm).snapshot();
            assert_eq!(snap, vec![(32, 128, 128)]);
            // Sole ring member stays cached; the page is not reclaimed.
            assert_eq!(chunk.free_bytes(), 64 * 1024 - 4096);
        }
    }

    #[test]
    fn test_fully_free_subpage_keeps_or_returns_its_page() {
        let (chunk, rings) = chunk_and_rings();
        // Safety: single-threaded test owns the chunk.
        unsafe {
            // Chunk-level subpage allocation always carves a fresh leaf; the
            // ring fast path (slot packing) lives in the arena.
            let h1 = chunk.allocate(2048, &rings).unwrap();
            assert_eq!(chunk.free_bytes(), 64 * 1024 - 4096);
            // Fully free but the sole ring member: stays as the warm cache.
            chunk.free(h1, 2048, &rings);
            assert_eq!(chunk.free_bytes(), 64 * 1024 - 4096);
            assert_eq!(rings.ring_for(2048).snapshot(), vec![(2048, 2, 2)]);

            let h2 = chunk.allocate(2048, &rings).unwrap();
            assert_eq!(chunk.free_bytes(), 64 * 1024 - 2 * 4096);
            // Fully free with another subpage in the ring: page reclaimed.
            chunk.free(h2, 2048, &rings);
            assert_eq!(chunk.free_bytes(), 64 * 1024 - 4096);
            assert_eq!(rings.ring_for(2048).snapshot(), vec![(2048, 2, 2)]);
        }
    }

    #[test]
    fn test_subpage_handles_are_distinct() {
        let (chunk, rings) = chunk_and_rings();
        // Safety: single-threaded test owns the chunk.
        unsafe {
            let a = chunk.allocate(32, &rings).unwrap();
            let b = chunk.allocate(32, &rings).unwrap();
            assert_ne!(a, b);
            // Distinct leaves, slot 0 of each; the flag bit still marks both
            // as subpage handles.
            assert_ne!(memory_map_idx(a), memory_map_idx(b));
            assert_eq!(bitmap_idx(a), 0);
            assert_eq!(bitmap_idx(b), 0);
            assert!(is_subpage_handle(a) && is_subpage_handle(b));
            chunk.free(a, 32, &rings);
            chunk.free(b, 32, &rings);
        }
    }
}
