//! Subpage slot allocator and size-class rings.
//!
//! A subpage is one page carved into equal slots, tracked by a bitmap. All
//! subpages of one element size hang in a doubly linked ring behind a
//! sentinel head; the head never holds an element and `head.next == head`
//! means the ring is empty. Each ring has its own mutex: every access to a
//! subpage's mutable state or its ring links happens under that ring's
//! guard (the arena's pooled guard is additionally held on the paths that
//! touch the owning chunk's buddy tree).

use std::ptr::NonNull;

use fixedbitset::FixedBitSet;

use crate::sync::cell::UnsafeCell;
use crate::sync::{unsafe_cell_get, unsafe_cell_get_mut, Mutex, MutexGuard};

use super::chunk::PoolChunk;
use super::size_class;

/// High bit of the handle's upper half; distinguishes subpage handles from
/// run handles even when the slot index is 0.
const SUBPAGE_HANDLE_FLAG: u64 = 0x4000_0000_0000_0000;

pub(crate) struct PoolSubpage {
    /// Owning chunk; `None` only for sentinel ring heads.
    chunk: Option<NonNull<PoolChunk>>,
    memory_map_idx: u32,
    page_size: usize,
    /// Guarded by the size-class ring mutex.
    state: UnsafeCell<SubpageState>,
}

struct SubpageState {
    elem_size: usize,
    max_num_elems: usize,
    num_avail: usize,
    next_avail: Option<usize>,
    do_not_destroy: bool,
    bitmap: FixedBitSet,
    prev: Option<NonNull<PoolSubpage>>,
    next: Option<NonNull<PoolSubpage>>,
}

// Safety: all mutable state is confined behind the ring mutex as documented
// on `state`; the remaining fields are immutable after construction.
unsafe impl Send for PoolSubpage {}
// Safety: as above.
unsafe impl Sync for PoolSubpage {}

/// # Safety
/// Caller must hold the subpage's ring guard; the returned borrow must end
/// before state of the same subpage is borrowed again.
unsafe fn state_mut<'a>(sp: NonNull<PoolSubpage>) -> &'a mut SubpageState {
    unsafe_cell_get_mut!(sp.as_ref().state)
}

impl PoolSubpage {
    fn raw(chunk: Option<NonNull<PoolChunk>>, memory_map_idx: u32, page_size: usize) -> Self {
        Self {
            chunk,
            memory_map_idx,
            page_size,
            state: UnsafeCell::new(SubpageState {
                elem_size: 0,
                max_num_elems: 0,
                num_avail: 0,
                next_avail: None,
                do_not_destroy: false,
                bitmap: FixedBitSet::new(),
                prev: None,
                next: None,
            }),
        }
    }

    /// Heap-allocate a subpage for one leaf of `chunk`'s buddy tree. The
    /// caller (the chunk) owns the returned pointer; it is not yet linked
    /// into any ring — follow up with [`init`](Self::init).
    pub(crate) fn boxed(
        chunk: NonNull<PoolChunk>,
        memory_map_idx: u32,
        page_size: usize,
    ) -> NonNull<PoolSubpage> {
        let boxed = Box::new(Self::raw(Some(chunk), memory_map_idx, page_size));
        // Safety: Box never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
    }

    fn boxed_sentinel() -> NonNull<PoolSubpage> {
        let sp = {
            let boxed = Box::new(Self::raw(None, 0, 0));
            // Safety: Box never returns null.
            unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
        };
        // Self-link so an empty ring is `head.next == head`.
        // Safety: not yet shared; no guard needed.
        let st = unsafe { state_mut(sp) };
        st.prev = Some(sp);
        st.next = Some(sp);
        sp
    }

    #[inline]
    pub(crate) fn chunk(&self) -> Option<NonNull<PoolChunk>> {
        self.chunk
    }

    /// (Re-)arm this subpage for `elem_size` slots and link it into the ring
    /// just after the head.
    ///
    /// # Safety
    /// Caller holds the ring guard; the subpage has no outstanding slots.
    pub(crate) unsafe fn init(&self, ring: &mut RingInner, elem_size: usize) {
        debug_assert!(elem_size > 0 && elem_size < self.page_size);
        {
            // Safety: ring guard held.
            let st = unsafe { state_mut(NonNull::from(self)) };
            let max = self.page_size / elem_size;
            st.do_not_destroy = true;
            st.elem_size = elem_size;
            st.max_num_elems = max;
            st.num_avail = max;
            st.next_avail = Some(0);
            st.bitmap.clear();
            st.bitmap.grow(max);
            st.prev = None;
            st.next = None;
        }
        // Safety: ring guard held.
        unsafe { self.add_to_ring(ring) };
    }

    /// Claim one free slot. Returns the full 64-bit handle, or `None` when
    /// every slot is taken (only reachable on an unlinked subpage).
    ///
    /// # Safety
    /// Caller holds the ring guard.
    pub(crate) unsafe fn allocate(&self, ring: &mut RingInner) -> Option<u64> {
        let (slot, emptied) = {
            // Safety: ring guard held.
            let st = unsafe { state_mut(NonNull::from(self)) };
            if st.num_avail == 0 || !st.do_not_destroy {
                return None;
            }
            let slot = match st.next_avail.take() {
                Some(s) => s,
                None => (0..st.max_num_elems).find(|&i| !st.bitmap.contains(i))?,
            };
            debug_assert!(!st.bitmap.contains(slot));
            st.bitmap.insert(slot);
            st.num_avail -= 1;
            (slot, st.num_avail == 0)
        };
        if emptied {
            // Safety: ring guard held.
            unsafe { self.remove_from_ring(ring) };
        }
        Some(SUBPAGE_HANDLE_FLAG | ((slot as u64) << 32) | u64::from(self.memory_map_idx))
    }

    /// Release one slot. Returns `false` when the backing page should be
    /// handed back to the buddy tree: the subpage just became fully free and
    /// it is not the only member of its ring.
    ///
    /// # Safety
    /// Caller holds the ring guard.
    pub(crate) unsafe fn free(&self, ring: &mut RingInner, slot: usize) -> bool {
        enum Outcome {
            Keep,
            Rejoin,
            Leave,
        }
        let outcome = {
            // Safety: ring guard held.
            let st = unsafe { state_mut(NonNull::from(self)) };
            if st.elem_size == 0 {
                // Sentinel head; nothing to release.
                return true;
            }
            debug_assert!(st.bitmap.contains(slot), "slot {slot} double-freed");
            st.bitmap.set(slot, false);
            st.next_avail = Some(slot);
            st.num_avail += 1;
            if st.num_avail == 1 {
                Outcome::Rejoin
            } else if st.num_avail == st.max_num_elems {
                if st.prev == st.next {
                    // Sole ring member; keep it as the class's warm cache.
                    Outcome::Keep
                } else {
                    st.do_not_destroy = false;
                    Outcome::Leave
                }
            } else {
                Outcome::Keep
            }
        };
        match outcome {
            Outcome::Keep => true,
            Outcome::Rejoin => {
                // Safety: ring guard held.
                unsafe { self.add_to_ring(ring) };
                true
            }
            Outcome::Leave => {
                // Safety: ring guard held.
                unsafe { self.remove_from_ring(ring) };
                false
            }
        }
    }

    /// # Safety
    /// Caller holds the ring guard; the subpage is not currently linked.
    unsafe fn add_to_ring(&self, ring: &mut RingInner) {
        let this = NonNull::from(self);
        let head = ring.head;
        // Safety: ring guard held; sentinel links are always set.
        let old_next = unsafe { state_mut(head) }
            .next
            .expect("sentinel links are always set");
        {
            // Safety: ring guard held.
            let st = unsafe { state_mut(this) };
            st.prev = Some(head);
            st.next = Some(old_next);
        }
        // Safety: ring guard held.
        unsafe { state_mut(old_next) }.prev = Some(this);
        // Safety: ring guard held.
        unsafe { state_mut(head) }.next = Some(this);
    }

    /// # Safety
    /// Caller holds the ring guard; the subpage is currently linked.
    unsafe fn remove_from_ring(&self, _ring: &mut RingInner) {
        let (prev, next) = {
            // Safety: ring guard held.
            let st = unsafe { state_mut(NonNull::from(self)) };
            (
                st.prev.take().expect("linked subpage has a prev"),
                st.next.take().expect("linked subpage has a next"),
            )
        };
        // Safety: ring guard held; neighbors are live ring members.
        unsafe { state_mut(prev) }.next = Some(next);
        // Safety: as above.
        unsafe { state_mut(next) }.prev = Some(prev);
    }

    /// # Safety
    /// Caller holds the ring guard.
    pub(crate) unsafe fn ring_next(&self, _ring: &RingInner) -> NonNull<PoolSubpage> {
        unsafe_cell_get!(self.state)
            .next
            .expect("ring member has a next")
    }

    /// # Safety
    /// Caller holds the ring guard.
    pub(crate) unsafe fn elem_size(&self, _ring: &RingInner) -> usize {
        unsafe_cell_get!(self.state).elem_size
    }

    /// # Safety
    /// Caller holds the ring guard.
    pub(crate) unsafe fn num_avail(&self, _ring: &RingInner) -> usize {
        unsafe_cell_get!(self.state).num_avail
    }

    /// # Safety
    /// Caller holds the ring guard.
    pub(crate) unsafe fn max_num_elems(&self, _ring: &RingInner) -> usize {
        unsafe_cell_get!(self.state).max_num_elems
    }
}

/// Ring state behind the mutex: the sentinel head. Holding the guard is the
/// exclusive license to touch any member subpage's state and links.
pub(crate) struct RingInner {
    head: NonNull<PoolSubpage>,
}

// Safety: the sentinel is owned by the ring and only reachable through it.
unsafe impl Send for RingInner {}

impl RingInner {
    #[inline]
    pub(crate) fn head(&self) -> NonNull<PoolSubpage> {
        self.head
    }
}

pub(crate) struct SubpageRing {
    inner: Mutex<RingInner>,
}

impl SubpageRing {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(RingInner {
                head: PoolSubpage::boxed_sentinel(),
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RingInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// `(elem_size, num_avail, max_num_elems)` for each linked subpage.
    pub(crate) fn snapshot(&self) -> Vec<(usize, usize, usize)> {
        let guard = self.lock();
        let head = guard.head();
        let mut out = Vec::new();
        // Safety: ring guard held for the whole walk.
        unsafe {
            let mut cur = head.as_ref().ring_next(&guard);
            while cur != head {
                let sp = cur.as_ref();
                out.push((
                    sp.elem_size(&guard),
                    sp.num_avail(&guard),
                    sp.max_num_elems(&guard),
                ));
                cur = sp.ring_next(&guard);
            }
        }
        out
    }
}

impl Drop for SubpageRing {
    fn drop(&mut self) {
        let head = self.lock().head;
        // Safety: the sentinel is exclusively owned by this ring and member
        // subpages are owned (and freed) by their chunks, never by the ring.
        unsafe { drop(Box::from_raw(head.as_ptr())) };
    }
}

/// All size-class rings of one arena: 32 tiny (index 0 is the sentinel
/// class, kept but never populated) plus `page_shifts - 9` small rings.
pub(crate) struct SubpageRings {
    tiny: Vec<SubpageRing>,
    small: Vec<SubpageRing>,
}

impl SubpageRings {
    pub(crate) fn new(page_shifts: u32) -> Self {
        Self {
            tiny: (0..size_class::NUM_TINY_RINGS)
                .map(|_| SubpageRing::new())
                .collect(),
            small: (0..size_class::num_small_rings(page_shifts))
                .map(|_| SubpageRing::new())
                .collect(),
        }
    }

    pub(crate) fn ring_for(&self, elem_size: usize) -> &SubpageRing {
        if size_class::is_tiny(elem_size) {
            &self.tiny[size_class::tiny_idx(elem_size)]
        } else {
            &self.small[size_class::small_idx(elem_size)]
        }
    }

    pub(crate) fn tiny(&self) -> &[SubpageRing] {
        &self.tiny
    }

    pub(crate) fn small(&self) -> &[SubpageRing] {
        &self.small
    }
}
