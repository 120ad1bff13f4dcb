//! Usage-band chunk lists.
//!
//! Six intrusively linked lists route chunks by usage percentage. A chunk
//! enters through qInit, climbs lists as allocations raise its usage (one
//! `add` may hop several lists) and descends as frees lower it; demoting
//! past q000 signals the caller to destroy the chunk. qInit's predecessor
//! is itself, so fresh chunks never leave the pool on underflow.
//!
//! The whole set lives inside the arena's pooled mutex; holding `&mut` on
//! the set is the license for every chunk-state access below.

use std::ptr::NonNull;

use super::buffer::PooledBuf;
use super::chunk::{PoolChunk, LIST_DETACHED};
use super::subpage::SubpageRings;

pub(crate) const Q_INIT: usize = 0;
pub(crate) const Q000: usize = 1;
pub(crate) const Q025: usize = 2;
pub(crate) const Q050: usize = 3;
pub(crate) const Q075: usize = 4;
pub(crate) const Q100: usize = 5;

pub(crate) const LIST_NAMES: [&str; 6] = ["qInit", "q000", "q025", "q050", "q075", "q100"];

/// Allocation search order. q050 first: most likely to satisfy the request
/// without fragmenting a dense chunk. Lightly used lists next, so sparse
/// chunks fill up and can eventually be freed whole. q075/q100 last, to
/// keep near-full chunks out of the line of fire.
pub(crate) const ALLOC_ORDER: [usize; 6] = [Q050, Q025, Q000, Q_INIT, Q075, Q100];

pub(crate) struct ChunkList {
    min_usage: isize,
    max_usage: isize,
    head: Option<NonNull<PoolChunk>>,
    prev: Option<usize>,
    next: Option<usize>,
}

pub(crate) struct ChunkListSet {
    lists: [ChunkList; 6],
}

// Safety: the set (and through it every linked chunk's list state) is only
// reachable behind the arena's pooled mutex.
unsafe impl Send for ChunkListSet {}

impl ChunkListSet {
    pub(crate) fn new() -> Self {
        let l = |min, max, prev, next| ChunkList {
            min_usage: min,
            max_usage: max,
            head: None,
            prev,
            next,
        };
        Self {
            lists: [
                l(isize::MIN, 25, Some(Q_INIT), Some(Q000)),
                l(1, 50, None, Some(Q025)),
                l(25, 50, Some(Q000), Some(Q050)),
                l(50, 75, Some(Q025), Some(Q075)),
                l(75, 99, Some(Q050), Some(Q100)),
                l(100, isize::MAX, Some(Q075), None),
            ],
        }
    }

    /// Try every chunk of list `li` in order. On success the chunk is
    /// promoted if the allocation pushed it past the list's band.
    ///
    /// # Safety
    /// The set is behind the pooled guard (implied by `&mut self`).
    pub(crate) unsafe fn allocate(
        &mut self,
        li: usize,
        buf: &mut PooledBuf,
        req_capacity: usize,
        norm_capacity: usize,
        rings: &SubpageRings,
    ) -> bool {
        let mut cur = self.lists[li].head;
        while let Some(cptr) = cur {
            // Safety: linked chunks are live; pooled guard held.
            let chunk = unsafe { cptr.as_ref() };
            match unsafe { chunk.allocate(norm_capacity, rings) } {
                Some(handle) => {
                    chunk.init_buf(buf, handle, req_capacity, norm_capacity);
                    // Safety: pooled guard held.
                    if unsafe { chunk.usage() } > self.lists[li].max_usage {
                        if let Some(next) = self.lists[li].next {
                            // Safety: pooled guard held.
                            unsafe {
                                self.unlink(li, cptr);
                                self.add(next, cptr);
                            }
                        }
                    }
                    return true;
                }
                // Safety: pooled guard held.
                None => cur = unsafe { chunk.next() },
            }
        }
        false
    }

    /// Release `handle` into its chunk and migrate the chunk down if its
    /// usage fell below the band. Returns `false` when the chunk dropped
    /// out past q000 and must be destroyed by the caller (outside the
    /// pooled guard).
    ///
    /// # Safety
    /// As [`allocate`](Self::allocate); `chunk` is linked in this set.
    pub(crate) unsafe fn free(
        &mut self,
        chunk: NonNull<PoolChunk>,
        handle: u64,
        norm_capacity: usize,
        rings: &SubpageRings,
    ) -> bool {
        // Safety: pooled guard held.
        let li = unsafe { chunk.as_ref().list() };
        debug_assert_ne!(li, LIST_DETACHED, "free on a detached chunk");
        // Safety: pooled guard held.
        unsafe { chunk.as_ref().free(handle, norm_capacity, rings) };
        // Safety: pooled guard held.
        let usage = unsafe { chunk.as_ref().usage() };
        if usage >= self.lists[li].min_usage {
            return true;
        }
        // Safety: pooled guard held.
        unsafe { self.unlink(li, chunk) };
        let mut cur = self.lists[li].prev;
        loop {
            match cur {
                None => return false,
                Some(p) => {
                    if usage >= self.lists[p].min_usage {
                        // Safety: pooled guard held.
                        unsafe { self.link(p, chunk) };
                        return true;
                    }
                    cur = self.lists[p].prev;
                }
            }
        }
    }

    /// Insert a chunk starting at list `li`, hopping forward while its
    /// usage exceeds the band (promotion ends at q100).
    ///
    /// # Safety
    /// As [`allocate`](Self::allocate); `chunk` is currently detached.
    pub(crate) unsafe fn add(&mut self, mut li: usize, chunk: NonNull<PoolChunk>) {
        // Safety: pooled guard held.
        let usage = unsafe { chunk.as_ref().usage() };
        while usage > self.lists[li].max_usage {
            match self.lists[li].next {
                Some(next) => li = next,
                None => break,
            }
        }
        // Safety: pooled guard held.
        unsafe { self.link(li, chunk) };
    }

    /// New chunks always enter through qInit.
    ///
    /// # Safety
    /// As [`add`](Self::add).
    pub(crate) unsafe fn add_new(&mut self, chunk: NonNull<PoolChunk>) {
        // Safety: forwarded contract.
        unsafe { self.add(Q_INIT, chunk) };
    }

    /// # Safety
    /// Pooled guard held; `chunk` is detached.
    unsafe fn link(&mut self, li: usize, cptr: NonNull<PoolChunk>) {
        // Safety: pooled guard held.
        unsafe {
            let chunk = cptr.as_ref();
            chunk.set_list(li);
            chunk.set_prev(None);
            chunk.set_next(self.lists[li].head);
            if let Some(head) = self.lists[li].head {
                head.as_ref().set_prev(Some(cptr));
            }
        }
        self.lists[li].head = Some(cptr);
    }

    /// # Safety
    /// Pooled guard held; `chunk` is linked in list `li`.
    unsafe fn unlink(&mut self, li: usize, cptr: NonNull<PoolChunk>) {
        // Safety: pooled guard held.
        unsafe {
            let chunk = cptr.as_ref();
            let prev = chunk.prev();
            let next = chunk.next();
            match prev {
                Some(p) => p.as_ref().set_next(next),
                None => self.lists[li].head = next,
            }
            if let Some(n) = next {
                n.as_ref().set_prev(prev);
            }
            chunk.set_prev(None);
            chunk.set_next(None);
            chunk.set_list(LIST_DETACHED);
        }
    }

    /// Usage percentages of every linked chunk, per list.
    ///
    /// # Safety
    /// Pooled guard held.
    pub(crate) unsafe fn usages(&self) -> [Vec<isize>; 6] {
        let mut out: [Vec<isize>; 6] = Default::default();
        for (li, list) in self.lists.iter().enumerate() {
            let mut cur = list.head;
            while let Some(cptr) = cur {
                // Safety: pooled guard held.
                unsafe {
                    out[li].push(cptr.as_ref().usage());
                    cur = cptr.as_ref().next();
                }
            }
        }
        out
    }
}

impl Drop for ChunkListSet {
    fn drop(&mut self) {
        // Arena teardown: any chunk still linked is owned by its list.
        // Outstanding buffers at this point are a caller error.
        for list in &mut self.lists {
            let mut cur = list.head.take();
            while let Some(cptr) = cur {
                // Safety: exclusive access during drop; chunks are live.
                unsafe {
                    cur = cptr.as_ref().next();
                    PoolChunk::destroy(cptr);
                }
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::pool::arena::ArenaConfig;
    use crate::pool::buffer::PooledBuf;
    use crate::pool::mem::Backing;

    // 4 KiB pages, 16 pages, 64 KiB chunk.
    fn cfg() -> ArenaConfig {
        ArenaConfig::new(4096, 4).unwrap()
    }

    #[test]
    fn test_new_chunk_enters_qinit_and_climbs() {
        let cfg = cfg();
        let rings = SubpageRings::new(cfg.page_shifts());
        let mut set = ChunkListSet::new();
        let chunk = NonNull::from(Box::leak(PoolChunk::new(Backing::Heap, &cfg).unwrap()));
        // Safety: single-threaded test; the set is the only owner.
        unsafe {
            set.add_new(chunk);
            assert_eq!(chunk.as_ref().list(), Q_INIT);

            // 50% in one allocation: qInit's band tops out at 25.
            let mut buf = PooledBuf::new(usize::MAX);
            assert!(set.allocate(Q_INIT, &mut buf, 32 * 1024, 32 * 1024, &rings));
            assert_eq!(chunk.as_ref().list(), Q000);

            // 75%: q000 tops out at 50, q025 at 50, lands in q050.
            let mut buf2 = PooledBuf::new(usize::MAX);
            assert!(set.allocate(Q000, &mut buf2, 16 * 1024, 16 * 1024, &rings));
            assert_eq!(chunk.as_ref().list(), Q050);

            // Free the big run: 25% is below q050's band, lands in q025.
            assert!(set.free(chunk, buf.handle, 32 * 1024, &rings));
            assert_eq!(chunk.as_ref().list(), Q025);

            // Fully free: past q000's lower bound, destroy signal.
            assert!(!set.free(chunk, buf2.handle, 16 * 1024, &rings));
            PoolChunk::destroy(chunk);
        }
    }

    #[test]
    fn test_allocate_walks_past_exhausted_chunks() {
        let cfg = cfg();
        let rings = SubpageRings::new(cfg.page_shifts());
        let mut set = ChunkListSet::new();
        let full = NonNull::from(Box::leak(PoolChunk::new(Backing::Heap, &cfg).unwrap()));
        let roomy = NonNull::from(Box::leak(PoolChunk::new(Backing::Heap, &cfg).unwrap()));
        // Safety: single-threaded test; the set is the only owner.
        unsafe {
            // Fill the first chunk completely, then force both into q100 /
            // qInit respectively so one list holds both.
            let h = full.as_ref().allocate(64 * 1024, &rings).unwrap();
            set.add_new(full);
            assert_eq!(full.as_ref().list(), Q100);
            set.add_new(roomy);

            let mut buf = PooledBuf::new(usize::MAX);
            // q100 holds only the exhausted chunk.
            assert!(!set.allocate(Q100, &mut buf, 4096, 4096, &rings));
            // qInit's chunk satisfies it.
            assert!(set.allocate(Q_INIT, &mut buf, 4096, 4096, &rings));
            assert_eq!(buf.capacity(), 4096);

            // Cleanup. The roomy chunk stays in qInit on underflow; the
            // full one drops past q000 and must be destroyed here.
            assert!(set.free(roomy, buf.handle, 4096, &rings));
            assert_eq!(roomy.as_ref().list(), Q_INIT);
            assert!(!set.free(full, h, 64 * 1024, &rings));
            PoolChunk::destroy(full);
        }
    }
}
