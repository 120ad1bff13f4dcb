//! Thread-cache boundary.
//!
//! The arena consults an optional per-thread cache before touching shared
//! state and offers freed handles to it before returning them to the chunk
//! lists. The cache is opaque to the pool core: it only sees the trait
//! hooks plus [`CacheEntry`] tokens it can hold on to and later redeem via
//! [`PoolArena::init_cached`] / [`PoolArena::free_cached`].

use std::ptr::NonNull;

use super::arena::PoolArena;
use super::buffer::PooledBuf;
use super::chunk::PoolChunk;
use super::size_class::{self, SizeClass};

/// An allocation parked in a thread cache: the owning chunk, its 64-bit
/// handle and the precomputed buffer view. While parked, the slot stays
/// allocated from the chunk's point of view, so the chunk cannot be
/// destroyed out from under the entry.
///
/// Entries must be redeemed against the arena that produced them.
#[derive(Clone, Copy)]
pub struct CacheEntry {
    pub(crate) chunk: NonNull<PoolChunk>,
    pub(crate) handle: u64,
    pub(crate) offset: usize,
    pub(crate) max_length: usize,
}

// Safety: the entry's chunk stays live while the handle is outstanding, and
// ownership of the handle moves with the entry.
unsafe impl Send for CacheEntry {}

/// Hooks the arena calls on the caller-supplied per-thread cache.
///
/// Implementations are expected to be thread-confined; the arena never
/// shares one across threads.
pub trait PoolThreadCache {
    /// Serve a tiny allocation from the cache. `true` when `buf` was
    /// initialized.
    fn allocate_tiny(
        &mut self,
        arena: &PoolArena,
        buf: &mut PooledBuf,
        req_capacity: usize,
        norm_capacity: usize,
    ) -> bool;

    /// Serve a small allocation from the cache.
    fn allocate_small(
        &mut self,
        arena: &PoolArena,
        buf: &mut PooledBuf,
        req_capacity: usize,
        norm_capacity: usize,
    ) -> bool;

    /// Serve a normal (page-run) allocation from the cache.
    fn allocate_normal(
        &mut self,
        arena: &PoolArena,
        buf: &mut PooledBuf,
        req_capacity: usize,
        norm_capacity: usize,
    ) -> bool;

    /// Offer a freed handle to the cache. `false` declines, and the arena
    /// returns the handle to its chunk list instead.
    fn add(
        &mut self,
        arena: &PoolArena,
        entry: CacheEntry,
        norm_capacity: usize,
        class: SizeClass,
    ) -> bool;
}

/// Reference cache: per-class LIFO stacks with per-class entry caps.
///
/// Normal runs are cached only up to `max_cached_normal` bytes; everything
/// larger is declined so big runs go straight back to their chunk.
pub struct BoundedThreadCache {
    tiny: Vec<Vec<CacheEntry>>,
    small: Vec<Vec<CacheEntry>>,
    normal: Vec<(usize, Vec<CacheEntry>)>,
    tiny_cap: usize,
    small_cap: usize,
    normal_cap: usize,
    max_cached_normal: usize,
}

impl BoundedThreadCache {
    pub fn new() -> Self {
        Self::with_limits(64, 32, 8)
    }

    pub fn with_limits(tiny_cap: usize, small_cap: usize, normal_cap: usize) -> Self {
        Self {
            tiny: (0..size_class::NUM_TINY_RINGS).map(|_| Vec::new()).collect(),
            small: Vec::new(),
            normal: Vec::new(),
            tiny_cap,
            small_cap,
            normal_cap,
            max_cached_normal: 64 * 1024,
        }
    }

    /// Total entries currently parked.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.tiny.iter().map(Vec::len).sum::<usize>()
            + self.small.iter().map(Vec::len).sum::<usize>()
            + self.normal.iter().map(|(_, v)| v.len()).sum::<usize>()
    }

    /// Return every parked entry to `arena`. Call before dropping the cache;
    /// entries still parked at drop are lost to their chunks until the
    /// arena itself is torn down.
    pub fn clear(&mut self, arena: &PoolArena) {
        for bin in self.tiny.iter_mut().chain(self.small.iter_mut()) {
            for entry in bin.drain(..) {
                arena.free_cached(entry);
            }
        }
        for (_, bin) in &mut self.normal {
            for entry in bin.drain(..) {
                arena.free_cached(entry);
            }
        }
    }

    fn small_bin(&mut self, idx: usize) -> &mut Vec<CacheEntry> {
        if self.small.len() <= idx {
            self.small.resize_with(idx + 1, Vec::new);
        }
        &mut self.small[idx]
    }

    fn normal_bin(&mut self, norm_capacity: usize) -> &mut Vec<CacheEntry> {
        if let Some(pos) = self.normal.iter().position(|(n, _)| *n == norm_capacity) {
            return &mut self.normal[pos].1;
        }
        self.normal.push((norm_capacity, Vec::new()));
        let last = self.normal.len() - 1;
        &mut self.normal[last].1
    }
}

impl Default for BoundedThreadCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolThreadCache for BoundedThreadCache {
    fn allocate_tiny(
        &mut self,
        arena: &PoolArena,
        buf: &mut PooledBuf,
        req_capacity: usize,
        norm_capacity: usize,
    ) -> bool {
        match self.tiny[size_class::tiny_idx(norm_capacity)].pop() {
            Some(entry) => {
                arena.init_cached(buf, entry, req_capacity);
                true
            }
            None => false,
        }
    }

    fn allocate_small(
        &mut self,
        arena: &PoolArena,
        buf: &mut PooledBuf,
        req_capacity: usize,
        norm_capacity: usize,
    ) -> bool {
        match self.small_bin(size_class::small_idx(norm_capacity)).pop() {
            Some(entry) => {
                arena.init_cached(buf, entry, req_capacity);
                true
            }
            None => false,
        }
    }

    fn allocate_normal(
        &mut self,
        arena: &PoolArena,
        buf: &mut PooledBuf,
        req_capacity: usize,
        norm_capacity: usize,
    ) -> bool {
        match self.normal_bin(norm_capacity).pop() {
            Some(entry) => {
                arena.init_cached(buf, entry, req_capacity);
                true
            }
            None => false,
        }
    }

    fn add(
        &mut self,
        _arena: &PoolArena,
        entry: CacheEntry,
        norm_capacity: usize,
        class: SizeClass,
    ) -> bool {
        let (bin, cap) = match class {
            SizeClass::Tiny => (
                &mut self.tiny[size_class::tiny_idx(norm_capacity)],
                self.tiny_cap,
            ),
            SizeClass::Small => {
                let cap = self.small_cap;
                (self.small_bin(size_class::small_idx(norm_capacity)), cap)
            }
            SizeClass::Normal => {
                if norm_capacity > self.max_cached_normal {
                    return false;
                }
                let cap = self.normal_cap;
                (self.normal_bin(norm_capacity), cap)
            }
            // Huge allocations are never cached.
            SizeClass::Huge => return false,
        };
        if bin.len() >= cap {
            return false;
        }
        bin.push(entry);
        true
    }
}
