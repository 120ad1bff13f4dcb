//! Request normalization and size-class routing.
//!
//! A request is normalized to the nearest allocable size, then classified:
//! Tiny requests are quantum-spaced (16-byte steps below 512), Small requests
//! are powers of two up to the page size, Normal requests are powers of two up
//! to the chunk size, and anything larger is Huge (unpooled).
//!
//! The small window deliberately starts at 1 KiB: small indices are
//! `log2(n) - 10`, so a normalized 512 would have no ring. Sizes in
//! (496, 1024] therefore normalize straight to 1024, which keeps
//! normalization idempotent and monotone.

/// Quantum for tiny sizes.
pub(crate) const QUANTUM: usize = 16;

/// Upper bound (exclusive) of the tiny range.
pub(crate) const TINY_LIMIT: usize = 512;

/// Number of tiny size-class rings (`512 >> 4`). Index 0 is a reserved
/// sentinel with element size 0 and is never allocated from.
pub(crate) const NUM_TINY_RINGS: usize = TINY_LIMIT >> 4;

/// Allocation strategy bucket for a normalized capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Tiny,
    Small,
    Normal,
    Huge,
}

impl SizeClass {
    /// Classify a normalized capacity.
    ///
    /// `page_size` itself classifies as Normal: the buddy tree serves it as a
    /// one-page run, so it never reaches a subpage ring.
    #[must_use]
    pub fn of(norm_capacity: usize, page_size: usize, chunk_size: usize) -> Self {
        if norm_capacity > chunk_size {
            SizeClass::Huge
        } else if norm_capacity >= page_size {
            SizeClass::Normal
        } else if is_tiny(norm_capacity) {
            SizeClass::Tiny
        } else {
            SizeClass::Small
        }
    }
}

#[inline]
pub(crate) fn is_tiny(norm_capacity: usize) -> bool {
    norm_capacity < TINY_LIMIT
}

/// True when the capacity is served from a subpage (less than one page).
#[inline]
pub(crate) fn is_subpage(norm_capacity: usize, page_size: usize) -> bool {
    norm_capacity < page_size
}

/// Ring index for a tiny size: 16 -> 1, 32 -> 2, ... 496 -> 31.
#[inline]
pub(crate) fn tiny_idx(norm_capacity: usize) -> usize {
    norm_capacity >> 4
}

/// Ring index for a small size: 1024 -> 0, 2048 -> 1, 4096 -> 2, 8192 -> 3.
#[inline]
pub(crate) fn small_idx(norm_capacity: usize) -> usize {
    debug_assert!(norm_capacity.is_power_of_two() && norm_capacity >= 1024);
    (norm_capacity.ilog2() - 10) as usize
}

/// Number of small rings for a page size: `page_shifts - 9`.
#[inline]
pub(crate) fn num_small_rings(page_shifts: u32) -> usize {
    (page_shifts - 9) as usize
}

/// Canonicalize a requested capacity to the nearest allocable size.
///
/// Huge requests (`>= chunk_size`) pass through untouched; they are served
/// by a dedicated unpooled chunk of exactly that size.
#[must_use]
pub fn normalize(req_capacity: usize, chunk_size: usize) -> usize {
    if req_capacity >= chunk_size {
        return req_capacity;
    }
    if req_capacity >= TINY_LIMIT {
        return req_capacity.next_power_of_two().max(1024);
    }
    // Quantum-spaced. 0 rounds up to one quantum; the 512 result (from
    // requests in (496, 512)) is bumped into the small window.
    let quantized = req_capacity
        .next_multiple_of(QUANTUM)
        .max(QUANTUM);
    if quantized == TINY_LIMIT {
        1024
    } else {
        quantized
    }
}
