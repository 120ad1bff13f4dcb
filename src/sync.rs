// Synchronization primitives, switchable between std and loom.
//
// Building with `--cfg loom` swaps everything below for its loom
// counterpart so the model tests can explore thread interleavings. That
// only works if the rest of the crate never names `std::sync` (or
// `std::cell::UnsafeCell`) directly: an atomic that bypasses this shim is
// invisible to loom's scheduler and quietly punches a hole in the models.

// atomic

pub(crate) mod atomic {
    #[cfg(not(loom))]
    pub(crate) use std::sync::atomic::{
        AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering,
    };

    #[cfg(loom)]
    pub(crate) use loom::sync::atomic::{
        AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering,
    };
}

// Mutex, Arc

#[cfg(not(loom))]
pub(crate) use std::sync::{Arc, Mutex, MutexGuard};

#[cfg(loom)]
pub(crate) use loom::sync::{Arc, Mutex, MutexGuard};

// cell

pub(crate) mod cell {
    #[cfg(not(loom))]
    pub(crate) use std::cell::UnsafeCell;

    #[cfg(loom)]
    pub(crate) use loom::cell::UnsafeCell;
}

/// Shared borrow of an `UnsafeCell`'s contents.
///
/// loom's `UnsafeCell` trades `get()` for access-tracking closures, so a
/// plain `&*cell.get()` cannot compile under both configurations; this
/// macro (and its `_mut` sibling) papers over the difference.
///
/// # Safety
/// The caller vouches that no exclusive borrow of the same contents is
/// live.
#[cfg(not(loom))]
macro_rules! unsafe_cell_get {
    ($cell:expr) => {
        // Safety: the caller's obligation, per the macro docs.
        unsafe { &*$cell.get() }
    };
}

#[cfg(loom)]
macro_rules! unsafe_cell_get {
    ($cell:expr) => {
        // Safety: the caller's obligation, per the macro docs.
        unsafe { $cell.with(|p| &*p) }
    };
}
pub(crate) use unsafe_cell_get;

/// Exclusive borrow of an `UnsafeCell`'s contents.
///
/// # Safety
/// The caller vouches that this is the only borrow of the contents.
#[cfg(not(loom))]
macro_rules! unsafe_cell_get_mut {
    ($cell:expr) => {
        // Safety: the caller's obligation, per the macro docs.
        unsafe { &mut *$cell.get() }
    };
}

#[cfg(loom)]
macro_rules! unsafe_cell_get_mut {
    ($cell:expr) => {
        // Safety: the caller's obligation, per the macro docs.
        unsafe { $cell.with_mut(|p| &mut *p) }
    };
}
pub(crate) use unsafe_cell_get_mut;

// thread

pub(crate) mod thread {
    #[cfg(not(loom))]
    pub(crate) use std::thread::{current, ThreadId};

    #[cfg(loom)]
    pub(crate) use loom::thread::{current, ThreadId};
}

/// Declare a private `static` atomic.
///
/// Under std this is an ordinary `const`-initialized static. loom's
/// atomics have no `const` constructors and must be rebuilt for every
/// model run, so the loom expansion routes through `loom::lazy_static!`
/// instead.
#[cfg(not(loom))]
macro_rules! static_atomic {
    (static $NAME:ident : $Ty:ty = $init:expr ;) => {
        static $NAME: $Ty = $init;
    };
}

#[cfg(loom)]
macro_rules! static_atomic {
    (static $NAME:ident : $Ty:ty = $init:expr ;) => {
        loom::lazy_static! {
            static ref $NAME: $Ty = $init;
        }
    };
}
pub(crate) use static_atomic;
