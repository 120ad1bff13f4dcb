//! Light-weight object pool based on a thread-local stack.
//!
//! Each thread keeps one stack per recycler. Objects recycled on their
//! owning thread are pushed straight back; objects recycled on a foreign
//! thread travel home through that thread's weak-order queue for the
//! target stack and are harvested ("scavenged") the next time the owner
//! runs dry. Two ids per handle track residency: both zero outside any
//! pool, both the stack id while stacked, and the queue id while in
//! transit — any other combination at a transition is a double recycle
//! and fatal.

pub(crate) mod queue;

use std::any::Any;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use crate::sync::cell::UnsafeCell;
use crate::sync::thread;
use crate::sync::{static_atomic, unsafe_cell_get, unsafe_cell_get_mut, Arc, Mutex};

use queue::WeakOrderQueue;

const DEFAULT_MAX_CAPACITY: usize = 262_144;
const INITIAL_CAPACITY: usize = 256;
const MAX_CAPACITY_ENV: &str = "BUFPOOL_RECYCLER_MAX_CAPACITY";

static_atomic! {
    static ID_GENERATOR: AtomicU32 = AtomicU32::new(1);
}

/// Process-wide id source for stacks and queues. Only equality matters;
/// 0 is reserved for "outside any pool".
pub(crate) fn next_pool_id() -> u32 {
    ID_GENERATOR.fetch_add(1, Ordering::Relaxed)
}

fn env_max_capacity() -> usize {
    std::env::var(MAX_CAPACITY_ENV)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(DEFAULT_MAX_CAPACITY)
}

pub(crate) struct HandleState<T: Send + 'static> {
    pub(crate) recycle_id: u32,
    pub(crate) last_recycled_id: u32,
    pub(crate) stack: Option<Arc<StackShared<T>>>,
    pub(crate) value: T,
}

/// A pooled object's identity. Heap-allocated and passed around raw; the
/// possessor at any instant is exactly one of: the `Pooled` smart pointer,
/// the owning stack's element array, or one queue Link slot.
pub(crate) struct Handle<T: Send + 'static> {
    /// Accessed only by the current possessor; cross-thread possession
    /// changes ride the Link write-index release/acquire edge.
    state: UnsafeCell<HandleState<T>>,
}

// Safety: possession discipline above; T crosses threads, hence T: Send.
unsafe impl<T: Send + 'static> Send for Handle<T> {}
// Safety: as above.
unsafe impl<T: Send + 'static> Sync for Handle<T> {}

impl<T: Send + 'static> Handle<T> {
    pub(crate) fn boxed(stack: Arc<StackShared<T>>, value: T) -> NonNull<Handle<T>> {
        let boxed = Box::new(Handle {
            state: UnsafeCell::new(HandleState {
                recycle_id: 0,
                last_recycled_id: 0,
                stack: Some(stack),
                value,
            }),
        });
        // Safety: Box never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
    }
}

/// # Safety
/// Caller is the handle's current possessor (or received it across the
/// publication edge).
pub(crate) unsafe fn handle_state_mut<'a, T: Send + 'static>(
    h: NonNull<Handle<T>>,
) -> &'a mut HandleState<T> {
    unsafe_cell_get_mut!(h.as_ref().state)
}

/// # Safety
/// As [`handle_state_mut`], shared form.
pub(crate) unsafe fn handle_state<'a, T: Send + 'static>(
    h: NonNull<Handle<T>>,
) -> &'a HandleState<T> {
    unsafe_cell_get!(h.as_ref().state)
}

/// # Safety
/// Caller is the unique possessor and the handle is referenced nowhere
/// else.
pub(crate) unsafe fn drop_handle<T: Send + 'static>(h: NonNull<Handle<T>>) {
    // Safety: per the contract.
    unsafe { drop(Box::from_raw(h.as_ptr())) };
}

pub(crate) struct QueueChain<T: Send + 'static> {
    pub(crate) head: Option<Arc<WeakOrderQueue<T>>>,
}

/// Owner-thread-only hot state of a stack.
pub(crate) struct StackLocal<T: Send + 'static> {
    pub(crate) elements: Vec<NonNull<Handle<T>>>,
    cursor: Option<Arc<WeakOrderQueue<T>>>,
    prev: Option<Arc<WeakOrderQueue<T>>>,
}

impl<T: Send + 'static> StackLocal<T> {
    /// Grow the element array toward `expected`, doubling and capping at
    /// `max`. Returns the capacity actually granted.
    pub(crate) fn increase_capacity(&mut self, expected: usize, max: usize) -> usize {
        let mut new_cap = self.elements.capacity().max(1);
        while new_cap < expected && new_cap < max {
            new_cap <<= 1;
        }
        new_cap = new_cap.min(max);
        if new_cap > self.elements.capacity() {
            self.elements.reserve_exact(new_cap - self.elements.len());
        }
        new_cap
    }
}

/// The shared half of a per-thread stack. Handles keep it alive through an
/// `Arc` while they are in flight; the hot fields stay owner-confined.
pub(crate) struct StackShared<T: Send + 'static> {
    pub(crate) recycler_id: u32,
    pub(crate) stack_id: u32,
    owner: thread::ThreadId,
    pub(crate) max_capacity: usize,
    /// Cleared (release) by the owner's TLS destructor; foreign recyclers
    /// check it to avoid enqueueing toward a dead owner.
    pub(crate) owner_alive: AtomicBool,
    /// Queue-list head. Foreign threads link new queues here, taking this
    /// guard exactly once per (producer, stack) pair.
    pub(crate) queues: Mutex<QueueChain<T>>,
    /// Owner-thread-only; see [`StackLocal`].
    local: UnsafeCell<StackLocal<T>>,
}

// Safety: `local` is owner-confined (including the TLS destructor); the
// rest is immutable, atomic, or mutex-guarded.
unsafe impl<T: Send + 'static> Send for StackShared<T> {}
// Safety: as above.
unsafe impl<T: Send + 'static> Sync for StackShared<T> {}

impl<T: Send + 'static> StackShared<T> {
    pub(crate) fn new(recycler_id: u32, max_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            recycler_id,
            stack_id: next_pool_id(),
            owner: thread::current().id(),
            max_capacity,
            owner_alive: AtomicBool::new(true),
            queues: Mutex::new(QueueChain { head: None }),
            local: UnsafeCell::new(StackLocal {
                elements: Vec::with_capacity(INITIAL_CAPACITY.min(max_capacity)),
                cursor: None,
                prev: None,
            }),
        })
    }

    pub(crate) fn is_owner(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// # Safety
    /// Current thread is the owner (or its TLS destructor); the returned
    /// borrow must end before `local` is borrowed again.
    pub(crate) unsafe fn local_mut<'a>(&self) -> &'a mut StackLocal<T> {
        unsafe_cell_get_mut!(self.local)
    }

    /// Pop the most recently pooled handle, importing from the queue chain
    /// when the stack runs dry. Resets both residency ids to 0.
    ///
    /// # Safety
    /// Current thread is the owner.
    pub(crate) unsafe fn pop(self_: &Arc<Self>) -> Option<NonNull<Handle<T>>> {
        {
            // Safety: owner thread.
            let empty = unsafe { self_.local_mut() }.elements.is_empty();
            // Safety: owner thread.
            if empty && !unsafe { Self::scavenge(self_) } {
                return None;
            }
        }
        // Safety: owner thread.
        let h = unsafe { self_.local_mut() }.elements.pop()?;
        // Safety: popping made us the unique possessor.
        let st = unsafe { handle_state_mut(h) };
        if st.last_recycled_id != st.recycle_id {
            panic!("handle recycled multiple times");
        }
        st.recycle_id = 0;
        st.last_recycled_id = 0;
        Some(h)
    }

    /// Park a handle recycled on the owning thread. Silently drops the
    /// handle once the stack is saturated.
    ///
    /// # Safety
    /// Current thread is the owner and possesses `h`.
    pub(crate) unsafe fn push(self_: &Arc<Self>, h: NonNull<Handle<T>>) {
        {
            // Safety: unique possessor.
            let st = unsafe { handle_state_mut(h) };
            if st.recycle_id != 0 || st.last_recycled_id != 0 {
                panic!("handle recycled multiple times");
            }
            st.recycle_id = self_.stack_id;
            st.last_recycled_id = self_.stack_id;
            debug_assert!(st.stack.as_ref().is_some_and(|s| Arc::ptr_eq(s, self_)));
        }
        // Safety: owner thread.
        let local = unsafe { self_.local_mut() };
        if local.elements.len() >= self_.max_capacity {
            // Saturated: drop the youngest object.
            // Safety: unique possessor; not stored anywhere.
            unsafe { drop_handle(h) };
            return;
        }
        if local.elements.len() == local.elements.capacity() {
            local.increase_capacity(local.elements.len() + 1, self_.max_capacity);
        }
        local.elements.push(h);
    }

    /// # Safety
    /// Current thread is the owner.
    unsafe fn scavenge(self_: &Arc<Self>) -> bool {
        // Safety: owner thread.
        if unsafe { Self::scavenge_some(self_) } {
            return true;
        }
        // Ran off the end of the chain: restart from the head next time.
        // Safety: owner thread.
        let local = unsafe { self_.local_mut() };
        local.prev = None;
        local.cursor = None;
        false
    }

    /// # Safety
    /// Current thread is the owner.
    unsafe fn scavenge_some(self_: &Arc<Self>) -> bool {
        let mut cursor;
        let mut prev;
        {
            // Safety: owner thread.
            let local = unsafe { self_.local_mut() };
            cursor = local.cursor.take();
            prev = local.prev.take();
        }
        if cursor.is_none() {
            prev = None;
            cursor = self_
                .queues
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .head
                .clone();
        }
        let mut success = false;
        while let Some(q) = cursor.clone() {
            // Safety: owner thread consumes.
            if unsafe { q.transfer(self_) } {
                success = true;
                break;
            }
            // Safety: owner-only chain read.
            let next = unsafe { q.next_queue() };
            if !q.producer_alive() {
                // The producing thread is gone. Take any data it still
                // holds, then unlink it — but never the chain head, to
                // avoid synchronizing with concurrent insertions.
                // Safety: producer death observed above.
                if unsafe { q.has_final_data() } {
                    loop {
                        // Safety: owner thread consumes.
                        if unsafe { q.transfer(self_) } {
                            success = true;
                        } else {
                            break;
                        }
                    }
                }
                if let Some(p) = &prev {
                    // Safety: owner-only chain write.
                    unsafe { p.set_next(next.clone()) };
                }
            } else {
                prev = Some(q.clone());
            }
            cursor = next;
            if success {
                break;
            }
        }
        {
            // Safety: owner thread.
            let local = unsafe { self_.local_mut() };
            local.prev = prev;
            local.cursor = cursor;
        }
        success
    }
}

/// Grips the stack from its owner thread's TLS; dropping it (thread exit
/// or map eviction) retires the stack.
struct OwnedStack<T: Send + 'static>(Arc<StackShared<T>>);

impl<T: Send + 'static> Drop for OwnedStack<T> {
    fn drop(&mut self) {
        self.0.owner_alive.store(false, Ordering::Release);
        // Safety: TLS destruction runs on the owner thread.
        let local = unsafe { self.0.local_mut() };
        for h in local.elements.drain(..) {
            // Safety: stack-resident handles are owned by the stack.
            unsafe { drop_handle(h) };
        }
        local.cursor = None;
        local.prev = None;
    }
}

std::thread_local! {
    /// One stack per (thread, recycler id).
    static STACKS: std::cell::RefCell<HashMap<u32, Box<dyn Any>>> =
        std::cell::RefCell::new(HashMap::new());
}

enum Slot<T: Send + 'static> {
    /// Pooling disabled; plain value that rejects recycling.
    Fresh(T),
    Handle(NonNull<Handle<T>>),
    Consumed,
}

/// Smart pointer over a (possibly) pooled `T`. Dropping it without
/// recycling releases the object instead of returning it to the pool.
pub struct Pooled<T: Send + 'static> {
    slot: Slot<T>,
}

// Safety: the Pooled is its handle's unique possessor.
unsafe impl<T: Send + 'static> Send for Pooled<T> {}

impl<T: Send + 'static> Pooled<T> {
    fn take_handle(&mut self) -> Option<NonNull<Handle<T>>> {
        match std::mem::replace(&mut self.slot, Slot::Consumed) {
            Slot::Handle(h) => Some(h),
            Slot::Fresh(v) => {
                self.slot = Slot::Fresh(v);
                None
            }
            Slot::Consumed => None,
        }
    }
}

impl<T: Send + 'static> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.slot {
            Slot::Fresh(v) => v,
            // Safety: the Pooled is the handle's unique possessor.
            Slot::Handle(h) => &unsafe { handle_state(*h) }.value,
            Slot::Consumed => unreachable!("pooled value used after recycle"),
        }
    }
}

impl<T: Send + 'static> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.slot {
            Slot::Fresh(v) => v,
            // Safety: the Pooled is the handle's unique possessor.
            Slot::Handle(h) => &mut unsafe { handle_state_mut(*h) }.value,
            Slot::Consumed => unreachable!("pooled value used after recycle"),
        }
    }
}

impl<T: Send + 'static> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Slot::Handle(h) = std::mem::replace(&mut self.slot, Slot::Consumed) {
            // Not recycled: release the object and its handle.
            // Safety: unique possessor.
            unsafe { drop_handle(h) };
        }
    }
}

/// Thread-local object pool. `get` pops from the calling thread's stack
/// (scavenging foreign returns when dry) or materializes a fresh object;
/// `recycle` parks the object again, from any thread.
pub struct Recycler<T: Send + 'static> {
    id: u32,
    max_capacity: usize,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T: Send + 'static> Recycler<T> {
    /// Max stack capacity comes from `BUFPOOL_RECYCLER_MAX_CAPACITY`
    /// (default 262144; 0 disables pooling entirely).
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::with_max_capacity(env_max_capacity(), factory)
    }

    pub fn with_max_capacity<F>(max_capacity: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        if max_capacity == 0 {
            log::debug!("recycler pooling disabled");
        } else {
            log::debug!("recycler max capacity per thread: {max_capacity}");
        }
        Self {
            id: next_pool_id(),
            max_capacity,
            factory: Box::new(factory),
        }
    }

    #[must_use]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Obtain an object, reusing a pooled one when possible.
    pub fn get(&self) -> Pooled<T> {
        if self.max_capacity == 0 {
            return Pooled {
                slot: Slot::Fresh((self.factory)()),
            };
        }
        let stack = self.thread_local_stack();
        // Safety: this thread owns its stack.
        if let Some(h) = unsafe { StackShared::pop(&stack) } {
            return Pooled {
                slot: Slot::Handle(h),
            };
        }
        let value = (self.factory)();
        Pooled {
            slot: Slot::Handle(Handle::boxed(stack, value)),
        }
    }

    /// Return an object to its pool. `false` when the object is not pooled
    /// here: pooling disabled, the handle belongs to another recycler, or
    /// its owning thread is gone — in those cases the object is released.
    pub fn recycle(&self, mut obj: Pooled<T>) -> bool {
        let Some(h) = obj.take_handle() else {
            return false;
        };
        // Safety: unique possessor.
        let stack = unsafe { handle_state_mut(h) }
            .stack
            .clone()
            .expect("a possessed handle carries its stack");
        if stack.recycler_id != self.id {
            // Belongs to a different recycler: refuse to pool it.
            // Safety: unique possessor.
            unsafe { drop_handle(h) };
            return false;
        }
        if stack.is_owner() {
            // Safety: owner thread.
            unsafe { StackShared::push(&stack, h) };
            return true;
        }
        if !stack.owner_alive.load(Ordering::Acquire) {
            // Nobody will ever scavenge for this stack again.
            // Safety: unique possessor.
            unsafe { drop_handle(h) };
            return false;
        }
        queue::delayed_recycle(&stack, h);
        true
    }

    fn thread_local_stack(&self) -> Arc<StackShared<T>> {
        STACKS.with(|m| {
            let mut m = m.borrow_mut();
            let entry = m
                .entry(self.id)
                .or_insert_with(|| Box::new(OwnedStack(StackShared::<T>::new(self.id, self.max_capacity))));
            entry
                .downcast_ref::<OwnedStack<T>>()
                .expect("stack type matches its recycler")
                .0
                .clone()
        })
    }

    /// Objects parked on the calling thread's stack (test hook).
    #[must_use]
    pub fn thread_local_size(&self) -> usize {
        STACKS.with(|m| {
            m.borrow()
                .get(&self.id)
                .and_then(|e| e.downcast_ref::<OwnedStack<T>>())
                .map_or(0, |s| {
                    // Safety: owner thread.
                    unsafe { s.0.local_mut() }.elements.len()
                })
        })
    }

    /// Element-array capacity of the calling thread's stack (test hook).
    #[must_use]
    pub fn thread_local_capacity(&self) -> usize {
        STACKS.with(|m| {
            m.borrow()
                .get(&self.id)
                .and_then(|e| e.downcast_ref::<OwnedStack<T>>())
                .map_or(0, |s| {
                    // Safety: owner thread.
                    unsafe { s.0.local_mut() }.elements.capacity()
                })
        })
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};
    use std::sync::Arc as StdArc;

    fn counting_recycler(
        max_capacity: usize,
    ) -> (Recycler<Vec<u8>>, StdArc<AtomicUsize>) {
        let created = StdArc::new(AtomicUsize::new(0));
        let c = created.clone();
        let r = Recycler::with_max_capacity(max_capacity, move || {
            c.fetch_add(1, StdOrdering::Relaxed);
            Vec::new()
        });
        (r, created)
    }

    #[test]
    fn test_same_thread_recycle_reuses_object() {
        let (r, created) = counting_recycler(16);
        let mut obj = r.get();
        obj.push(42);
        assert!(r.recycle(obj));
        assert_eq!(r.thread_local_size(), 1);

        let obj2 = r.get();
        // Pooled objects come back as-is; the pool does not reset them.
        assert_eq!(&obj2[..], &[42]);
        assert_eq!(created.load(StdOrdering::Relaxed), 1);
        assert_eq!(r.thread_local_size(), 0);
        drop(obj2);
    }

    #[test]
    fn test_lifo_order() {
        let (r, _) = counting_recycler(16);
        let mut a = r.get();
        let mut b = r.get();
        a.push(1);
        b.push(2);
        assert!(r.recycle(a));
        assert!(r.recycle(b));
        // Most recently recycled surfaces first.
        assert_eq!(&r.get()[..], &[2]);
        assert_eq!(&r.get()[..], &[1]);
    }

    #[test]
    fn test_zero_capacity_disables_pooling() {
        let (r, created) = counting_recycler(0);
        let obj = r.get();
        assert!(!r.recycle(obj));
        let _obj2 = r.get();
        assert_eq!(created.load(StdOrdering::Relaxed), 2);
        assert_eq!(r.thread_local_size(), 0);
    }

    #[test]
    fn test_recycle_into_wrong_recycler_is_refused() {
        let (r1, _) = counting_recycler(16);
        let (r2, _) = counting_recycler(16);
        let obj = r1.get();
        assert!(!r2.recycle(obj));
        assert_eq!(r1.thread_local_size(), 0);
        assert_eq!(r2.thread_local_size(), 0);
    }

    #[test]
    fn test_saturated_stack_drops_silently() {
        let (r, _) = counting_recycler(2);
        let objs: Vec<_> = (0..4).map(|_| r.get()).collect();
        for obj in objs {
            assert!(r.recycle(obj));
        }
        assert_eq!(r.thread_local_size(), 2);
    }

    #[test]
    fn test_residency_ids_track_possession() {
        let (r, _) = counting_recycler(16);
        let obj = r.get();
        assert!(r.recycle(obj));

        let stack = r.thread_local_stack();
        // Safety: test thread owns the stack.
        let h = *unsafe { stack.local_mut() }.elements.last().unwrap();
        // Safety: handle is stack-resident; we only peek.
        let st = unsafe { handle_state(h) };
        assert_eq!(st.recycle_id, stack.stack_id);
        assert_eq!(st.last_recycled_id, stack.stack_id);

        let obj = r.get();
        if let Slot::Handle(h) = &obj.slot {
            // Safety: obj is the possessor; we only peek.
            let st = unsafe { handle_state(*h) };
            assert_eq!((st.recycle_id, st.last_recycled_id), (0, 0));
        } else {
            panic!("expected a pooled handle");
        }
        drop(obj);
    }

    #[test]
    fn test_cross_thread_recycle_surfaces_on_owner() {
        let (r, created) = counting_recycler(64);
        let r = StdArc::new(r);

        let mut obj = r.get();
        obj.push(0xEE);
        let r2 = r.clone();
        std::thread::scope(|s| {
            s.spawn(move || {
                assert!(r2.recycle(obj));
            });
        });
        // The producing thread exited and its queue is published: the next
        // get on the owning thread scavenges the object back.
        let obj2 = r.get();
        assert_eq!(&obj2[..], &[0xEE]);
        assert_eq!(created.load(StdOrdering::Relaxed), 1);
        drop(obj2);
    }

    #[test]
    fn test_cross_thread_bulk_recycle_spans_links() {
        let (r, created) = counting_recycler(256);
        let r = StdArc::new(r);

        // More objects than one 16-slot Link holds.
        let objs: Vec<_> = (0..20)
            .map(|i| {
                let mut o = r.get();
                o.push(i as u8);
                o
            })
            .collect();
        assert_eq!(created.load(StdOrdering::Relaxed), 20);

        let r2 = r.clone();
        std::thread::scope(|s| {
            s.spawn(move || {
                for obj in objs {
                    assert!(r2.recycle(obj));
                }
            });
        });

        // Every object comes home without a single fresh allocation; one
        // scavenge imports at most one Link's worth.
        let mut seen = [false; 20];
        for _ in 0..20 {
            let o = r.get();
            seen[o[0] as usize] = true;
            drop(o);
        }
        assert!(seen.iter().all(|&b| b));
        assert_eq!(created.load(StdOrdering::Relaxed), 20);
    }

    #[test]
    fn test_unrecycled_drop_releases_object() {
        let (r, created) = counting_recycler(16);
        drop(r.get());
        assert_eq!(r.thread_local_size(), 0);
        let _obj = r.get();
        assert_eq!(created.load(StdOrdering::Relaxed), 2);
    }

    #[test]
    fn test_capacity_grows_by_doubling_up_to_max() {
        let (r, _) = counting_recycler(8);
        assert_eq!(r.thread_local_capacity(), 0);
        let objs: Vec<_> = (0..12).map(|_| r.get()).collect();
        for obj in objs {
            r.recycle(obj);
        }
        assert_eq!(r.thread_local_size(), 8);
        assert!(r.thread_local_capacity() >= 8);
    }
}
