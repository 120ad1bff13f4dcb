//! Weak-order queues: the cross-thread return lane.
//!
//! Each queue is single-producer single-consumer: the producing thread is
//! the foreign thread that keeps recycling into it (one queue per
//! (producer thread, target stack) pair, held in the producer's
//! delayed-recycled map), the consumer is the stack's owner thread during
//! scavenging. A queue is a chain of fixed-capacity Links; the only
//! synchronization on the hot path is a release store on the per-Link
//! write index, paired with the consumer's acquire load. Element writes
//! and the nulling of `handle.stack` happen-before the index bump.
//!
//! The queue makes only moderate guarantees: items are seen in order, but
//! an item freshly enqueued may not be observed at all — the owner can
//! always allocate fresh instead.

use std::any::Any;
use std::collections::HashMap;
use std::ptr::NonNull;

use crate::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use crate::sync::cell::UnsafeCell;
use crate::sync::{unsafe_cell_get, unsafe_cell_get_mut, Arc};

use super::{drop_handle, handle_state_mut, next_pool_id, Handle, StackShared};

pub(crate) const LINK_CAPACITY: usize = 16;

pub(crate) struct Link<T: Send + 'static> {
    /// Producer publishes with a release store; consumer acquires.
    write_index: AtomicUsize,
    /// Consumer-only.
    read_index: UnsafeCell<usize>,
    /// Written once by the producer (release) when the link fills up.
    next: AtomicPtr<Link<T>>,
    elements: [UnsafeCell<Option<NonNull<Handle<T>>>>; LINK_CAPACITY],
}

impl<T: Send + 'static> Link<T> {
    fn raw() -> *mut Link<T> {
        Box::into_raw(Box::new(Link {
            write_index: AtomicUsize::new(0),
            read_index: UnsafeCell::new(0),
            next: AtomicPtr::new(std::ptr::null_mut()),
            elements: std::array::from_fn(|_| UnsafeCell::new(None)),
        }))
    }
}

pub(crate) struct WeakOrderQueue<T: Send + 'static> {
    id: u32,
    /// Cleared (release) by the producing thread's TLS destructor. The
    /// consumer's acquire load is its license to read producer-side state
    /// of a dead queue.
    producer_alive: AtomicBool,
    /// Consumer-only after construction.
    head: UnsafeCell<*mut Link<T>>,
    /// Producer-only.
    tail: UnsafeCell<*mut Link<T>>,
    /// Chain link in the target stack's queue list. Written before
    /// publication (under the stack's mutex) and thereafter only by the
    /// owner thread when unlinking dead queues.
    next: UnsafeCell<Option<Arc<WeakOrderQueue<T>>>>,
}

// Safety: the per-field access discipline documented above confines every
// non-atomic field to a single thread at a time; crossings ride the
// write-index release/acquire edge or the stack mutex.
unsafe impl<T: Send + 'static> Send for WeakOrderQueue<T> {}
// Safety: as above.
unsafe impl<T: Send + 'static> Sync for WeakOrderQueue<T> {}

impl<T: Send + 'static> WeakOrderQueue<T> {
    /// Create a queue feeding `stack` and link it at the head of the
    /// stack's queue list. The stack's guard is taken exactly once, here.
    pub(crate) fn new_linked(stack: &StackShared<T>) -> Arc<Self> {
        let link = Link::raw();
        let q = Arc::new(Self {
            id: next_pool_id(),
            producer_alive: AtomicBool::new(true),
            head: UnsafeCell::new(link),
            tail: UnsafeCell::new(link),
            next: UnsafeCell::new(None),
        });
        let mut chain = stack
            .queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // Pre-publication write; the mutex publishes it to the owner.
        *unsafe_cell_get_mut!(q.next) = chain.head.take();
        chain.head = Some(q.clone());
        q
    }

    pub(crate) fn producer_alive(&self) -> bool {
        self.producer_alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_producer_dead(&self) {
        self.producer_alive.store(false, Ordering::Release);
    }

    /// Append a handle.
    ///
    /// # Safety
    /// Only the producing thread calls this; the caller is the handle's
    /// unique possessor.
    pub(crate) unsafe fn add(&self, h: NonNull<Handle<T>>) {
        {
            // Safety: unique possessor until the release store publishes.
            let st = unsafe { handle_state_mut(h) };
            st.last_recycled_id = self.id;
            // The stack ref is nulled before the index bump is visible.
            st.stack = None;
        }
        let tail_cell = unsafe_cell_get_mut!(self.tail);
        let mut tail = *tail_cell;
        // Safety: the producer owns the tail link.
        let mut wi = unsafe { &*tail }.write_index.load(Ordering::Relaxed);
        if wi == LINK_CAPACITY {
            let link = Link::raw();
            // Safety: producer-owned until this release store.
            unsafe { &*tail }.next.store(link, Ordering::Release);
            *tail_cell = link;
            tail = link;
            wi = 0;
        }
        // Safety: slot `wi` is not yet published (write_index <= wi).
        let slot = &unsafe { &*tail }.elements[wi];
        *unsafe_cell_get_mut!(slot) = Some(h);
        // Publish the element and every write before it.
        unsafe { &*tail }.write_index.store(wi + 1, Ordering::Release);
    }

    /// Anything left to harvest? Meaningful only after the producer died.
    ///
    /// # Safety
    /// Owner thread only, after observing `producer_alive() == false` (the
    /// flag's release/acquire pair quiesces the producer-side fields).
    pub(crate) unsafe fn has_final_data(&self) -> bool {
        let tail = *unsafe_cell_get!(self.tail);
        // Safety: tail link is live and quiescent per the contract.
        let link = unsafe { &*tail };
        *unsafe_cell_get!(link.read_index) != link.write_index.load(Ordering::Acquire)
    }

    /// Move up to one Link's worth of handles into `dst`, growing it up to
    /// its max capacity. Partial transfers stop at whatever fits.
    ///
    /// # Safety
    /// Current thread owns `dst`.
    pub(crate) unsafe fn transfer(&self, dst: &Arc<StackShared<T>>) -> bool {
        let head_cell = unsafe_cell_get_mut!(self.head);
        let mut head = *head_cell;
        {
            // Safety: the consumer owns head links.
            let link = unsafe { &*head };
            if *unsafe_cell_get!(link.read_index) == LINK_CAPACITY {
                let next = link.next.load(Ordering::Acquire);
                if next.is_null() {
                    return false;
                }
                // Safety: fully drained, and the producer moved past this
                // link when it published `next`.
                unsafe { drop(Box::from_raw(head)) };
                *head_cell = next;
                head = next;
            }
        }
        // Safety: the consumer owns the (possibly advanced) head link.
        let link = unsafe { &*head };
        let src_start = *unsafe_cell_get!(link.read_index);
        let mut src_end = link.write_index.load(Ordering::Acquire);
        if src_end == src_start {
            return false;
        }
        let src_size = src_end - src_start;

        // Safety: owner thread of dst.
        let local = unsafe { dst.local_mut() };
        let dst_size = local.elements.len();
        let expected = dst_size + src_size;
        if expected > local.elements.capacity() {
            let actual = local.increase_capacity(expected, dst.max_capacity);
            src_end = src_end.min(src_start + actual.saturating_sub(dst_size));
        }
        if src_start == src_end {
            // Destination stack is already full.
            return false;
        }
        for i in src_start..src_end {
            let slot = &link.elements[i];
            let h = unsafe_cell_get_mut!(slot)
                .take()
                .expect("published slot holds a handle");
            // Safety: the acquire on write_index handed us possession.
            let st = unsafe { handle_state_mut(h) };
            if st.recycle_id == 0 {
                // First harvest of this enqueue.
                st.recycle_id = st.last_recycled_id;
            } else if st.recycle_id != st.last_recycled_id {
                panic!("handle recycled multiple times");
            }
            st.stack = Some(dst.clone());
            local.elements.push(h);
        }
        *unsafe_cell_get_mut!(link.read_index) = src_end;
        if src_end == LINK_CAPACITY {
            let next = link.next.load(Ordering::Acquire);
            if !next.is_null() {
                // Safety: as in the retirement above.
                unsafe { drop(Box::from_raw(head)) };
                *head_cell = next;
            }
        }
        true
    }

    /// # Safety
    /// Owner thread only.
    pub(crate) unsafe fn next_queue(&self) -> Option<Arc<WeakOrderQueue<T>>> {
        unsafe_cell_get!(self.next).clone()
    }

    /// # Safety
    /// Owner thread only.
    pub(crate) unsafe fn set_next(&self, next: Option<Arc<WeakOrderQueue<T>>>) {
        *unsafe_cell_get_mut!(self.next) = next;
    }
}

impl<T: Send + 'static> Drop for WeakOrderQueue<T> {
    fn drop(&mut self) {
        // Both ends are gone: free the remaining links and their handles.
        let mut link_ptr = *unsafe_cell_get_mut!(self.head);
        while !link_ptr.is_null() {
            // Safety: exclusive access during drop.
            let link = unsafe { Box::from_raw(link_ptr) };
            let start = *unsafe_cell_get_mut!(link.read_index);
            let end = link.write_index.load(Ordering::Relaxed);
            for i in start..end {
                if let Some(h) = unsafe_cell_get_mut!(link.elements[i]).take() {
                    // Safety: unreachable from anywhere else.
                    unsafe { drop_handle(h) };
                }
            }
            link_ptr = link.next.load(Ordering::Relaxed);
        }
    }
}

/// Producer-side grip on a queue. Dropping it (with the producing thread's
/// TLS) marks the producer dead, which lets the owner drain and unlink the
/// queue — the epoch-flag rendering of the original's weak thread
/// reference.
struct ProducerEnd<T: Send + 'static> {
    queue: Arc<WeakOrderQueue<T>>,
}

impl<T: Send + 'static> Drop for ProducerEnd<T> {
    fn drop(&mut self) {
        self.queue.mark_producer_dead();
    }
}

std::thread_local! {
    /// This thread's delayed-recycled map: target stack id -> the queue
    /// this thread produces into for that stack.
    static DELAYED: std::cell::RefCell<HashMap<u32, Box<dyn Any>>> =
        std::cell::RefCell::new(HashMap::new());
}

/// Hand a foreign-owned handle back toward `stack` through this thread's
/// queue for it, creating and linking the queue on first use.
pub(crate) fn delayed_recycle<T: Send + 'static>(stack: &Arc<StackShared<T>>, h: NonNull<Handle<T>>) {
    DELAYED.with(|m| {
        let mut m = m.borrow_mut();
        let entry = m.entry(stack.stack_id).or_insert_with(|| {
            Box::new(ProducerEnd {
                queue: WeakOrderQueue::new_linked(stack),
            })
        });
        let pe = entry
            .downcast_ref::<ProducerEnd<T>>()
            .expect("queue type matches its stack");
        // Safety: this thread is the queue's producer and owns the handle.
        unsafe { pe.queue.add(h) };
    });
}
