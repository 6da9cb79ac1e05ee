//! `MpscQueue<T>` — a pool-backed MPSC FIFO queue.
//!
//! A non-intrusive multi-producer single-consumer queue in the style of
//! Vyukov's node-based MPSC queue, with nodes drawn from a [`NodePool`].
//! Producers construct the payload in a freshly acquired node and publish
//! it with a single `swap` on `back` plus one release store: wait-free,
//! and the cheapest a non-distributed multi-producer push can get. The
//! consumer owns `front` outright, so the fast path is one acquire load
//! and zero CASes, and pops are always O(1). No tag is needed anywhere:
//! `back` only ever receives freshly acquired nodes, and a node cannot
//! re-enter the queue before the consumer has popped and released it, so
//! there is no ABA to defend against.
//!
//! Structurally the sentinel here is the *old head*: the payload of the
//! element being popped lives in its successor, and the popped-over node
//! is what returns to the pool. The same in-flight-producer window as the
//! MPMC queue applies: a producer preempted between its swap and its link
//! store hides the elements queued behind its own until it resumes.
//!
//! Each queue permanently consumes one pool slot for its sentinel; owned
//! pools ([`MpscQueue::new`]) account for it internally.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

#[cfg(feature = "diagnostics")]
use core::sync::atomic::AtomicUsize;

use crate::pool::{NodePool, PoolRef};
use crate::utils::CacheAligned;

/// One MPSC queue element as it lives inside a node pool.
///
/// `prev` points toward the back, as in the MPMC queue, but is a plain
/// pointer: this queue needs no tags. Opaque; public only so shared pools
/// can be declared (see [`MpscPool`]).
pub struct MpscNode<T> {
    value: UnsafeCell<MaybeUninit<T>>,
    prev: AtomicPtr<MpscNode<T>>,
}

unsafe impl<T: Send> Send for MpscNode<T> {}
unsafe impl<T: Send> Sync for MpscNode<T> {}

/// The pool type an [`MpscQueue`] draws its nodes from.
///
/// Remember the +1 sentinel slot per queue when sizing a shared pool.
pub type MpscPool<T> = NodePool<MpscNode<T>>;

/// A bounded multi-producer single-consumer FIFO queue.
///
/// Any number of threads may [`push`](MpscQueue::push); exactly one
/// thread at a time may consume. The consumer side is expressed as
/// `unsafe fn`s because the type system cannot see which thread that is
/// (see the `# Safety` sections). In fully serial phases the `*_unsync`
/// variants are safe through `&mut self`.
pub struct MpscQueue<'p, T> {
    back: CacheAligned<AtomicPtr<MpscNode<T>>>,
    // Consumer-private; only ever read and written by the consuming
    // thread, hence a plain cell rather than an atomic.
    front: CacheAligned<UnsafeCell<*mut MpscNode<T>>>,
    pool: PoolRef<'p, MpscNode<T>>,
    #[cfg(feature = "diagnostics")]
    len: AtomicUsize,
}

unsafe impl<T: Send> Send for MpscQueue<'_, T> {}
unsafe impl<T: Send> Sync for MpscQueue<'_, T> {}

impl<T> MpscQueue<'static, T> {
    /// Creates a queue owning a pool sized for `capacity` elements (the
    /// sentinel slot is added internally).
    pub fn new(capacity: u32) -> Self {
        Self::from_pool(PoolRef::Owned(NodePool::new(capacity.saturating_add(1))))
    }
}

impl<'p, T> MpscQueue<'p, T> {
    /// Creates a queue drawing nodes from a shared pool.
    ///
    /// # Panics
    ///
    /// Panics when `pool` cannot supply the sentinel slot; that is a
    /// sizing fault, not backpressure.
    pub fn with_pool(pool: &'p MpscPool<T>) -> Self {
        Self::from_pool(PoolRef::Shared(pool))
    }

    fn from_pool(pool: PoolRef<'p, MpscNode<T>>) -> Self {
        let sentinel = pool
            .acquire_raw()
            .expect("node pool exhausted while acquiring the queue sentinel")
            .as_ptr();
        // SAFETY: the slot is exclusively ours. The sentinel's payload is
        // never constructed or read.
        unsafe {
            sentinel.write(MpscNode {
                value: UnsafeCell::new(MaybeUninit::uninit()),
                prev: AtomicPtr::new(ptr::null_mut()),
            });
        }

        Self {
            back: CacheAligned::new(AtomicPtr::new(sentinel)),
            front: CacheAligned::new(UnsafeCell::new(sentinel)),
            pool,
            #[cfg(feature = "diagnostics")]
            len: AtomicUsize::new(0),
        }
    }

    /// Pushes `value`, returning it in `Err` when the pool is exhausted.
    ///
    /// Wait-free: one slot acquisition, one swap, one store.
    pub fn push(&self, value: T) -> Result<(), T> {
        let Some(node) = self.pool.acquire_raw() else {
            return Err(value);
        };
        let node = node.as_ptr();
        // SAFETY: exclusively ours until the swap publishes it. Unlike
        // the MPMC queue, the fresh node carries the payload itself.
        unsafe {
            node.write(MpscNode {
                value: UnsafeCell::new(MaybeUninit::new(value)),
                prev: AtomicPtr::new(ptr::null_mut()),
            });
        }

        let old_back = self.back.swap(node, Ordering::AcqRel);
        // SAFETY: `old_back` is a live queue node (sentinel invariant);
        // the release pairs with the consumer's acquire load of the link.
        unsafe { (*old_back).prev.store(node, Ordering::Release) };

        #[cfg(feature = "diagnostics")]
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Pops the oldest element, or `None` when the queue is empty (which
    /// includes the in-flight-producer window described in the module
    /// docs).
    ///
    /// Atomic-free except for one acquire load.
    ///
    /// # Safety
    ///
    /// Only one thread may call this (or [`is_empty`](MpscQueue::is_empty))
    /// at a time; `front` is owned by that consumer without
    /// synchronisation.
    pub unsafe fn pop(&self) -> Option<T> {
        // SAFETY: consumer-exclusive by the caller's contract.
        let old_front = unsafe { *self.front.get() };
        let target = unsafe { (*old_front).prev.load(Ordering::Acquire) };
        if target.is_null() {
            return None;
        }

        // SAFETY: the acquire above pairs with the producer's release, so
        // the successor's payload is fully constructed. The old front's
        // payload was consumed when *it* was the successor (or never
        // existed, for the initial sentinel), so it goes back raw.
        let value = unsafe { (*target).value.get().read().assume_init() };
        unsafe {
            *self.front.get() = target;
            self.pool.release_raw(NonNull::new_unchecked(old_front));
        }

        #[cfg(feature = "diagnostics")]
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(value)
    }

    /// True when the queue holds no poppable elements. An in-flight
    /// producer also reads as "empty".
    ///
    /// # Safety
    ///
    /// Consumer-side only, like [`pop`](MpscQueue::pop).
    #[inline]
    pub unsafe fn is_empty(&self) -> bool {
        // SAFETY: consumer-exclusive by the caller's contract.
        let front = unsafe { *self.front.get() };
        unsafe { (*front).prev.load(Ordering::Relaxed) }.is_null()
    }

    /// Approximate element count. A relaxed estimate for observability
    /// only; never branch on it.
    #[cfg(feature = "diagnostics")]
    #[inline]
    pub fn len_hint(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Serial-phase push. Exclusive access; all orderings drop to
    /// relaxed.
    pub fn push_unsync(&mut self, value: T) -> Result<(), T> {
        let Some(node) = self.pool.acquire_raw() else {
            return Err(value);
        };
        let node = node.as_ptr();
        // SAFETY: exclusive access throughout by &mut.
        unsafe {
            node.write(MpscNode {
                value: UnsafeCell::new(MaybeUninit::new(value)),
                prev: AtomicPtr::new(ptr::null_mut()),
            });
        }

        let old_back = self.back.swap(node, Ordering::Relaxed);
        unsafe { (*old_back).prev.store(node, Ordering::Relaxed) };

        #[cfg(feature = "diagnostics")]
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Serial-phase pop; the `&mut` borrow is what makes the consumer
    /// contract hold.
    pub fn pop_unsync(&mut self) -> Option<T> {
        // SAFETY: exclusive access by &mut.
        let old_front = unsafe { *self.front.get() };
        let target = unsafe { (*old_front).prev.load(Ordering::Relaxed) };
        if target.is_null() {
            return None;
        }

        let value = unsafe { (*target).value.get().read().assume_init() };
        unsafe {
            *self.front.get() = target;
            self.pool.release_raw(NonNull::new_unchecked(old_front));
        }

        #[cfg(feature = "diagnostics")]
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(value)
    }
}

impl<T> Drop for MpscQueue<'_, T> {
    /// Drains remaining elements, then returns the sentinel slot.
    fn drop(&mut self) {
        while self.pop_unsync().is_some() {}
        // SAFETY: after the drain, `front` is the lone sentinel; its
        // payload slot was never constructed (or was moved out), so it
        // goes back raw.
        let sentinel = unsafe { *self.front.get() };
        unsafe { self.pool.release_raw(NonNull::new_unchecked(sentinel)) };
    }
}
