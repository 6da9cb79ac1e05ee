//! `Queue<T>` — a pool-backed MPMC FIFO queue.
//!
//! A two-pointer linked queue with a permanent sentinel node at `back`.
//! Producers run a three-step protocol: swing `back` to a freshly
//! acquired node (one unconditional swap, wait-free up to the pool
//! check), construct the payload into the node that *was* the sentinel,
//! then link it for consumers with a release store. Consumers chase
//! `front` with a tagged CAS and are lock-free against each other.
//!
//! Deferring construction until after publication is what lets the queue
//! carry move-only payloads without a `Default` impl, and it buys the
//! single-swap producer. The price is a small window: a producer
//! preempted between the back-swap and the link store hides the elements
//! queued behind its own from consumers (they see an empty queue) until
//! it resumes. Other producers keep making progress the whole time and
//! the delay is bounded by one scheduler quantum; callers that cannot
//! tolerate it should not be preempting their producers.
//!
//! Each queue permanently consumes one pool slot for its sentinel. Size
//! shared pools accordingly; owned pools ([`Queue::new`]) account for it
//! internally.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

#[cfg(feature = "diagnostics")]
use core::sync::atomic::AtomicUsize;

use crate::pool::{NodePool, PoolRef};
use crate::tagged::{AtomicTaggedPtr, TaggedPtr};
use crate::utils::CacheAligned;

/// One queue element as it lives inside a node pool.
///
/// `prev` points *toward the back*: traversal from `front` follows `prev`
/// links in pop order, and a null `prev` marks the current sentinel.
/// Opaque; public only so shared pools can be declared (see
/// [`QueuePool`]).
pub struct QueueNode<T> {
    value: UnsafeCell<MaybeUninit<T>>,
    prev: AtomicTaggedPtr<QueueNode<T>>,
}

unsafe impl<T: Send> Send for QueueNode<T> {}
unsafe impl<T: Send> Sync for QueueNode<T> {}

/// The pool type a [`Queue`] draws its nodes from.
///
/// Remember the +1 sentinel slot per queue when sizing a shared pool.
pub type QueuePool<T> = NodePool<QueueNode<T>>;

/// A bounded multi-producer multi-consumer FIFO queue.
///
/// Producers are wait-free past the pool-exhaustion check; consumers are
/// lock-free. Ordering is FIFO overall, and per-producer FIFO is
/// guaranteed within a single producer thread.
pub struct Queue<'p, T> {
    front: CacheAligned<AtomicTaggedPtr<QueueNode<T>>>,
    back: CacheAligned<AtomicTaggedPtr<QueueNode<T>>>,
    pool: PoolRef<'p, QueueNode<T>>,
    #[cfg(feature = "diagnostics")]
    len: AtomicUsize,
}

unsafe impl<T: Send> Send for Queue<'_, T> {}
unsafe impl<T: Send> Sync for Queue<'_, T> {}

impl<T> Queue<'static, T> {
    /// Creates a queue owning a pool sized for `capacity` elements (the
    /// sentinel slot is added internally).
    pub fn new(capacity: u32) -> Self {
        Self::from_pool(PoolRef::Owned(NodePool::new(capacity.saturating_add(1))))
    }
}

impl<'p, T> Queue<'p, T> {
    /// Creates a queue drawing nodes from a shared pool.
    ///
    /// Acquires the queue's permanent sentinel from `pool` immediately.
    ///
    /// # Panics
    ///
    /// Panics when `pool` cannot supply the sentinel slot; that is a
    /// sizing fault, not backpressure.
    pub fn with_pool(pool: &'p QueuePool<T>) -> Self {
        Self::from_pool(PoolRef::Shared(pool))
    }

    fn from_pool(pool: PoolRef<'p, QueueNode<T>>) -> Self {
        let sentinel = pool
            .acquire_raw()
            .expect("node pool exhausted while acquiring the queue sentinel")
            .as_ptr();
        // SAFETY: the slot is exclusively ours; the sentinel's payload
        // stays uninitialised until a push promotes it to a data node.
        unsafe {
            sentinel.write(QueueNode {
                value: UnsafeCell::new(MaybeUninit::uninit()),
                prev: AtomicTaggedPtr::null(),
            });
        }

        Self {
            front: CacheAligned::new(AtomicTaggedPtr::new(TaggedPtr::new(sentinel, 0))),
            back: CacheAligned::new(AtomicTaggedPtr::new(TaggedPtr::new(sentinel, 0))),
            pool,
            #[cfg(feature = "diagnostics")]
            len: AtomicUsize::new(0),
        }
    }

    /// Pushes `value`, returning it in `Err` when the pool is exhausted.
    pub fn push(&self, value: T) -> Result<(), T> {
        let Some(new_node) = self.pool.acquire_raw() else {
            return Err(value);
        };
        let new_node = new_node.as_ptr();
        // SAFETY: exclusively ours until the swap publishes it as the new
        // sentinel; a null `prev` is exactly what marks it as such.
        unsafe {
            new_node.write(QueueNode {
                value: UnsafeCell::new(MaybeUninit::uninit()),
                prev: AtomicTaggedPtr::null(),
            });
        }

        // 1. The fresh node becomes the sentinel.
        let new_back = TaggedPtr::new(new_node, 0);
        let old_back = self.back.swap(new_back, Ordering::AcqRel).ptr();

        // SAFETY: between the swap above and the link store below, the
        // old sentinel is ours alone; consumers stop at its null `prev`.
        unsafe {
            // 2. Construct the payload into the node that was the
            //    sentinel.
            (*old_back).value.get().write(MaybeUninit::new(value));
            // 3. Link it; from here on consumers can pop it.
            (*old_back).prev.store(new_back, Ordering::Release);
        }

        #[cfg(feature = "diagnostics")]
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Pops the oldest element, or `None` when the queue is empty (which
    /// includes the in-flight-producer window described in the module
    /// docs).
    pub fn pop(&self) -> Option<T> {
        // Only the acquire on `prev` synchronises: it pairs with the
        // producer's release store after payload construction. The CAS on
        // `front` can stay fully relaxed because nobody touches a node
        // after it has been CASed out.
        let mut old_front = self.front.load(Ordering::Relaxed);
        // SAFETY: `front` always points at a pool slot (the sentinel
        // invariant); slot memory is never freed while the queue lives.
        let mut prev = unsafe { (*old_front.ptr()).prev.load(Ordering::Acquire) };

        while !prev.is_null() {
            let new_front = TaggedPtr::new(prev.ptr(), old_front.tag().wrapping_add(1));
            match self.front.compare_exchange_weak(
                old_front,
                new_front,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let node = old_front.ptr();
                    // SAFETY: the CAS made the node exclusively ours, and
                    // the acquire load of its link happened-after the
                    // producer finished constructing the payload.
                    let value = unsafe { (*node).value.get().read().assume_init() };
                    unsafe { self.pool.release_raw(NonNull::new_unchecked(node)) };
                    #[cfg(feature = "diagnostics")]
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    return Some(value);
                }
                Err(current) => {
                    old_front = current;
                    // SAFETY: as above, `front` is never null.
                    prev = unsafe { (*old_front.ptr()).prev.load(Ordering::Acquire) };
                }
            }
        }
        None
    }

    /// True when the queue holds no poppable elements.
    ///
    /// Relaxed snapshot, meant for serial phases; an in-flight producer
    /// also reads as "empty".
    #[inline]
    pub fn is_empty(&self) -> bool {
        let front = self.front.load(Ordering::Relaxed);
        // SAFETY: sentinel invariant, as in `pop`.
        unsafe { (*front.ptr()).prev.load(Ordering::Relaxed) }.is_null()
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
        let Some(new_node) = self.pool.acquire_raw() else {
            return Err(value);
        };
        let new_node = new_node.as_ptr();
        // SAFETY: exclusive access throughout by &mut.
        unsafe {
            new_node.write(QueueNode {
                value: UnsafeCell::new(MaybeUninit::uninit()),
                prev: AtomicTaggedPtr::null(),
            });
        }

        let new_back = TaggedPtr::new(new_node, 0);
        let old_back = self.back.swap(new_back, Ordering::Relaxed).ptr();
        unsafe {
            (*old_back).value.get().write(MaybeUninit::new(value));
            (*old_back).prev.store(new_back, Ordering::Relaxed);
        }

        #[cfg(feature = "diagnostics")]
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Serial-phase pop.
    pub fn pop_unsync(&mut self) -> Option<T> {
        let old_front = self.front.load(Ordering::Relaxed);
        // SAFETY: sentinel invariant plus exclusive access by &mut.
        let prev = unsafe { (*old_front.ptr()).prev.load(Ordering::Relaxed) };
        if prev.is_null() {
            return None;
        }

        self.front.store(
            TaggedPtr::new(prev.ptr(), old_front.tag().wrapping_add(1)),
            Ordering::Relaxed,
        );
        let node = old_front.ptr();
        let value = unsafe { (*node).value.get().read().assume_init() };
        unsafe { self.pool.release_raw(NonNull::new_unchecked(node)) };

        #[cfg(feature = "diagnostics")]
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(value)
    }
}

impl<T> Drop for Queue<'_, T> {
    /// Drains remaining elements, then returns the sentinel slot.
    ///
    /// Requires quiescence, as any drop of a shared structure does.
    fn drop(&mut self) {
        while self.pop_unsync().is_some() {}
        // The sentinel never had a payload constructed in it, so it goes
        // back raw rather than through the dropping release.
        let sentinel = self.front.load(Ordering::Relaxed).ptr();
        unsafe { self.pool.release_raw(NonNull::new_unchecked(sentinel)) };
    }
}
