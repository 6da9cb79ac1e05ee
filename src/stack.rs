//! `Stack<T>` — a pool-backed MPMC LIFO stack.
//!
//! A Treiber stack whose nodes live in a [`NodePool`] instead of the heap:
//! pushing acquires a slot, popping releases it, and the stack is bounded
//! by the pool's capacity. Because the pool recycles slots without ever
//! freeing their memory, the classic Treiber ABA hazard is handled with a
//! tag in the `top` word rather than with a reclamation scheme.
//!
//! Works with move-only payloads and payloads without a `Default`
//! impl; a full pool simply hands the value back.
//!
//! The `*_unsync` variants take `&mut self` for single-threaded phases
//! (setup, teardown, tests) and skip the CAS protocol.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

#[cfg(feature = "diagnostics")]
use core::sync::atomic::AtomicUsize;

use crate::pool::{NodePool, PoolRef};
use crate::tagged::{AtomicTaggedPtr, TaggedPtr};
use crate::utils::CacheAligned;

/// One stack element as it lives inside a node pool: the payload plus the
/// link to the element below it.
///
/// Opaque; it exists in the public API only so shared pools can be
/// declared (see [`StackPool`]).
pub struct StackNode<T> {
    value: UnsafeCell<MaybeUninit<T>>,
    // Written before the node is published via `top`, so ordinary readers
    // see it initialised. The atomic type is there because a racing pop
    // may read the link of a node that has already been recycled; the
    // tagged CAS on `top` rejects such snapshots.
    prev: AtomicTaggedPtr<StackNode<T>>,
}

unsafe impl<T: Send> Send for StackNode<T> {}
unsafe impl<T: Send> Sync for StackNode<T> {}

/// The pool type a [`Stack`] draws its nodes from.
///
/// Declare one of these to share node storage between several stacks:
///
/// ```rust
/// use havuz::{NodePool, Stack, StackPool};
///
/// let pool: StackPool<u32> = NodePool::new(64);
/// let a = Stack::with_pool(&pool);
/// let b = Stack::with_pool(&pool);
/// # drop((a, b));
/// ```
pub type StackPool<T> = NodePool<StackNode<T>>;

/// A bounded multi-producer multi-consumer LIFO stack.
///
/// Push and pop are lock-free; neither blocks, yields, or allocates. The
/// stack either borrows a caller-managed [`StackPool`] or owns one sized
/// at construction.
pub struct Stack<'p, T> {
    top: CacheAligned<AtomicTaggedPtr<StackNode<T>>>,
    pool: PoolRef<'p, StackNode<T>>,
    #[cfg(feature = "diagnostics")]
    len: AtomicUsize,
}

unsafe impl<T: Send> Send for Stack<'_, T> {}
unsafe impl<T: Send> Sync for Stack<'_, T> {}

impl<T> Stack<'static, T> {
    /// Creates a stack owning a pool of exactly `capacity` slots.
    pub fn new(capacity: u32) -> Self {
        Self::from_pool(PoolRef::Owned(NodePool::new(capacity)))
    }
}

impl<'p, T> Stack<'p, T> {
    /// Creates a stack drawing nodes from a shared pool.
    ///
    /// The stack is bounded by whatever is left in `pool`; size the pool
    /// for the sum of all containers feeding on it.
    pub fn with_pool(pool: &'p StackPool<T>) -> Self {
        Self::from_pool(PoolRef::Shared(pool))
    }

    fn from_pool(pool: PoolRef<'p, StackNode<T>>) -> Self {
        Self {
            top: CacheAligned::new(AtomicTaggedPtr::null()),
            pool,
            #[cfg(feature = "diagnostics")]
            len: AtomicUsize::new(0),
        }
    }

    /// Pushes `value`, returning it in `Err` when the pool is exhausted.
    pub fn push(&self, value: T) -> Result<(), T> {
        let Some(node) = self.pool.acquire_raw() else {
            return Err(value);
        };
        let node = node.as_ptr();

        let mut observed = self.top.load(Ordering::Relaxed);
        // SAFETY: the slot is exclusively ours until the CAS below
        // publishes it.
        unsafe {
            node.write(StackNode {
                value: UnsafeCell::new(MaybeUninit::new(value)),
                prev: AtomicTaggedPtr::new(observed),
            });
        }

        loop {
            // The new top inherits the observed tag; only pops bump it.
            let new_top = TaggedPtr::new(node, observed.tag());
            match self
                .top
                .compare_exchange_weak(observed, new_top, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    #[cfg(feature = "diagnostics")]
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(current) => {
                    observed = current;
                    // Still unpublished, so a plain relaxed store is
                    // enough to re-point the link.
                    unsafe { (*node).prev.store(observed, Ordering::Relaxed) };
                }
            }
        }
    }

    /// Pops the most recently pushed element, or `None` when empty.
    pub fn pop(&self) -> Option<T> {
        let mut old_top = self.top.load(Ordering::Acquire);
        while !old_top.is_null() {
            let node = old_top.ptr();
            // The node may already have been popped and recycled by a
            // racing consumer, in which case this link is garbage. The
            // memory itself stays allocated (pool slots are recycled, not
            // freed) and the tagged CAS below rejects stale snapshots.
            let prev = unsafe { (*node).prev.load(Ordering::Relaxed) };

            let new_top = TaggedPtr::new(prev.ptr(), old_top.tag().wrapping_add(1));
            match self.top.compare_exchange_weak(
                old_top,
                new_top,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // The CAS made the node exclusively ours.
                    // SAFETY: published nodes hold an initialised payload;
                    // it is moved out bitwise, so the slot goes back raw.
                    let value = unsafe { (*node).value.get().read().assume_init() };
                    unsafe { self.pool.release_raw(NonNull::new_unchecked(node)) };
                    #[cfg(feature = "diagnostics")]
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    return Some(value);
                }
                Err(current) => old_top = current,
            }
        }
        None
    }

    /// True when the stack holds no elements.
    ///
    /// Relaxed snapshot; under concurrency it may be stale by the time
    /// the caller acts on it. Meant for serial phases.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.top.load(Ordering::Relaxed).is_null()
    }

    /// Approximate element count. A relaxed estimate for observability
    /// only; never branch on it.
    #[cfg(feature = "diagnostics")]
    #[inline]
    pub fn len_hint(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Serial-phase push. Exclusive access replaces the CAS protocol.
    pub fn push_unsync(&mut self, value: T) -> Result<(), T> {
        let Some(node) = self.pool.acquire_raw() else {
            return Err(value);
        };
        let node = node.as_ptr();

        let observed = self.top.load(Ordering::Relaxed);
        // SAFETY: slot exclusively ours; no concurrent readers by &mut.
        unsafe {
            node.write(StackNode {
                value: UnsafeCell::new(MaybeUninit::new(value)),
                prev: AtomicTaggedPtr::new(observed),
            });
        }
        self.top
            .store(TaggedPtr::new(node, observed.tag()), Ordering::Relaxed);

        #[cfg(feature = "diagnostics")]
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Serial-phase pop.
    pub fn pop_unsync(&mut self) -> Option<T> {
        let old_top = self.top.load(Ordering::Relaxed);
        if old_top.is_null() {
            return None;
        }
        let node = old_top.ptr();

        // SAFETY: &mut self rules out racing consumers; the node is live.
        let prev = unsafe { (*node).prev.load(Ordering::Relaxed) };
        self.top.store(
            TaggedPtr::new(prev.ptr(), old_top.tag().wrapping_add(1)),
            Ordering::Relaxed,
        );
        let value = unsafe { (*node).value.get().read().assume_init() };
        unsafe { self.pool.release_raw(NonNull::new_unchecked(node)) };

        #[cfg(feature = "diagnostics")]
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(value)
    }
}

impl<T> Drop for Stack<'_, T> {
    /// Drains the remaining elements back into the pool.
    ///
    /// The usual drop rules make this safe for owned usage; if raw
    /// pointers to the stack were smuggled to other threads, the caller
    /// must have quiesced them first.
    fn drop(&mut self) {
        while self.pop_unsync().is_some() {}
    }
}
