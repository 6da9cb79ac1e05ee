//! `NodePool<T>` — a bounded lock-free freelist pool.
//!
//! The pool allocates one contiguous region of `capacity` fixed-size slots
//! up front and never resizes it. Acquiring and releasing a slot are O(1)
//! CAS loops on a single tagged head word; the pool neither blocks nor
//! touches the global allocator after construction, which is what makes it
//! usable as the node substrate for the containers in this crate.
//!
//! # Key properties
//!
//! - **Zero allocation on the hot path**: storage is one up-front
//!   allocation; acquire/release only move indices between the freelist
//!   head and slot-resident links.
//! - **Lock-free**: a stalled thread cannot prevent others from
//!   acquiring or releasing.
//! - **Shareable**: several containers can draw their nodes from one
//!   pool.
//! - **Stable addresses**: a slot never moves for the pool's lifetime, so
//!   containers may keep raw pointers into the storage.
//!
//! # Freelist layout
//!
//! Free slots form an intrusive stack threaded through the slots
//! themselves: the first bytes of a free slot hold the index of the next
//! free slot. The head is a single atomic packing `(index, tag)`; the tag
//! is bumped on every successful acquire, which is what defeats ABA (a
//! slot can only reappear at the head after a release in between, and by
//! then the tag has moved on). The release side deliberately leaves the
//! tag untouched.
//!
//! Because the link is overlaid on slot storage, the content of a released
//! slot is undefined, and a slot must be able to host a link: payloads
//! eight bytes or wider use 32-bit indices (capacity up to `u32::MAX - 1`),
//! narrower payloads use compact 16-bit links and clamp capacity to
//! `u16::MAX - 1`.

use core::alloc::Layout;
use core::marker::PhantomData;
use core::mem;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering;

use portable_atomic::{AtomicU32, AtomicU64};

use crate::utils::CacheAligned;

/// Reserved index meaning "no slot".
const NULL_IDX: u32 = u32::MAX;

#[inline]
fn pack(idx: u32, tag: u32) -> u64 {
    (idx as u64) | ((tag as u64) << 32)
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

/// A bounded lock-free pool of fixed-size slots.
///
/// [`acquire_raw`](NodePool::acquire_raw) hands out uninitialised slots;
/// [`acquire`](NodePool::acquire) moves a value in. Releasing is the
/// caller's duty and is `unsafe` because the pool cannot prove a pointer
/// was one of its own live slots. An exhausted pool is not an error, it is
/// backpressure: [`acquire_raw`](NodePool::acquire_raw) returns `None` and
/// [`acquire`](NodePool::acquire) hands the value back.
///
/// The pool is movable (storage is a stable heap allocation) but not
/// clonable. Dropping it frees the storage only; any still-acquired
/// payloads must have been released (or their drop must not matter) by
/// then.
pub struct NodePool<T> {
    head: CacheAligned<AtomicU64>,
    storage: NonNull<u8>,
    capacity: u32,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for NodePool<T> {}
unsafe impl<T: Send> Sync for NodePool<T> {}

impl<T> NodePool<T> {
    /// Wide links are two packed `u32`s and need 8 bytes of slot storage;
    /// narrower slots fall back to two packed `u16`s.
    const WIDE_LINKS: bool = mem::size_of::<T>() >= mem::size_of::<u64>();

    const LINK_SIZE: usize = if Self::WIDE_LINKS { 8 } else { 4 };

    /// Largest usable capacity; one index value is reserved as the null
    /// sentinel.
    pub const MAX_CAPACITY: u32 = if Self::WIDE_LINKS {
        u32::MAX - 1
    } else {
        u16::MAX as u32 - 1
    };

    const SLOT_ALIGN: usize = {
        let payload = mem::align_of::<T>();
        if payload > Self::LINK_SIZE {
            payload
        } else {
            Self::LINK_SIZE
        }
    };

    /// Slot stride: big enough for the payload and the overlaid link,
    /// rounded so every slot keeps the link naturally aligned.
    const SLOT_SIZE: usize = {
        let payload = mem::size_of::<T>();
        let raw = if payload > Self::LINK_SIZE {
            payload
        } else {
            Self::LINK_SIZE
        };
        (raw + Self::SLOT_ALIGN - 1) & !(Self::SLOT_ALIGN - 1)
    };

    /// Creates a pool of `capacity` slots, all initially free.
    ///
    /// Requests beyond [`MAX_CAPACITY`](NodePool::MAX_CAPACITY) are
    /// clamped to it.
    pub fn new(capacity: u32) -> Self {
        const {
            assert!(
                mem::size_of::<T>() >= mem::size_of::<u32>(),
                "pool payloads must be at least 4 bytes so a free slot can hold its link"
            );
        }

        let capacity = capacity.min(Self::MAX_CAPACITY);
        let storage = if capacity == 0 {
            NonNull::dangling()
        } else {
            let layout = Self::storage_layout(capacity);
            // SAFETY: capacity > 0 and T is not a ZST (4-byte minimum
            // above), so the layout is non-zero-sized.
            let raw = unsafe { alloc::alloc::alloc(layout) };
            match NonNull::new(raw) {
                Some(ptr) => ptr,
                None => alloc::alloc::handle_alloc_error(layout),
            }
        };

        let pool = Self {
            head: CacheAligned::new(AtomicU64::new(pack(NULL_IDX, 0))),
            storage,
            capacity,
            _marker: PhantomData,
        };

        // Thread the freelist through the slots: each links to its left
        // neighbour, slot 0 terminates (index wraps to the null sentinel).
        for idx in 0..capacity {
            // SAFETY: idx is in range; construction is single-threaded.
            unsafe { pool.write_link(idx, idx.wrapping_sub(1), 0) };
        }
        if capacity > 0 {
            pool.head.store(pack(capacity - 1, 0), Ordering::Relaxed);
        }

        pool
    }

    /// Acquires an uninitialised slot, or `None` if the pool is exhausted.
    ///
    /// The returned memory is suitably sized and aligned for a `T` but
    /// holds garbage; write before reading. Hand the pointer back through
    /// [`release_raw`](NodePool::release_raw) (or
    /// [`release`](NodePool::release) once a payload lives there).
    #[inline]
    pub fn acquire_raw(&self) -> Option<NonNull<T>> {
        let idx = self.acquire_idx();
        if self.is_null_idx(idx) {
            return None;
        }
        // SAFETY: slot addresses are derived from the non-null storage
        // base.
        Some(unsafe { NonNull::new_unchecked(self.slot_ptr(idx).cast::<T>()) })
    }

    /// Acquires a slot and moves `value` into it.
    ///
    /// On exhaustion the value is handed back in `Err`.
    #[inline]
    pub fn acquire(&self, value: T) -> Result<NonNull<T>, T> {
        let Some(slot) = self.acquire_raw() else {
            return Err(value);
        };
        // SAFETY: the slot is exclusively ours until released, and is
        // valid for writes of T.
        unsafe { slot.as_ptr().write(value) };
        Ok(slot)
    }

    /// Returns a slot to the freelist without touching its content.
    ///
    /// Afterwards the slot's content is undefined (the freelist link is
    /// overlaid on it).
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `acquire_raw`/`acquire` on *this* pool
    /// and must not have been released since. If a payload was
    /// constructed in the slot it is leaked, not dropped; use
    /// [`release`](NodePool::release) for live payloads.
    #[inline]
    pub unsafe fn release_raw(&self, ptr: NonNull<T>) {
        debug_assert!(
            self.manages(ptr.as_ptr()),
            "released a pointer this pool does not manage"
        );
        let idx = self.index_of(ptr.as_ptr());
        // SAFETY: caller guarantees the slot is live and ours.
        unsafe { self.release_idx(idx) };
    }

    /// Drops the payload in the slot, then returns the slot to the
    /// freelist.
    ///
    /// # Safety
    ///
    /// As for [`release_raw`](NodePool::release_raw), and the slot must
    /// contain a valid `T`.
    #[inline]
    pub unsafe fn release(&self, ptr: NonNull<T>) {
        if mem::needs_drop::<T>() {
            // SAFETY: caller guarantees a valid payload.
            unsafe { ptr::drop_in_place(ptr.as_ptr()) };
        }
        // SAFETY: forwarded caller contract.
        unsafe { self.release_raw(ptr) };
    }

    /// True when no free slot is left. O(1), relaxed; only a snapshot
    /// under concurrency.
    #[inline]
    pub fn is_empty(&self) -> bool {
        let (idx, _) = unpack(self.head.load(Ordering::Relaxed));
        self.is_null_idx(idx)
    }

    /// True when every slot is free.
    ///
    /// Walks the freelist, so this is O(capacity) and only meaningful
    /// while no other thread is operating on the pool.
    pub fn is_full(&self) -> bool {
        let (mut idx, _) = unpack(self.head.load(Ordering::Relaxed));
        let mut free = 0;
        while free < self.capacity {
            if self.is_null_idx(idx) {
                return false;
            }
            // SAFETY: idx was checked in range.
            idx = unsafe { self.read_link(idx) };
            free += 1;
        }
        true
    }

    /// True when `ptr` addresses one of this pool's slots.
    #[inline]
    pub fn manages(&self, ptr: *const T) -> bool {
        if self.capacity == 0 {
            return false;
        }
        let base = self.storage.as_ptr() as usize;
        let addr = ptr as usize;
        let span = self.capacity as usize * Self::SLOT_SIZE;
        addr >= base && addr < base + span && (addr - base) % Self::SLOT_SIZE == 0
    }

    /// Number of slots the pool manages.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    // -----------------------------------------------------------------
    // Freelist internals
    // -----------------------------------------------------------------

    #[inline]
    fn is_null_idx(&self, idx: u32) -> bool {
        // Covers both sentinels: u32::MAX (wide) and the widened u16::MAX
        // (compact), since capacity never reaches either.
        idx >= self.capacity
    }

    #[inline]
    fn slot_ptr(&self, idx: u32) -> *mut u8 {
        debug_assert!(idx < self.capacity);
        // SAFETY: idx < capacity keeps the offset inside the allocation.
        unsafe { self.storage.as_ptr().add(idx as usize * Self::SLOT_SIZE) }
    }

    #[inline]
    fn index_of(&self, ptr: *const T) -> u32 {
        ((ptr as usize - self.storage.as_ptr() as usize) / Self::SLOT_SIZE) as u32
    }

    fn storage_layout(capacity: u32) -> Layout {
        Layout::from_size_align(capacity as usize * Self::SLOT_SIZE, Self::SLOT_ALIGN)
            .expect("pool storage layout overflows usize")
    }

    /// Reads the next-free index stored in slot `idx`.
    ///
    /// The slot may be concurrently acquired and overwritten by another
    /// thread; the load is atomic so that racy read is defined, and the
    /// caller's tagged CAS rejects any snapshot that went stale.
    ///
    /// # Safety
    ///
    /// `idx` must be in range.
    #[inline]
    unsafe fn read_link(&self, idx: u32) -> u32 {
        let slot = self.slot_ptr(idx);
        if Self::WIDE_LINKS {
            // SAFETY: slots are at least 8 bytes and 8-aligned in wide
            // mode.
            let word = unsafe { &*slot.cast::<AtomicU64>() }.load(Ordering::Acquire);
            word as u32
        } else {
            // SAFETY: slots are at least 4 bytes and 4-aligned.
            let word = unsafe { &*slot.cast::<AtomicU32>() }.load(Ordering::Acquire);
            // 0xFFFF widens past any clamped capacity, i.e. stays null.
            word & 0xFFFF
        }
    }

    /// Stores a `(next, tag)` link into slot `idx`.
    ///
    /// # Safety
    ///
    /// `idx` must be in range and the slot must not hold a live payload.
    #[inline]
    unsafe fn write_link(&self, idx: u32, next: u32, tag: u32) {
        let slot = self.slot_ptr(idx);
        if Self::WIDE_LINKS {
            // SAFETY: see read_link.
            unsafe { &*slot.cast::<AtomicU64>() }.store(pack(next, tag), Ordering::Relaxed);
        } else {
            let word = (next as u16 as u32) | ((tag as u16 as u32) << 16);
            // SAFETY: see read_link.
            unsafe { &*slot.cast::<AtomicU32>() }.store(word, Ordering::Relaxed);
        }
    }

    /// Pops a free slot index off the head, or the null sentinel.
    fn acquire_idx(&self) -> u32 {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let (idx, tag) = unpack(head);
            if self.is_null_idx(idx) {
                return NULL_IDX;
            }
            // SAFETY: idx is in range. If the slot got recycled under us
            // this reads garbage, which the CAS below then rejects.
            let next = unsafe { self.read_link(idx) };
            match self.head.compare_exchange_weak(
                head,
                pack(next, tag.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return idx,
                Err(current) => head = current,
            }
        }
    }

    /// Pushes slot `idx` back onto the head. The tag is left unchanged;
    /// only the consume side bumps it.
    ///
    /// # Safety
    ///
    /// `idx` must be in range, previously acquired, and not already free.
    unsafe fn release_idx(&self, idx: u32) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let (head_idx, tag) = unpack(head);
            // SAFETY: the slot is exclusively ours until the CAS
            // publishes it.
            unsafe { self.write_link(idx, head_idx, tag) };
            match self.head.compare_exchange_weak(
                head,
                pack(idx, tag),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }
}

impl<T> Drop for NodePool<T> {
    fn drop(&mut self) {
        if self.capacity != 0 {
            // Storage only; still-acquired payloads are the caller's
            // responsibility (releases are not reference-counted).
            unsafe {
                alloc::alloc::dealloc(self.storage.as_ptr(), Self::storage_layout(self.capacity))
            };
        }
    }
}

/// A container's handle to its node pool: either borrowed from the
/// caller (shared pool) or owned outright (local storage).
///
/// Both construction paths feed the same container code, which only ever
/// sees `&NodePool<N>` through the deref.
pub(crate) enum PoolRef<'p, N> {
    Owned(NodePool<N>),
    Shared(&'p NodePool<N>),
}

impl<N> Deref for PoolRef<'_, N> {
    type Target = NodePool<N>;

    #[inline]
    fn deref(&self) -> &NodePool<N> {
        match self {
            PoolRef::Owned(pool) => pool,
            PoolRef::Shared(pool) => pool,
        }
    }
}
