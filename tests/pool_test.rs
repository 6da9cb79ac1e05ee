use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use havuz::NodePool;

#[test]
fn single_thread_acquire_release() {
    let pool: NodePool<i32> = NodePool::new(3);
    assert!(pool.is_full());

    let e1 = pool.acquire(42).unwrap();
    let e2 = pool.acquire(666).unwrap();
    let e3 = pool.acquire_raw().unwrap();

    unsafe {
        assert_eq!(*e1.as_ref(), 42);
        assert_eq!(*e2.as_ref(), 666);
    }
    assert!(pool.is_empty());

    assert_eq!(pool.acquire(1138), Err(1138));

    unsafe {
        pool.release(e2);
        pool.release(e1);
        pool.release_raw(e3);
    }
    assert!(pool.is_full());
}

#[test]
fn acquire_release_round_trip_restores_capacity() {
    let pool: NodePool<u64> = NodePool::new(8);

    for _ in 0..3 {
        let slots: Vec<_> = (0..8).map(|i| pool.acquire(i as u64).unwrap()).collect();
        assert!(pool.is_empty());
        for slot in slots {
            unsafe { pool.release(slot) };
        }
        assert!(pool.is_full());
    }
}

#[test]
fn manages_only_own_slots() {
    let pool: NodePool<u64> = NodePool::new(2);
    let other: NodePool<u64> = NodePool::new(2);

    let slot = pool.acquire(7).unwrap();
    assert!(pool.manages(slot.as_ptr()));
    assert!(!other.manages(slot.as_ptr()));

    let local = 7u64;
    assert!(!pool.manages(&local));

    unsafe { pool.release(slot) };
}

#[test]
fn compact_pools_clamp_capacity() {
    // Sub-8-byte slots carry 16-bit freelist links, which caps how many
    // of them one pool can address.
    let compact: NodePool<i32> = NodePool::new(100_000);
    assert_eq!(compact.capacity(), u16::MAX as u32 - 1);

    let wide: NodePool<u64> = NodePool::new(100_000);
    assert_eq!(wide.capacity(), 100_000);
}

#[test]
fn zero_capacity_pool_is_always_exhausted() {
    let pool: NodePool<u64> = NodePool::new(0);
    assert!(pool.is_empty());
    assert!(pool.acquire_raw().is_none());
}

#[test]
fn release_drops_payload() {
    struct Token(Arc<AtomicU32>);

    impl Drop for Token {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    let drops = Arc::new(AtomicU32::new(0));
    let pool: NodePool<Token> = NodePool::new(1);

    let slot = pool
        .acquire(Token(drops.clone()))
        .unwrap_or_else(|_| panic!("fresh pool must have a slot"));
    unsafe { pool.release(slot) };

    assert_eq!(drops.load(Ordering::Relaxed), 1);
    assert!(pool.is_full());
}

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_acquire_until_exhausted_then_release() {
    const CAPACITY: u32 = 500;
    const TASKS: u32 = 16;

    let pool = Arc::new(NodePool::<u64>::new(CAPACITY));
    let claimed = Arc::new(AtomicU32::new(0));
    let waiting = Arc::new(AtomicU32::new(0));
    let release_signal = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::new();
    for _ in 0..TASKS {
        let pool = Arc::clone(&pool);
        let claimed = Arc::clone(&claimed);
        let waiting = Arc::clone(&waiting);
        let release_signal = Arc::clone(&release_signal);

        handles.push(thread::spawn(move || {
            let mut slots = Vec::new();
            while claimed.fetch_add(1, Ordering::AcqRel) < CAPACITY {
                // Exactly CAPACITY claims win the counter, so every
                // winner must be handed a slot.
                slots.push(pool.acquire_raw().expect("pool under-delivered"));
            }
            let acquired = slots.len();

            waiting.fetch_add(1, Ordering::AcqRel);
            while !release_signal.load(Ordering::Acquire) {
                thread::yield_now();
            }

            for slot in slots {
                unsafe { pool.release_raw(slot) };
            }
            acquired
        }));
    }

    // Once every task is parked, all slots are out.
    while waiting.load(Ordering::Acquire) < TASKS {
        thread::yield_now();
    }
    assert!(pool.is_empty());

    release_signal.store(true, Ordering::Release);

    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total as u32, pool.capacity());
    assert!(pool.is_full());
}
