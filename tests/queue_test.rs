use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_utils::Backoff;
use havuz::{NodePool, Queue, QueuePool};
use rand::Rng;

fn exercise_serial(queue: &mut Queue<'_, i32>) {
    assert!(queue.is_empty());

    assert!(queue.push_unsync(42).is_ok());
    assert!(queue.push_unsync(666).is_ok());
    assert!(queue.push_unsync(1337).is_ok());

    assert_eq!(queue.push_unsync(1138), Err(1138));

    assert_eq!(queue.pop_unsync(), Some(42));
    assert_eq!(queue.pop_unsync(), Some(666));
    assert_eq!(queue.pop_unsync(), Some(1337));
    assert_eq!(queue.pop_unsync(), None);
}

#[test]
fn single_thread_shared_pool() {
    // Three payload slots plus the queue's sentinel.
    let pool: QueuePool<i32> = NodePool::new(3 + 1);
    let mut queue = Queue::with_pool(&pool);
    exercise_serial(&mut queue);

    drop(queue);
    assert!(pool.is_full());
}

#[test]
fn single_thread_owned_pool() {
    // The owned pool adds the sentinel slot internally.
    let mut queue = Queue::new(3);
    exercise_serial(&mut queue);
}

#[test]
fn atomic_interface_matches_serial() {
    let queue = Queue::new(3);

    assert!(queue.push(42).is_ok());
    assert!(queue.push(666).is_ok());
    assert!(queue.push(1337).is_ok());
    assert_eq!(queue.push(1138), Err(1138));

    assert_eq!(queue.pop(), Some(42));
    assert_eq!(queue.pop(), Some(666));
    assert_eq!(queue.pop(), Some(1337));
    assert_eq!(queue.pop(), None);
}

#[test]
fn move_only_payload_without_default() {
    struct Job(String);

    let queue = Queue::new(2);
    assert!(queue.push(Job(String::from("fst"))).is_ok());
    assert!(queue.push(Job(String::from("snd"))).is_ok());

    assert_eq!(queue.pop().unwrap().0, "fst");
    assert_eq!(queue.pop().unwrap().0, "snd");
    assert!(queue.pop().is_none());
}

#[test]
fn shared_pool_feeds_two_queues() {
    // Four payload slots plus one sentinel per queue.
    let pool: QueuePool<u32> = NodePool::new(4 + 2);
    let q1 = Queue::with_pool(&pool);
    let q2 = Queue::with_pool(&pool);

    assert!(q1.push(1).is_ok());
    assert!(q1.push(2).is_ok());
    assert!(q2.push(3).is_ok());
    assert!(q2.push(4).is_ok());

    // The pool, not the queue, is what bounds each container.
    assert_eq!(q1.push(5), Err(5));
    assert_eq!(q2.push(6), Err(6));

    assert_eq!(q1.pop(), Some(1));
    assert!(q2.push(5).is_ok());

    drop(q1);
    drop(q2);
    assert!(pool.is_full());
}

#[test]
fn drop_drains_remaining_payloads() {
    struct Token(Arc<AtomicU32>);

    impl Drop for Token {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    let drops = Arc::new(AtomicU32::new(0));
    let pool: QueuePool<Token> = NodePool::new(4 + 1);

    {
        let queue = Queue::with_pool(&pool);
        for _ in 0..4 {
            assert!(queue.push(Token(drops.clone())).is_ok());
        }
        assert_eq!(drops.load(Ordering::Relaxed), 0);
    }

    assert_eq!(drops.load(Ordering::Relaxed), 4);
    assert!(pool.is_full());
}

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_churn() {
    const CAPACITY: u32 = 300;

    let queue = Arc::new(Queue::new(CAPACITY));
    let mut rng = rand::thread_rng();

    let mut scheduled_pushes = 0u32;
    let mut scheduled_pops = 0u32;
    let mut handles = Vec::with_capacity(CAPACITY as usize * 2);

    for _ in 0..CAPACITY * 2 {
        let can_push = scheduled_pushes < CAPACITY;
        let can_pop = scheduled_pops < scheduled_pushes;
        let do_pop = can_pop && (rng.gen::<bool>() || !can_push);

        let queue = Arc::clone(&queue);
        let handle = if do_pop {
            scheduled_pops += 1;
            thread::Builder::new()
                .stack_size(64 * 1024)
                .spawn(move || {
                    let backoff = Backoff::new();
                    while queue.pop().is_none() {
                        backoff.snooze();
                    }
                })
        } else {
            scheduled_pushes += 1;
            let value = rng.gen::<i32>();
            thread::Builder::new()
                .stack_size(64 * 1024)
                .spawn(move || {
                    queue
                        .push(value)
                        .unwrap_or_else(|_| panic!("outstanding pushes exceeded capacity"));
                })
        };
        handles.push(handle.unwrap());
    }

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(queue.is_empty());
    assert!(queue.pop().is_none());
}

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_conservation() {
    const PRODUCERS: u32 = 4;
    const CONSUMERS: usize = 4;
    const PER_PRODUCER: u32 = 250;
    const TOTAL: u32 = PRODUCERS * PER_PRODUCER;

    let queue = Arc::new(Queue::new(TOTAL));
    let popped = Arc::new(AtomicU32::new(0));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|tid| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    // Capacity covers every push, so none may fail.
                    assert!(queue.push(tid * PER_PRODUCER + i).is_ok());
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let popped = Arc::clone(&popped);
            thread::spawn(move || {
                let mut values = Vec::new();
                let backoff = Backoff::new();
                while popped.load(Ordering::Acquire) < TOTAL {
                    match queue.pop() {
                        Some(value) => {
                            popped.fetch_add(1, Ordering::AcqRel);
                            values.push(value);
                            backoff.reset();
                        }
                        None => backoff.snooze(),
                    }
                }
                values
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }

    let mut all: Vec<u32> = consumers
        .into_iter()
        .flat_map(|c| c.join().unwrap())
        .collect();
    all.sort_unstable();

    // Every distinct pushed value was popped exactly once.
    assert_eq!(all, (0..TOTAL).collect::<Vec<_>>());
    assert!(queue.pop().is_none());
}
