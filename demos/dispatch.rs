//! Job dispatch walkthrough: worker threads push results into an MPSC
//! queue while the main thread consumes them, with the node pool
//! providing backpressure instead of allocation.

use std::sync::Arc;
use std::thread;

use havuz::MpscQueue;

struct JobResult {
    worker: usize,
    job: usize,
    outcome: u64,
}

fn main() {
    const WORKERS: usize = 4;
    const JOBS_PER_WORKER: usize = 8;

    // Small on purpose: workers outrun the consumer and feel the pool.
    let results = Arc::new(MpscQueue::new(8));

    let workers: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let results = Arc::clone(&results);
            thread::spawn(move || {
                for job in 0..JOBS_PER_WORKER {
                    let mut result = JobResult {
                        worker,
                        job,
                        outcome: (worker * JOBS_PER_WORKER + job) as u64 * 31,
                    };
                    // A full pool hands the value back; retry until the
                    // consumer frees a slot.
                    loop {
                        match results.push(result) {
                            Ok(()) => break,
                            Err(returned) => {
                                result = returned;
                                thread::yield_now();
                            }
                        }
                    }
                }
            })
        })
        .collect();

    let mut received = 0;
    while received < WORKERS * JOBS_PER_WORKER {
        // The main thread is the single consumer.
        if let Some(result) = unsafe { results.pop() } {
            println!(
                "worker {} finished job {} -> {}",
                result.worker, result.job, result.outcome
            );
            received += 1;
        } else {
            thread::yield_now();
        }
    }

    for worker in workers {
        worker.join().unwrap();
    }

    println!("all {received} results delivered");
}
