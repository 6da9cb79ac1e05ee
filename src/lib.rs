//! Havuz: pool-backed lock-free containers for in-process
//! producer/consumer coordination.
//!
//! Everything in this crate draws its nodes from a bounded, preallocated
//! [`NodePool`], so the hot paths never lock, block, or touch the
//! allocator. That makes it a natural fit for worker pools, event dispatch
//! and job systems that exchange items between threads under latency
//! pressure.
//!
//! # Containers
//!
//! - [`NodePool`]: bounded lock-free freelist pool; O(1) slot
//!   acquire/release, shareable between containers.
//! - [`Stack`]: MPMC LIFO (Treiber stack over pool slots).
//! - [`Queue`]: MPMC FIFO with wait-free producers.
//! - [`MpscQueue`]: MPSC FIFO with wait-free producers and a CAS-free
//!   consumer.
//!
//! All of them work with move-only payloads and payloads without a
//! `Default` impl. A full pool is backpressure, not an error: `push`
//! hands the value back in `Err` and `pop` returns `None` when empty.
//!
//! # Example
//!
//! ```rust
//! use havuz::{Queue, Stack};
//!
//! let stack = Stack::new(8);
//! stack.push(1).unwrap();
//! stack.push(2).unwrap();
//! assert_eq!(stack.pop(), Some(2));
//!
//! let queue = Queue::new(8);
//! queue.push("first").unwrap();
//! queue.push("second").unwrap();
//! assert_eq!(queue.pop(), Some("first"));
//! ```
//!
//! # Caveats carried by design
//!
//! - The FIFO queues' producers publish before they link: a producer
//!   preempted mid-push briefly hides the elements behind its own (see
//!   the [`queue`] module docs). Consumers stay lock-free throughout.
//! - `is_empty` observers are relaxed snapshots, not linearisation
//!   points.
//! - Destroying a container while other threads still operate on it is a
//!   contract violation; callers provide quiescence (the borrow checker
//!   enforces this unless raw pointers are smuggled).
//!
//! # Cargo features
//!
//! - `diagnostics`: per-container approximate element counters, exposed
//!   as `len_hint()`. Estimates only; never branch on them.

#![no_std]
#![warn(missing_docs)]

extern crate alloc;

mod tagged;
mod utils;

pub mod mpsc;
pub mod pool;
pub mod queue;
pub mod stack;

pub use mpsc::{MpscNode, MpscPool, MpscQueue};
pub use pool::NodePool;
pub use queue::{Queue, QueueNode, QueuePool};
pub use stack::{Stack, StackNode, StackPool};
