//! A fixed-size job scheduler driven by dependency counters.
//!
//! Stagehand runs short-lived jobs on a pool of worker threads, one job queue
//! per thread. Jobs are coordinated through *counters*: a job may name up to
//! four signal counters, which are incremented when the job is submitted and
//! decremented when it completes, and a single wait counter, which must read
//! zero before the job is allowed to run. Jobs submitted while their wait
//! counter is nonzero are parked on that counter's wait-list, and released
//! back into the queues by whichever worker brings the counter to zero.
//!
//! Chaining a stage's wait counter to the previous stage's signal counter is
//! how multi-stage pipelines are expressed without ever blocking a thread to
//! join:
//!
//! ```
//! # #![cfg(not(loom))]
//! use core::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use stagehand::{JobDecl, Scheduler};
//!
//! let scheduler = Scheduler::spawn(Some(2)).unwrap();
//! let culled = scheduler.get_counter_by_id("cull");
//! let total = Arc::new(AtomicUsize::new(0));
//!
//! // Stage one: four jobs signalling the `cull` counter.
//! scheduler.enqueue_jobs((0..4).map(|_| {
//!     let total = total.clone();
//!     JobDecl::new(move |_| {
//!         total.fetch_add(1, Ordering::Relaxed);
//!     })
//!     .signal(culled)
//! }));
//!
//! // Stage two: runs only once all of stage one has completed.
//! let observed = total.clone();
//! scheduler.enqueue_job(
//!     JobDecl::new(move |_| assert_eq!(observed.load(Ordering::Relaxed), 4)).wait_for(culled),
//! );
//!
//! scheduler.shutdown();
//! ```
//!
//! The scheduler does not steal work. Single submissions land on a random
//! queue and batches are spread round-robin, and an idle worker never pulls
//! from a busy worker's queue. Jobs that block will stall their queue.

#![no_std]

// -----------------------------------------------------------------------------
// Boilerplate for building without the standard library

extern crate alloc;
extern crate std;

// -----------------------------------------------------------------------------
// Modules

mod counter;
mod error;
mod idle;
mod job;
mod queue;
mod scheduler;
mod unwind;
mod util;

// -----------------------------------------------------------------------------
// Top-level exports

pub use counter::CounterHandle;
pub use error::SpawnError;
pub use job::JobDecl;
pub use job::MAX_SIGNAL_COUNTERS;
pub use job::Priority;
pub use job::SignalCounters;
pub use scheduler::Scheduler;
pub use scheduler::SchedulerBuilder;
pub use scheduler::Worker;

// -----------------------------------------------------------------------------
// Platform Support

// This crate uses `loom` for testing, which requires mocking all of the core
// threading primitives (`Mutex` and the like).
//
// To make things a bit simpler, we re-export all the important types in the
// `platform` module.

#[cfg(not(loom))]
mod platform {

    // Core exports

    pub use alloc::sync::Arc;
    pub use core::sync::atomic::AtomicBool;
    pub use core::sync::atomic::AtomicU32;
    pub use core::sync::atomic::Ordering;
    pub use std::sync::Condvar;
    pub use std::sync::Mutex;
    pub use std::sync::RwLock;
    pub use std::thread::Builder as ThreadBuilder;
    pub use std::thread::JoinHandle;
    pub use std::thread::available_parallelism;
    pub use std::thread_local;
}

#[cfg(loom)]
mod platform {

    // Core exports

    pub use loom::sync::Arc;
    pub use loom::sync::Condvar;
    pub use loom::sync::Mutex;
    pub use loom::sync::RwLock;
    pub use loom::sync::atomic::AtomicBool;
    pub use loom::sync::atomic::AtomicU32;
    pub use loom::sync::atomic::Ordering;
    pub use loom::thread::Builder as ThreadBuilder;
    pub use loom::thread::JoinHandle;
    pub use loom::thread_local;

    // Available parallelism

    pub fn available_parallelism() -> std::io::Result<core::num::NonZero<usize>> {
        panic!("available_parallelism does not work on loom");
    }
}
