//! Tracking of dispatched work, used to wait for the scheduler to go idle.

use crate::platform::*;

/// Counts jobs that have been placed on a worker queue and have not yet
/// finished. Jobs parked on a wait-list are deliberately not counted: once
/// nothing is queued or running, nothing can ever release them.
pub(crate) struct PendingJobs {
    count: AtomicU32,
}

impl PendingJobs {
    pub fn new() -> PendingJobs {
        PendingJobs {
            count: AtomicU32::new(0),
        }
    }

    /// Records that `jobs` more jobs are about to become visible to workers.
    /// Must be called before the jobs are queued.
    #[inline]
    pub fn add(&self, jobs: usize) {
        let jobs = u32::try_from(jobs).expect("too many jobs dispatched at once");
        self.count.fetch_add(jobs, Ordering::AcqRel);
    }

    /// Records that one job has finished, including dispatch of anything its
    /// completion released. Wakes idle waiters when the count hits zero.
    #[inline]
    pub fn complete(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            wake_all(&self.count);
        }
    }

    /// The number of jobs queued or running.
    #[inline]
    pub fn get(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Blocks until the count reaches zero.
    pub fn wait_until_idle(&self) {
        loop {
            let count = self.count.load(Ordering::Acquire);
            if count == 0 {
                return;
            }
            wait(&self.count, count);
        }
    }
}

#[cfg(not(loom))]
#[inline]
fn wait(count: &AtomicU32, expected: u32) {
    atomic_wait::wait(count, expected);
}

#[cfg(not(loom))]
#[inline]
fn wake_all(count: &AtomicU32) {
    atomic_wait::wake_all(count);
}

// Loom cannot model futexes, so fall back to yielding.

#[cfg(loom)]
fn wait(_count: &AtomicU32, _expected: u32) {
    loom::thread::yield_now();
}

#[cfg(loom)]
fn wake_all(_count: &AtomicU32) {}
