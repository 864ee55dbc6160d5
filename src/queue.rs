//! Per-worker job queues.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::job::JobDecl;
use crate::job::Priority;
use crate::platform::*;

/// The queue owned by a single worker: one FIFO per priority, a flag saying
/// whether there may be work, and a condition variable the worker sleeps on.
pub(crate) struct JobQueue {
    state: Mutex<QueueState>,
    work_ready: Condvar,
}

struct QueueState {
    buckets: [VecDeque<JobDecl>; Priority::COUNT],
    has_work: bool,
}

impl QueueState {
    fn push(&mut self, job: JobDecl) {
        self.buckets[job.get_priority().bucket()].push_back(job);
        self.has_work = true;
    }

    /// Pops the front of the highest-priority nonempty bucket.
    fn pop(&mut self) -> Option<JobDecl> {
        self.buckets.iter_mut().find_map(VecDeque::pop_front)
    }
}

impl JobQueue {
    pub fn new() -> JobQueue {
        JobQueue {
            state: Mutex::new(QueueState {
                buckets: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                has_work: false,
            }),
            work_ready: Condvar::new(),
        }
    }

    /// Pushes a job and wakes the worker.
    pub fn push(&self, job: JobDecl) {
        self.state.lock().unwrap().push(job);
        self.work_ready.notify_one();
    }

    /// Pushes several jobs under a single lock, then wakes the worker.
    pub fn push_batch(&self, jobs: Vec<JobDecl>) {
        let mut state = self.state.lock().unwrap();
        for job in jobs {
            state.push(job);
        }
        drop(state);
        self.work_ready.notify_one();
    }

    /// Blocks until a job is available and pops it. Returns `None` once `halt`
    /// has been raised, which is checked each time the worker wakes.
    pub fn wait_for_job(&self, halt: &AtomicBool) -> Option<JobDecl> {
        let mut state = self.state.lock().unwrap();
        loop {
            if halt.load(Ordering::Acquire) {
                return None;
            }
            if state.has_work {
                if let Some(job) = state.pop() {
                    return Some(job);
                }
                // Nothing left in any bucket, go back to sleep.
                state.has_work = false;
            }
            state = self.work_ready.wait(state).unwrap();
        }
    }

    /// Forces the worker awake so it observes the halt flag. The flag is
    /// raised under the queue lock so the wake cannot be lost.
    pub fn wake_for_halt(&self) {
        let mut state = self.state.lock().unwrap();
        state.has_work = true;
        drop(state);
        self.work_ready.notify_all();
    }

    /// Number of jobs currently queued.
    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.buckets.iter().map(VecDeque::len).sum()
    }
}
