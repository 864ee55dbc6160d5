//! This module defines the job declaration, the unit of work submitted to the
//! scheduler. A [`JobDecl`] bundles the work itself with the scheduling
//! metadata the scheduler acts on: a [`Priority`], an optional wait counter and
//! up to [`MAX_SIGNAL_COUNTERS`] signal counters.
//!
//! Declarations are moved, never shared. They travel from the producer into
//! either a worker queue or a counter's wait-list, and are consumed when they
//! execute. Each declaration therefore runs its work exactly once.

use alloc::boxed::Box;
use core::fmt;

use crate::counter::CounterHandle;
use crate::scheduler::Worker;
use crate::unwind;

// -----------------------------------------------------------------------------
// Priority

/// Execution preference of a job within a worker queue. Workers always drain
/// every `High` job before any `Normal` one, and every `Normal` job before any
/// `Low` one. Within one priority jobs run in submission order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Runs before anything else queued on the same worker.
    High,
    /// The default priority.
    #[default]
    Normal,
    /// Runs only when the worker has nothing else to do.
    Low,
}

impl Priority {
    /// Number of distinct priorities, and so of buckets in each queue.
    pub(crate) const COUNT: usize = 3;

    /// Index of this priority's bucket. Lower indices are served first.
    #[inline(always)]
    pub(crate) fn bucket(self) -> usize {
        self as usize
    }
}

// -----------------------------------------------------------------------------
// Signal counters

/// The maximum number of signal counters a single job may name.
pub const MAX_SIGNAL_COUNTERS: usize = 4;

/// A fixed-capacity set of counter handles a job signals on completion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SignalCounters {
    handles: [Option<CounterHandle>; MAX_SIGNAL_COUNTERS],
    len: usize,
}

impl SignalCounters {
    /// Adds a handle, returning it back if the set is already full.
    pub fn push(&mut self, handle: CounterHandle) -> Result<(), CounterHandle> {
        match self.handles.get_mut(self.len) {
            Some(slot) => {
                *slot = Some(handle);
                self.len += 1;
                Ok(())
            }
            None => Err(handle),
        }
    }

    /// The number of handles in the set.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no handles have been added.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates over the handles in the order they were added.
    pub fn iter(&self) -> impl Iterator<Item = CounterHandle> + '_ {
        self.handles[..self.len].iter().flatten().copied()
    }
}

// -----------------------------------------------------------------------------
// Job declaration

type Work = Box<dyn FnOnce(&Worker) + Send + 'static>;

/// A declaration of a job to run on the scheduler.
///
/// The work receives the [`Worker`] executing it, through which it can reach
/// the scheduler and submit follow-up jobs. Anything the work captures stays
/// owned by the job until it runs, including while it sits parked on a
/// wait-list; the scheduler never inspects it. Results flow back to the
/// producer only through such captured state, typically observed after the
/// job's signal counter reaches zero.
pub struct JobDecl {
    work: Work,
    priority: Priority,
    wait_counter: Option<CounterHandle>,
    signal_counters: SignalCounters,
}

impl JobDecl {
    /// Declares a job running the provided closure, at `Normal` priority and
    /// with no counters attached.
    pub fn new<F>(f: F) -> JobDecl
    where
        F: FnOnce(&Worker) + Send + 'static,
    {
        JobDecl {
            work: Box::new(f),
            priority: Priority::Normal,
            wait_counter: None,
            signal_counters: SignalCounters::default(),
        }
    }

    /// Declares a job that calls `function` with a single caller-owned
    /// parameter. This is the closure-free form of [`JobDecl::new`], convenient
    /// when many jobs share one entry point and differ only in their payload.
    pub fn with_param<P>(function: fn(&Worker, P), param: P) -> JobDecl
    where
        P: Send + 'static,
    {
        JobDecl::new(move |worker| function(worker, param))
    }

    /// Sets the priority of the job.
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> JobDecl {
        self.priority = priority;
        self
    }

    /// Defers the job until `counter` reads zero. A job has at most one wait
    /// counter; calling this again replaces it.
    #[must_use]
    pub fn wait_for(mut self, counter: CounterHandle) -> JobDecl {
        self.wait_counter = Some(counter);
        self
    }

    /// Adds a signal counter, which is incremented when the job is submitted
    /// and decremented once it has run.
    ///
    /// # Panics
    ///
    /// Panics if the job already names [`MAX_SIGNAL_COUNTERS`] signal counters.
    #[must_use]
    pub fn signal(mut self, counter: CounterHandle) -> JobDecl {
        if let Err(handle) = self.signal_counters.push(counter) {
            panic!(
                "attempt to add signal counter {handle:?} to a job already signalling {MAX_SIGNAL_COUNTERS} counters"
            );
        }
        self
    }

    /// Returns the priority of the job.
    #[inline]
    pub fn get_priority(&self) -> Priority {
        self.priority
    }

    /// Returns the counter this job waits on, if any.
    #[inline]
    pub fn wait_counter(&self) -> Option<CounterHandle> {
        self.wait_counter
    }

    /// Returns the counters this job signals.
    #[inline]
    pub fn signal_counters(&self) -> &SignalCounters {
        &self.signal_counters
    }

    /// Runs the job, consuming it, and hands back the counters that must now
    /// be decremented. A panic inside the work is caught and logged so that
    /// the counters are still released.
    pub(crate) fn execute(self, worker: &Worker) -> SignalCounters {
        let JobDecl {
            work,
            signal_counters,
            ..
        } = self;
        if let Err(payload) = unwind::halt_unwinding(|| work(worker)) {
            unwind::report_panic(worker.index(), payload.as_ref());
        }
        signal_counters
    }
}

impl fmt::Debug for JobDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDecl")
            .field("priority", &self.priority)
            .field("wait_counter", &self.wait_counter)
            .field("signal_counters", &self.signal_counters)
            .finish_non_exhaustive()
    }
}
