//! This module contains the api and worker logic for the scheduler.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::Cell;
use core::fmt;
use core::mem;
use core::num::NonZero;
use core::ptr;

use tracing::debug;
use tracing::trace;
use tracing::trace_span;
use tracing::warn;

use crate::counter::CounterHandle;
use crate::counter::CounterTable;
use crate::error::SpawnError;
use crate::idle::PendingJobs;
use crate::job::JobDecl;
use crate::job::SignalCounters;
use crate::platform::*;
use crate::queue::JobQueue;
use crate::util::QueuePicker;

// -----------------------------------------------------------------------------
// Thread locals

thread_local! {
    /// Each producer thread picks queues with its own generator.
    static RNG: QueuePicker = QueuePicker::new();
    /// The id of the scheduler this thread works for, or zero.
    static CURRENT_SCHEDULER: Cell<usize> = Cell::new(0);
}

// -----------------------------------------------------------------------------
// Scheduler types

/// The `Scheduler` owns a fixed pool of worker threads, one job queue per
/// worker, and the table of dependency counters jobs coordinate through. It is
/// the main entry point to this crate.
///
/// # Creating a scheduler
///
/// Schedulers are always shared: [`Scheduler::spawn`] (or
/// [`SchedulerBuilder::spawn`]) returns an `Arc<Scheduler>`, and every job
/// receives a [`Worker`] through which it can reach the same scheduler to
/// submit more work.
///
/// ```
/// # #![cfg(not(loom))]
/// use stagehand::{JobDecl, Priority, Scheduler};
///
/// let scheduler = Scheduler::builder().thread_count(2).spawn().unwrap();
/// scheduler.enqueue_job(JobDecl::new(|worker| {
///     // Jobs can fan out further work from inside the pool.
///     worker.enqueue_job(JobDecl::new(|_| {}).priority(Priority::High));
/// }));
/// scheduler.shutdown();
/// ```
///
/// # Shutting down
///
/// Worker threads live until [`Scheduler::shutdown`] is called. Shutdown waits
/// for queued and running work to drain, then halts and joins every worker.
/// Each worker holds a reference to the scheduler, so a scheduler that is
/// never shut down is never dropped.
pub struct Scheduler {
    queues: Box<[JobQueue]>,
    counters: CounterTable,
    pending: PendingJobs,
    halt: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Configures and spawns a [`Scheduler`].
///
/// There is no other configuration surface: no environment variables and no
/// config files.
#[derive(Default)]
pub struct SchedulerBuilder {
    thread_count: Option<usize>,
    thread_name: Option<Box<dyn Fn(usize) -> String>>,
    stack_size: Option<usize>,
}

impl SchedulerBuilder {
    /// Creates a builder with the default settings: one worker per available
    /// core, named `worker {index}`, with the platform's default stack size.
    pub fn new() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    /// Sets the number of worker threads.
    pub fn thread_count(mut self, thread_count: usize) -> SchedulerBuilder {
        self.thread_count = Some(thread_count);
        self
    }

    /// Sets how worker threads are named, given their index.
    pub fn thread_name<F>(mut self, thread_name: F) -> SchedulerBuilder
    where
        F: Fn(usize) -> String + 'static,
    {
        self.thread_name = Some(Box::new(thread_name));
        self
    }

    /// Sets the stack size of worker threads, in bytes.
    pub fn stack_size(mut self, stack_size: usize) -> SchedulerBuilder {
        self.stack_size = Some(stack_size);
        self
    }

    /// Spawns the worker threads and returns the running scheduler.
    ///
    /// If any worker fails to start, the workers that did start are halted
    /// and joined before the error is returned.
    #[cold]
    pub fn spawn(self) -> Result<Arc<Scheduler>, SpawnError> {
        let thread_count = match self.thread_count {
            Some(0) => return Err(SpawnError::ZeroThreads),
            Some(thread_count) => thread_count,
            None => available_parallelism()
                .map(NonZero::get)
                .map_err(SpawnError::Parallelism)?,
        };

        debug!("spawning scheduler with {} worker(s)", thread_count);

        let scheduler = Arc::new(Scheduler {
            queues: (0..thread_count).map(|_| JobQueue::new()).collect(),
            counters: CounterTable::new(),
            pending: PendingJobs::new(),
            halt: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(thread_count);
        for index in 0..thread_count {
            let name = match &self.thread_name {
                Some(thread_name) => thread_name(index),
                None => format!("worker {index}"),
            };
            let mut builder = ThreadBuilder::new().name(name);
            if let Some(stack_size) = self.stack_size {
                builder = builder.stack_size(stack_size);
            }

            let worker = Worker {
                scheduler: scheduler.clone(),
                index,
            };
            match builder.spawn(move || managed_worker(worker)) {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    debug!("worker {index} failed to spawn, halting scheduler");
                    scheduler.halt_workers(handles);
                    return Err(SpawnError::Thread { index, source });
                }
            }
        }

        *scheduler.threads.lock().unwrap() = handles;

        debug!("scheduler spawned");
        Ok(scheduler)
    }
}

impl fmt::Debug for SchedulerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("thread_count", &self.thread_count)
            .field("stack_size", &self.stack_size)
            .finish_non_exhaustive()
    }
}

// -----------------------------------------------------------------------------
// Scheduler lifecycle

impl Scheduler {
    /// Spawns a scheduler with `thread_count` workers, or one per available
    /// core when `None`.
    ///
    /// See [`SchedulerBuilder`] for more options.
    pub fn spawn(thread_count: Option<usize>) -> Result<Arc<Scheduler>, SpawnError> {
        let builder = match thread_count {
            Some(thread_count) => SchedulerBuilder::new().thread_count(thread_count),
            None => SchedulerBuilder::new(),
        };
        builder.spawn()
    }

    /// Returns a builder for configuring a new scheduler.
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    /// Waits for queued and running work to drain, then halts and joins every
    /// worker thread. Calling this again afterwards does nothing.
    ///
    /// Jobs still parked on a wait-list when the scheduler drains can never be
    /// released, and are dropped with the scheduler without running.
    ///
    /// # Panics
    ///
    /// Panics if called from one of this scheduler's own workers.
    #[cold]
    pub fn shutdown(&self) {
        assert!(
            !self.on_worker_thread(),
            "attempt to shut down a scheduler from one of its own workers"
        );

        let handles = mem::take(&mut *self.threads.lock().unwrap());
        if handles.is_empty() {
            debug!("scheduler already shut down");
            return;
        }

        debug!("draining scheduler");
        self.pending.wait_until_idle();
        self.halt_workers(handles);
        debug!("scheduler shut down");
    }

    /// Blocks until no job is queued or running.
    ///
    /// This is only meaningful when no other thread is submitting work at the
    /// same time: a concurrent producer can make the scheduler busy again the
    /// moment this returns. Jobs parked on wait-lists do not keep the
    /// scheduler busy.
    ///
    /// # Panics
    ///
    /// Panics if called from one of this scheduler's own workers, since the
    /// calling job itself would never finish.
    pub fn wait_for_idle(&self) {
        assert!(
            !self.on_worker_thread(),
            "attempt to wait for a scheduler to go idle from one of its own workers"
        );
        self.pending.wait_until_idle();
    }

    /// Raises the halt flag, wakes every worker so it sees it, and joins them.
    fn halt_workers(&self, handles: Vec<JoinHandle<()>>) {
        self.halt.store(true, Ordering::Release);
        for queue in self.queues.iter() {
            queue.wake_for_halt();
        }
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Returns an opaque identifier for this scheduler.
    #[inline(always)]
    fn id(&self) -> usize {
        ptr::from_ref(self) as usize
    }

    /// Returns true if the calling thread is one of this scheduler's workers.
    fn on_worker_thread(&self) -> bool {
        CURRENT_SCHEDULER.with(Cell::get) == self.id()
    }

    /// The number of worker threads, fixed when the scheduler was spawned.
    pub fn thread_count(&self) -> usize {
        self.queues.len()
    }
}

// -----------------------------------------------------------------------------
// Counter management api

impl Scheduler {
    /// Allocates an anonymous counter with a count of zero. Freed handles are
    /// recycled before the table grows.
    pub fn get_free_counter(&self) -> CounterHandle {
        self.counters.get_free_counter()
    }

    /// Returns the counter registered under `name`, creating it on first use.
    /// Every call with the same name returns the same handle until that
    /// counter is freed, even when racing from several threads.
    pub fn get_counter_by_id(&self, name: &str) -> CounterHandle {
        self.counters.get_counter_by_id(name)
    }

    /// Releases a counter for reuse. Every outstanding copy of `handle` goes
    /// stale, and using one afterwards panics.
    ///
    /// No job may still signal or wait on the counter. Jobs parked on it can
    /// never be released, so they are dropped without running.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is out of range or was already freed.
    pub fn free_counter(&self, handle: CounterHandle) {
        self.counters.free_counter(handle);
    }

    /// The number of submitted-but-not-completed jobs signalling the counter.
    pub fn counter_value(&self, handle: CounterHandle) -> u32 {
        self.counters.count(handle)
    }

    /// The number of jobs parked waiting for the counter to reach zero.
    pub fn parked_jobs(&self, handle: CounterHandle) -> usize {
        self.counters.parked(handle)
    }
}

// -----------------------------------------------------------------------------
// Scheduling api

impl Scheduler {
    /// Submits a single job.
    ///
    /// If the job has a wait counter on which anything other than the job
    /// itself is outstanding, the job is parked on that counter and queued
    /// once it reaches zero; otherwise it is pushed onto a randomly chosen
    /// worker queue. Either way its signal counters are incremented before it
    /// can run.
    pub fn enqueue_job(&self, job: JobDecl) {
        self.warn_if_halted();

        for handle in job.signal_counters().iter() {
            self.counters.increment(handle, 1);
        }

        let job = match job.wait_counter() {
            Some(handle) => {
                let own = job.signal_counters().iter().filter(|&h| h == handle).count() as u32;
                match self.counters.park_one_unless_zero(handle, job, own) {
                    Some(job) => job,
                    None => return,
                }
            }
            None => job,
        };

        self.pending.add(1);
        let index = RNG.with(|rng| rng.pick(self.queues.len()));
        trace!("queueing job on worker {index}");
        self.queues[index].push(job);
    }

    /// Submits a batch of jobs.
    ///
    /// The outcome is the same as calling [`Scheduler::enqueue_job`] for each
    /// job in order: a job never waits on signals from declarations that come
    /// after it in the batch. Signal increments are summed per counter, each
    /// distinct wait counter is locked once, and the ready jobs are spread
    /// round-robin over the workers starting from a random one.
    pub fn enqueue_jobs<I>(&self, jobs: I)
    where
        I: IntoIterator<Item = JobDecl>,
    {
        self.warn_if_halted();
        self.dispatch(jobs.into_iter().collect(), false);
    }

    /// The shared dispatch path. With `ignore_signals` set (for jobs released
    /// from a wait-list, whose signals were counted when first submitted)
    /// the increment step is skipped.
    fn dispatch(&self, jobs: Vec<JobDecl>, ignore_signals: bool) {
        if jobs.is_empty() {
            return;
        }

        // Walking backwards, `later` holds what each job and everything after
        // it adds to every counter. That share is excluded from the job's own
        // wait check, and once the walk ends it is the total to increment.
        let mut own = vec![0; jobs.len()];
        if !ignore_signals {
            let mut later: BTreeMap<CounterHandle, u32> = BTreeMap::new();
            for (index, job) in jobs.iter().enumerate().rev() {
                for handle in job.signal_counters().iter() {
                    *later.entry(handle).or_default() += 1;
                }
                if let Some(handle) = job.wait_counter() {
                    own[index] = later.get(&handle).copied().unwrap_or(0);
                }
            }
            for (handle, by) in later {
                self.counters.increment(handle, by);
            }
        }

        let mut ready = Vec::with_capacity(jobs.len());
        let mut waiting: BTreeMap<CounterHandle, Vec<(JobDecl, u32)>> = BTreeMap::new();
        for (job, own) in jobs.into_iter().zip(own) {
            match job.wait_counter() {
                Some(handle) => waiting.entry(handle).or_default().push((job, own)),
                None => ready.push(job),
            }
        }
        for (handle, group) in waiting {
            ready.extend(self.counters.park_unless_zero(handle, group));
        }

        self.distribute(ready);
    }

    /// Spreads ready jobs over the queues. With `n` jobs and `t` workers each
    /// queue receives `n / t` jobs, and the `n % t` queues following the
    /// randomly chosen start receive one more.
    fn distribute(&self, ready: Vec<JobDecl>) {
        if ready.is_empty() {
            return;
        }

        let thread_count = self.queues.len();
        let start = RNG.with(|rng| rng.pick(thread_count));
        trace!(
            "distributing {} job(s) from worker {start}",
            ready.len()
        );

        let per_queue = ready.len() / thread_count + 1;
        let mut batches: Vec<Vec<JobDecl>> = (0..thread_count)
            .map(|_| Vec::with_capacity(per_queue))
            .collect();

        self.pending.add(ready.len());
        for (offset, job) in ready.into_iter().enumerate() {
            batches[(start + offset) % thread_count].push(job);
        }
        for (queue, batch) in self.queues.iter().zip(batches) {
            if !batch.is_empty() {
                queue.push_batch(batch);
            }
        }
    }

    /// Completion bookkeeping for a job that has just run: decrements its
    /// signal counters and dispatches any jobs that released. Released jobs
    /// are collected first and dispatched in one pass, so long chains never
    /// recurse.
    fn complete(&self, signals: SignalCounters) {
        let mut released = Vec::new();
        for handle in signals.iter() {
            released.append(&mut self.counters.decrement(handle));
        }

        if !released.is_empty() {
            trace!("releasing {} parked job(s)", released.len());
            self.dispatch(released, true);
        }

        // Only now can this job stop counting as pending, since everything it
        // released is already queued or parked.
        self.pending.complete();
    }

    fn warn_if_halted(&self) {
        if self.halt.load(Ordering::Relaxed) {
            warn!("job submitted to a scheduler that has shut down; it will never run");
        }
    }
}

// -----------------------------------------------------------------------------
// Worker

/// The context handed to every job function: which worker is running it, and
/// the scheduler it belongs to.
pub struct Worker {
    scheduler: Arc<Scheduler>,
    index: usize,
}

impl Worker {
    /// The index of the worker thread, in `0..thread_count`.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The scheduler this worker belongs to. Clone the `Arc` to keep it
    /// around beyond the job.
    #[inline]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Submits a job to this worker's scheduler.
    ///
    /// See also: [`Scheduler::enqueue_job`].
    #[inline]
    pub fn enqueue_job(&self, job: JobDecl) {
        self.scheduler.enqueue_job(job);
    }

    /// Submits a batch of jobs to this worker's scheduler.
    ///
    /// See also: [`Scheduler::enqueue_jobs`].
    #[inline]
    pub fn enqueue_jobs<I>(&self, jobs: I)
    where
        I: IntoIterator<Item = JobDecl>,
    {
        self.scheduler.enqueue_jobs(jobs);
    }
}

// -----------------------------------------------------------------------------
// Main worker loop

/// This is the main loop for a worker thread. The worker sleeps on its own
/// queue, runs the highest-priority job it finds there, and then performs the
/// completion bookkeeping for it. It never takes work from other queues.
fn managed_worker(worker: Worker) {
    let span = trace_span!("worker", index = worker.index);
    let _enter = span.enter();

    trace!("starting worker");

    let scheduler = &*worker.scheduler;
    CURRENT_SCHEDULER.with(|current| current.set(scheduler.id()));

    let queue = &scheduler.queues[worker.index];
    while let Some(job) = queue.wait_for_job(&scheduler.halt) {
        let signals = job.execute(&worker);
        scheduler.complete(signals);
    }

    CURRENT_SCHEDULER.with(|current| current.set(0));

    trace!("exiting worker");
}

#[cfg(all(test, not(loom)))]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn zero_threads_is_an_error() {
        assert!(matches!(
            Scheduler::spawn(Some(0)),
            Err(SpawnError::ZeroThreads)
        ));
    }

    #[test]
    fn builder_names_threads() {
        let scheduler = Scheduler::builder()
            .thread_count(2)
            .thread_name(|index| format!("render {index}"))
            .stack_size(256 * 1024)
            .spawn()
            .unwrap();
        assert_eq!(scheduler.thread_count(), 2);

        let (tx, rx) = mpsc::channel();
        scheduler.enqueue_job(JobDecl::new(move |worker| {
            let name = std::thread::current().name().map(String::from);
            tx.send((worker.index(), name)).unwrap();
        }));
        let (index, name) = rx.recv().unwrap();
        assert_eq!(name, Some(format!("render {index}")));
        scheduler.shutdown();
    }

    #[test]
    fn batches_are_spread_evenly() {
        let scheduler = Scheduler::spawn(Some(3)).unwrap();
        let gate = scheduler.get_free_counter();
        let (release, blocked) = mpsc::channel::<()>();
        let blocked = std::sync::Mutex::new(blocked);

        // Park a blocker on every worker so nothing drains while we count.
        let (started_tx, started_rx) = mpsc::channel();
        let blocked = Arc::new(blocked);
        let mut blockers = Vec::new();
        for _ in 0..3 {
            let blocked = blocked.clone();
            let started_tx = started_tx.clone();
            blockers.push(
                JobDecl::new(move |_| {
                    started_tx.send(()).unwrap();
                    let _ = blocked.lock().unwrap().recv();
                })
                .signal(gate),
            );
        }
        scheduler.enqueue_jobs(blockers);
        for _ in 0..3 {
            started_rx.recv().unwrap();
        }

        scheduler.enqueue_jobs((0..10).map(|_| JobDecl::new(|_| {})));
        let mut lengths: Vec<usize> = scheduler.queues.iter().map(JobQueue::len).collect();
        lengths.sort_unstable();
        assert_eq!(lengths, vec![3, 3, 4]);

        for _ in 0..3 {
            release.send(()).unwrap();
        }
        scheduler.shutdown();
        assert_eq!(scheduler.counter_value(gate), 0);
    }

    #[test]
    fn released_jobs_do_not_recount_signals() {
        let scheduler = Scheduler::spawn(Some(2)).unwrap();
        let first = scheduler.get_free_counter();
        let second = scheduler.get_free_counter();
        let runs = Arc::new(AtomicUsize::new(0));

        let (release, blocked) = mpsc::channel::<()>();
        scheduler.enqueue_job(
            JobDecl::new(move |_| {
                let _ = blocked.recv();
            })
            .signal(first),
        );
        let counted = runs.clone();
        scheduler.enqueue_job(
            JobDecl::new(move |_| {
                counted.fetch_add(1, Ordering::Relaxed);
            })
            .wait_for(first)
            .signal(second),
        );

        assert_eq!(scheduler.counter_value(second), 1);
        assert_eq!(scheduler.parked_jobs(first), 1);

        release.send(()).unwrap();
        scheduler.wait_for_idle();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert_eq!(scheduler.counter_value(first), 0);
        assert_eq!(scheduler.counter_value(second), 0);
        assert_eq!(scheduler.parked_jobs(first), 0);
        scheduler.shutdown();
    }

    /// Poses as one of the scheduler's workers until dropped, then shuts the
    /// scheduler down from the test thread.
    struct PoseAsWorker(Arc<Scheduler>);

    impl PoseAsWorker {
        fn new(scheduler: Arc<Scheduler>) -> PoseAsWorker {
            CURRENT_SCHEDULER.with(|current| current.set(scheduler.id()));
            PoseAsWorker(scheduler)
        }
    }

    impl Drop for PoseAsWorker {
        fn drop(&mut self) {
            CURRENT_SCHEDULER.with(|current| current.set(0));
            self.0.shutdown();
        }
    }

    #[test]
    #[should_panic(expected = "from one of its own workers")]
    fn waiting_from_a_worker_panics() {
        let worker = PoseAsWorker::new(Scheduler::spawn(Some(1)).unwrap());
        worker.0.wait_for_idle();
    }

    #[test]
    #[should_panic(expected = "from one of its own workers")]
    fn shutting_down_from_a_worker_panics() {
        let worker = PoseAsWorker::new(Scheduler::spawn(Some(1)).unwrap());
        worker.0.shutdown();
    }

    #[test]
    fn posing_worker_shuts_the_scheduler_down() {
        let scheduler = Scheduler::spawn(Some(1)).unwrap();
        drop(PoseAsWorker::new(scheduler.clone()));
        assert!(scheduler.threads.lock().unwrap().is_empty());
        assert!(scheduler.halt.load(Ordering::Acquire));
    }
}
