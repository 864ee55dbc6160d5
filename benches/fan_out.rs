//! Benchmarks for fanning work out to the pool and joining it through a
//! counter, with a rayon scope as baseline.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use divan::Bencher;
use divan::black_box;
use stagehand::JobDecl;
use stagehand::Scheduler;

// -----------------------------------------------------------------------------
// Workload

const JOBS: &[usize] = &[64, 1024, 16384];

const STAGES: usize = 4;

fn main() {
    divan::main();
}

// -----------------------------------------------------------------------------
// Benchmark

/// Submits every job in one batch, then waits for the counter to drain.
#[divan::bench(args = JOBS)]
fn batch(bencher: Bencher, jobs: usize) {
    let scheduler = Scheduler::spawn(None).unwrap();
    let counter = scheduler.get_free_counter();

    bencher.bench_local(|| {
        let total = Arc::new(AtomicUsize::new(0));
        scheduler.enqueue_jobs((0..jobs).map(|_| {
            let total = total.clone();
            JobDecl::new(move |_| {
                total.fetch_add(1, Ordering::Relaxed);
            })
            .signal(counter)
        }));
        scheduler.wait_for_idle();
        black_box(total.load(Ordering::Relaxed));
    });

    scheduler.shutdown();
}

/// Submits every job individually.
#[divan::bench(args = JOBS)]
fn single(bencher: Bencher, jobs: usize) {
    let scheduler = Scheduler::spawn(None).unwrap();
    let counter = scheduler.get_free_counter();

    bencher.bench_local(|| {
        let total = Arc::new(AtomicUsize::new(0));
        for _ in 0..jobs {
            let total = total.clone();
            scheduler.enqueue_job(
                JobDecl::new(move |_| {
                    total.fetch_add(1, Ordering::Relaxed);
                })
                .signal(counter),
            );
        }
        scheduler.wait_for_idle();
        black_box(total.load(Ordering::Relaxed));
    });

    scheduler.shutdown();
}

/// Splits the jobs over a chain of stages, each waiting on the previous one.
#[divan::bench(args = JOBS)]
fn chain(bencher: Bencher, jobs: usize) {
    let scheduler = Scheduler::spawn(None).unwrap();
    let counters: Vec<_> = (0..STAGES).map(|_| scheduler.get_free_counter()).collect();

    bencher.bench_local(|| {
        let total = Arc::new(AtomicUsize::new(0));
        for stage in 0..STAGES {
            scheduler.enqueue_jobs((0..jobs / STAGES).map(|_| {
                let total = total.clone();
                let job = JobDecl::new(move |_| {
                    total.fetch_add(1, Ordering::Relaxed);
                })
                .signal(counters[stage]);
                match stage {
                    0 => job,
                    _ => job.wait_for(counters[stage - 1]),
                }
            }));
        }
        scheduler.wait_for_idle();
        black_box(total.load(Ordering::Relaxed));
    });

    scheduler.shutdown();
}

#[divan::bench(args = JOBS)]
fn rayon(bencher: Bencher, jobs: usize) {
    let thread_pool = rayon::ThreadPoolBuilder::new().build().unwrap();

    bencher.bench_local(|| {
        let total = AtomicUsize::new(0);
        thread_pool.scope(|scope| {
            for _ in 0..jobs {
                scope.spawn(|_| {
                    total.fetch_add(1, Ordering::Relaxed);
                });
            }
        });
        black_box(total.load(Ordering::Relaxed));
    });
}
