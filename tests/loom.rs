//! Tests using the `loom` testing framework.

#![cfg(loom)]

use loom::model::Builder;
use loom::sync::Arc;
use loom::sync::atomic::AtomicUsize;
use loom::sync::atomic::Ordering;
use tracing::{Level, info};
use tracing_subscriber::fmt::Subscriber;

use stagehand::JobDecl;
use stagehand::Scheduler;

fn model<F>(f: F)
where
    F: Fn() + Send + Sync + 'static,
{
    let subscriber = Subscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .without_time()
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let mut model = Builder::new();
        model.log = true;
        model.check(f);
    });
}

// Spins a single worker up and back down.
#[test]
pub fn spawn_and_shutdown() {
    model(|| {
        let scheduler = Scheduler::spawn(Some(1)).unwrap();
        info!("### SHUTTING DOWN");
        scheduler.shutdown();
    });
}

// A dependent job must observe the side effect of the job it waits on, no
// matter how its submission interleaves with that job's completion.
#[test]
pub fn wait_counter_orders_jobs() {
    model(|| {
        let scheduler = Scheduler::spawn(Some(1)).unwrap();
        let counter = scheduler.get_free_counter();
        let value = Arc::new(AtomicUsize::new(0));

        let first = value.clone();
        scheduler.enqueue_job(
            JobDecl::new(move |_| {
                first.store(1, Ordering::Release);
            })
            .signal(counter),
        );

        let second = value.clone();
        scheduler.enqueue_job(
            JobDecl::new(move |_| {
                assert_eq!(second.load(Ordering::Acquire), 1);
                second.store(2, Ordering::Release);
            })
            .wait_for(counter),
        );

        scheduler.shutdown();
        assert_eq!(value.load(Ordering::Acquire), 2);
        assert_eq!(scheduler.counter_value(counter), 0);
    });
}

// A zero crossing on one worker must release a job parked by a producer
// racing against it on another.
#[test]
pub fn batch_release_across_workers() {
    model(|| {
        let scheduler = Scheduler::spawn(Some(2)).unwrap();
        let counter = scheduler.get_free_counter();
        let runs = Arc::new(AtomicUsize::new(0));

        let jobs = (0..2).map(|_| {
            let runs = runs.clone();
            JobDecl::new(move |_| {
                runs.fetch_add(1, Ordering::AcqRel);
            })
            .signal(counter)
        });
        scheduler.enqueue_jobs(jobs);

        let observed = Arc::new(AtomicUsize::new(usize::MAX));
        let dependent = runs.clone();
        let seen = observed.clone();
        scheduler.enqueue_job(
            JobDecl::new(move |_| {
                seen.store(dependent.load(Ordering::Acquire), Ordering::Release);
            })
            .wait_for(counter),
        );

        scheduler.shutdown();
        assert_eq!(observed.load(Ordering::Acquire), 2);
    });
}
