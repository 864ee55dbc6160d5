//! Errors surfaced when bringing up a scheduler.

use std::io;

use thiserror::Error;

/// The ways [`Scheduler::spawn`](crate::Scheduler::spawn) can fail.
///
/// A failed spawn never leaves a partially populated pool behind: any workers
/// that did start are halted and joined before the error is returned.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The pool was asked to run with zero worker threads.
    #[error("a scheduler needs at least one worker thread")]
    ZeroThreads,
    /// No thread count was given and the host's parallelism could not be detected.
    #[error("unable to detect available parallelism")]
    Parallelism(#[source] io::Error),
    /// The operating system refused to start a worker thread.
    #[error("failed to spawn worker thread {index}")]
    Thread {
        /// Index of the worker that could not be started.
        index: usize,
        /// The underlying error from the thread builder.
        #[source]
        source: io::Error,
    },
}
