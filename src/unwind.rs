//! Unwinding recovery for job functions.

use alloc::string::String;
use core::any::Any;
use core::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::thread::Result;

use tracing::error;

/// Executes `f` and captures any panic, translating that panic into an `Err`
/// result. Jobs have no error channel, so the payload is only ever reported,
/// never resumed; `f` can therefore be treated as exception safe.
#[inline(always)]
pub fn halt_unwinding<F, R>(func: F) -> Result<R>
where
    F: FnOnce() -> R,
{
    catch_unwind(AssertUnwindSafe(func))
}

/// Logs a panic that escaped a job function.
#[cold]
pub fn report_panic(worker: usize, payload: &(dyn Any + Send)) {
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>");
    error!("job panicked on worker {worker}: {message}");
}
