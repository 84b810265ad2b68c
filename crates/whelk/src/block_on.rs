//! Synchronous adaptation of asynchronous host operations.
//!
//! The shell engine is strictly synchronous: when it calls back into a host
//! capability it expects the answer on the same call stack. Host
//! implementations are often async, so [`wait_for`] spawns the pending
//! operation onto the ambient tokio runtime and parks the calling thread on a
//! shared signal until it settles.
//!
//! This must only be called from a thread that is *not* driving the runtime
//! (the session runs the engine inside `spawn_blocking`, which satisfies
//! that); calling it from an async task would stall the very executor that
//! has to complete the future.

use std::future::Future;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;

/// Errors from the blocking adapter.
#[derive(Debug, Error)]
pub enum BlockError {
    /// No tokio runtime is available to drive the pending operation.
    #[error("blocking wait requires a tokio runtime")]
    Unsupported,
    /// The awaited host operation failed; the original error is re-raised.
    #[error(transparent)]
    Host(#[from] anyhow::Error),
}

enum Signal<T> {
    Pending,
    Done(T),
    Failed(anyhow::Error),
}

/// Interval between re-checks of the signal word. Bounded so the wait stays
/// portable to platforms that cannot block a thread indefinitely.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Run an asynchronous operation to completion and return its value
/// synchronously.
///
/// The future is spawned onto the current tokio runtime; the calling thread
/// parks on a condvar-guarded signal word, re-checking on a bounded interval,
/// until the operation resolves. A failed operation re-raises the captured
/// error as [`BlockError::Host`].
pub fn wait_for<T>(
    future: impl Future<Output = Result<T, anyhow::Error>> + Send + 'static,
) -> Result<T, BlockError>
where
    T: Send + 'static,
{
    let handle = tokio::runtime::Handle::try_current().map_err(|_| BlockError::Unsupported)?;

    let shared = Arc::new((Mutex::new(Signal::Pending), Condvar::new()));
    let task_shared = Arc::clone(&shared);
    handle.spawn(async move {
        let outcome = future.await;
        let (lock, cvar) = &*task_shared;
        let mut slot = lock.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = match outcome {
            Ok(value) => Signal::Done(value),
            Err(error) => Signal::Failed(error),
        };
        cvar.notify_one();
    });

    let (lock, cvar) = &*shared;
    let mut slot = lock.lock().unwrap_or_else(PoisonError::into_inner);
    loop {
        match std::mem::replace(&mut *slot, Signal::Pending) {
            Signal::Done(value) => return Ok(value),
            Signal::Failed(error) => return Err(BlockError::Host(error)),
            Signal::Pending => {
                let (next, _timed_out) = cvar
                    .wait_timeout(slot, WAIT_SLICE)
                    .unwrap_or_else(PoisonError::into_inner);
                slot = next;
            }
        }
    }
}
