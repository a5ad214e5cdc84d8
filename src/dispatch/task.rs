//! Task: one computation paired with exactly one completion sink.

use std::sync::Arc;

use tracing::warn;

use super::completion::{completion, CompletionHandle, Completer};
use super::stats::DispatcherStats;
use crate::error::{catch_panic, Error, Result};

/// Type-erased unit of work held in the admission queue.
///
/// Consumed by [`run`](Task::run); dropping it unrun fails its handle with
/// [`Error::Abandoned`].
pub(crate) struct Task {
    run: Box<dyn FnOnce() + Send + 'static>,
}

impl Task {
    /// Wraps `computation` and returns the handle it will resolve.
    pub(crate) fn new<T, F>(computation: F, stats: Arc<DispatcherStats>) -> (Task, CompletionHandle<T>)
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (completer, handle) = completion();
        let task = Task {
            run: Box::new(move || execute(computation, completer, &stats)),
        };
        (task, handle)
    }

    #[inline]
    pub(crate) fn run(self) {
        (self.run)()
    }
}

fn execute<T, F>(computation: F, completer: Completer<T>, stats: &DispatcherStats)
where
    F: FnOnce() -> Result<T>,
{
    let result = catch_panic(computation).and_then(|r| r);

    if let Err(Error::Panicked(message)) = &result {
        warn!(panic = %message, "dispatched computation panicked");
    }

    stats.record_outcome(result.is_ok());
    completer.complete(result);
}
