//! One-shot completion handle shared by a submitter and the resolving worker.
//!
//! State machine: `Pending` → exactly once → `Done(Ok | Err)`. The first
//! resolution wins; later attempts are ignored and report `false`.
//! Observers may attach before or after resolution and each runs once.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use tracing::{debug, warn};

use crate::error::{catch_panic, Error, Result};

type Observer<T> = Box<dyn FnOnce(&Result<T>) + Send + 'static>;

enum State<T> {
    Pending {
        observers: Vec<Observer<T>>,
        wakers: Vec<Waker>,
    },
    Done(Arc<Result<T>>),
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // Critical sections never run user code, so a poisoned lock still
        // holds a consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, result: Result<T>) -> bool {
        let done = Arc::new(result);

        let (observers, wakers) = {
            let mut state = self.lock();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending { observers, wakers } => {
                    let taken = (std::mem::take(observers), std::mem::take(wakers));
                    *state = State::Done(Arc::clone(&done));
                    taken
                }
            }
        };

        self.ready.notify_all();
        for waker in wakers {
            waker.wake();
        }
        // Outside the lock: observers may inspect the handle themselves.
        // One panicking observer must not starve the rest or unwind into
        // the resolving worker.
        for observer in observers {
            if let Err(e) = catch_panic(|| observer(&done)) {
                warn!(error = %e, "completion observer panicked");
            }
        }
        true
    }
}

/// Eventual result of work submitted to a [`Dispatcher`](super::Dispatcher).
///
/// Cheap to clone; every clone observes the same resolution. Implements
/// [`Future`], so async callers can `.await` it and wrap it in their own
/// timeout.
pub struct CompletionHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for CompletionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for CompletionHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.shared.lock() {
            State::Pending { .. } => "pending",
            State::Done(result) if result.is_ok() => "succeeded",
            State::Done(_) => "failed",
        };
        f.debug_struct("CompletionHandle")
            .field("state", &state)
            .finish()
    }
}

/// Resolving half. Consumed by [`complete`](Completer::complete); dropping
/// it unresolved fails the handle with [`Error::Abandoned`].
pub(crate) struct Completer<T> {
    shared: Option<Arc<Shared<T>>>,
}

/// Creates a pending handle and its completer.
pub(crate) fn completion<T>() -> (Completer<T>, CompletionHandle<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::Pending {
            observers: Vec::new(),
            wakers: Vec::new(),
        }),
        ready: Condvar::new(),
    });
    (
        Completer {
            shared: Some(Arc::clone(&shared)),
        },
        CompletionHandle { shared },
    )
}

impl<T> Completer<T> {
    pub(crate) fn complete(mut self, result: Result<T>) -> bool {
        match self.shared.take() {
            Some(shared) => shared.resolve(result),
            None => false,
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            if shared.resolve(Err(Error::Abandoned)) {
                debug!("completion dropped before resolution");
            }
        }
    }
}

impl<T> CompletionHandle<T> {
    /// A handle that is already `Succeeded(value)`.
    pub fn succeeded(value: T) -> Self {
        let (completer, handle) = completion();
        completer.complete(Ok(value));
        handle
    }

    /// A handle that is already `Failed(error)`.
    pub fn failed(error: Error) -> Self {
        let (completer, handle) = completion();
        completer.complete(Err(error));
        handle
    }

    pub fn is_done(&self) -> bool {
        matches!(&*self.shared.lock(), State::Done(_))
    }

    /// True once resolved with a failure.
    pub fn is_failed(&self) -> bool {
        matches!(&*self.shared.lock(), State::Done(result) if result.is_err())
    }

    /// Runs `observer` once with the result: immediately on the calling
    /// thread when already resolved, otherwise on the resolving thread.
    pub fn on_complete<F>(&self, observer: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        let done = {
            let mut state = self.shared.lock();
            match &mut *state {
                State::Pending { observers, .. } => {
                    observers.push(Box::new(observer));
                    return;
                }
                State::Done(done) => Arc::clone(done),
            }
        };
        observer(&done);
    }
}

impl<T: Clone> CompletionHandle<T> {
    /// The result if resolved, without blocking.
    pub fn try_get(&self) -> Option<Result<T>> {
        match &*self.shared.lock() {
            State::Pending { .. } => None,
            State::Done(done) => Some((**done).clone()),
        }
    }

    /// Blocks the calling thread until resolved.
    pub fn wait(&self) -> Result<T> {
        let mut state = self.shared.lock();
        loop {
            if let State::Done(done) = &*state {
                return (**done).clone();
            }
            state = self
                .shared
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl<T: Clone> Future for CompletionHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.lock();
        match &mut *state {
            State::Done(done) => Poll::Ready((**done).clone()),
            State::Pending { wakers, .. } => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_resolves_exactly_once() {
        let (completer, handle) = completion::<u32>();
        assert!(!handle.is_done());
        assert!(completer.complete(Ok(1)));

        // A second resolution attempt through the shared state is ignored
        assert!(!handle.shared.resolve(Ok(2)));
        assert!(!handle.shared.resolve(Err(Error::Cancelled)));
        assert_eq!(handle.try_get().unwrap().unwrap(), 1);
    }

    #[test]
    fn test_observers_before_and_after() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (completer, handle) = completion::<&'static str>();

        let c = Arc::clone(&calls);
        handle.on_complete(move |r| {
            assert_eq!(r.as_ref().ok(), Some(&"done"));
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        completer.complete(Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let c = Arc::clone(&calls);
        handle.on_complete(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_observer_does_not_skip_the_rest() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (completer, handle) = completion::<u32>();

        handle.on_complete(|_| panic!("first observer"));
        let c = Arc::clone(&calls);
        handle.on_complete(move |r| {
            assert_eq!(r.as_ref().ok(), Some(&3));
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(completer.complete(Ok(3)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.wait().unwrap(), 3);
    }

    #[test]
    fn test_observer_may_read_handle() {
        let (completer, handle) = completion::<u8>();
        let inner = handle.clone();
        handle.on_complete(move |_| {
            assert!(inner.is_done());
            assert_eq!(inner.try_get().unwrap().unwrap(), 9);
        });
        completer.complete(Ok(9));
    }

    #[test]
    fn test_dropped_completer_abandons() {
        let (completer, handle) = completion::<u8>();
        drop(completer);
        assert!(handle.is_failed());
        assert!(matches!(handle.wait(), Err(Error::Abandoned)));
    }

    #[test]
    fn test_wait_across_threads() {
        let (completer, handle) = completion::<String>();
        let waiter = {
            let handle = handle.clone();
            thread::spawn(move || handle.wait())
        };
        thread::sleep(Duration::from_millis(10));
        completer.complete(Ok("late".to_string()));
        assert_eq!(waiter.join().unwrap().unwrap(), "late");
    }

    #[test]
    fn test_prebuilt_handles() {
        assert_eq!(CompletionHandle::succeeded(5).wait().unwrap(), 5);
        let failed = CompletionHandle::<u8>::failed(Error::Shutdown);
        assert!(failed.is_failed());
        assert!(matches!(failed.try_get(), Some(Err(Error::Shutdown))));
    }

    #[tokio::test]
    async fn test_await_handle() {
        let (completer, handle) = completion::<u64>();
        let task = tokio::spawn(handle.clone());
        tokio::task::yield_now().await;
        completer.complete(Ok(77));
        assert_eq!(task.await.unwrap().unwrap(), 77);
        assert_eq!(handle.await.unwrap(), 77);
    }
}
