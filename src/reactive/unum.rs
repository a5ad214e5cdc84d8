//! `Unum<T>`: an asynchronous 0-or-1 result.
//!
//! Sources are a closed set of variants: an immediate success, an immediate
//! failure, or a deferred computation that only runs on subscription.
//! Operators consume their receiver and wrap it in a new composed variant;
//! nothing runs until `subscribe`.

use std::sync::mpsc;
use std::sync::Arc;

use tracing::error;

use super::scheduler::{hand_off, Scheduler};
use super::subscription::{Subscription, Token};
use crate::dispatch::CompletionHandle;
use crate::error::{catch_panic, BoxError, Error, Result};

/// Receives the single outcome of a source.
pub(crate) type Sink<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// A composed evaluation step: run upstream, then feed `sink`.
pub(crate) type Step<T> = Box<dyn FnOnce(Arc<Token>, Sink<T>) + Send + 'static>;

enum Source<T> {
    Immediate(Result<T>),
    Deferred(Box<dyn FnOnce() -> Result<T> + Send + 'static>),
    Composed(Step<T>),
}

impl<T: Send + 'static> Source<T> {
    fn run(self, token: Arc<Token>, sink: Sink<T>) {
        match self {
            Source::Immediate(result) => {
                if token.start() {
                    sink(result);
                }
            }
            Source::Deferred(computation) => {
                // Cancelled before evaluation: the computation never runs
                if token.start() {
                    sink(catch_panic(computation).and_then(|r| r));
                }
            }
            Source::Composed(step) => step(token, sink),
        }
    }
}

/// Asynchronous single value: success, failure, or nothing if cancelled.
///
/// ```rust
/// use ordo::Unum;
///
/// let answer = Unum::from(|| 21)
///     .transform(|n| n * 2)
///     .recover_with(|_| 0)
///     .block()?;
/// assert_eq!(answer, 42);
/// # Ok::<(), ordo::Error>(())
/// ```
pub struct Unum<T> {
    source: Source<T>,
    token: Arc<Token>,
}

impl<T: Send + 'static> Unum<T> {
    fn with_source(source: Source<T>) -> Self {
        Self {
            source,
            token: Token::new(false),
        }
    }

    pub(crate) fn from_step(token: Arc<Token>, step: Step<T>) -> Self {
        Self {
            source: Source::Composed(step),
            token,
        }
    }

    fn compose<U, F>(self, step: F) -> Unum<U>
    where
        U: Send + 'static,
        F: FnOnce(Source<T>, Arc<Token>, Sink<U>) + Send + 'static,
    {
        let Unum { source, token } = self;
        Unum::from_step(token, Box::new(move |token, sink| step(source, token, sink)))
    }

    /// Deferred: `computation` runs once per subscription, at subscription.
    pub fn from<F>(computation: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self::with_source(Source::Deferred(Box::new(move || Ok(computation()))))
    }

    /// Deferred fallible computation; its error becomes the failure signal.
    pub fn from_result<E, F>(computation: F) -> Self
    where
        E: Into<BoxError>,
        F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
    {
        Self::with_source(Source::Deferred(Box::new(move || {
            computation().map_err(Error::failed)
        })))
    }

    /// Immediate success.
    pub fn just(value: T) -> Self {
        Self::with_source(Source::Immediate(Ok(value)))
    }

    /// Immediate failure.
    pub fn failure(error: impl Into<BoxError>) -> Self {
        Self::with_source(Source::Immediate(Err(Error::failed(error))))
    }

    /// Adapts a dispatcher completion handle.
    pub fn from_handle(handle: CompletionHandle<T>) -> Self
    where
        T: Clone + Sync,
    {
        Self::with_source(Source::Composed(Box::new(move |token, sink| {
            if token.start() {
                handle.on_complete(move |result| sink(result.clone()));
            }
        })))
    }

    /// Maps a success value; failures pass through untouched.
    pub fn transform<U, F>(self, map: F) -> Unum<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.compose(move |source, token, sink| {
            source.run(
                token,
                Box::new(move |result| sink(result.and_then(|v| catch_panic(|| map(v))))),
            )
        })
    }

    /// Flat-map: chains a dependent asynchronous computation.
    pub fn transform_to_unum<U, F>(self, map: F) -> Unum<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Unum<U> + Send + 'static,
    {
        self.compose(move |source, token, sink| {
            let inner_token = Arc::clone(&token);
            source.run(
                token,
                Box::new(move |result| match result.and_then(|v| catch_panic(|| map(v))) {
                    Ok(inner) => inner.continue_with(inner_token, sink),
                    Err(e) => sink(Err(e)),
                }),
            )
        })
    }

    /// Peeks at a success value.
    pub fn invoke<F>(self, consumer: F) -> Self
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.compose(move |source, token, sink| {
            source.run(
                token,
                Box::new(move |result| {
                    sink(result.and_then(|v| catch_panic(|| consumer(&v)).map(|()| v)))
                }),
            )
        })
    }

    /// Peeks at a failure.
    pub fn invoke_failure<F>(self, consumer: F) -> Self
    where
        F: FnOnce(&Error) + Send + 'static,
    {
        self.compose(move |source, token, sink| {
            source.run(
                token,
                Box::new(move |result| match result {
                    Err(e) => match catch_panic(|| consumer(&e)) {
                        Ok(()) => sink(Err(e)),
                        Err(panicked) => sink(Err(panicked)),
                    },
                    ok => sink(ok),
                }),
            )
        })
    }

    /// Replaces a failure with a computed value.
    pub fn recover_with<F>(self, fallback: F) -> Self
    where
        F: FnOnce(Error) -> T + Send + 'static,
    {
        self.compose(move |source, token, sink| {
            source.run(
                token,
                Box::new(move |result| sink(result.or_else(|e| catch_panic(|| fallback(e))))),
            )
        })
    }

    /// Replaces a failure with another asynchronous computation.
    pub fn recover_with_unum<F>(self, fallback: F) -> Self
    where
        F: FnOnce(Error) -> Unum<T> + Send + 'static,
    {
        self.compose(move |source, token, sink| {
            let inner_token = Arc::clone(&token);
            source.run(
                token,
                Box::new(move |result| match result {
                    Ok(v) => sink(Ok(v)),
                    Err(e) => match catch_panic(|| fallback(e)) {
                        Ok(inner) => inner.continue_with(inner_token, sink),
                        Err(panicked) => sink(Err(panicked)),
                    },
                }),
            )
        })
    }

    /// Evaluation and callback delivery happen on `scheduler`.
    ///
    /// A scheduler that refuses the work (e.g. a shut-down dispatcher)
    /// turns into a failure signal.
    pub fn run_on<S>(self, scheduler: Arc<S>) -> Self
    where
        S: Scheduler + ?Sized + 'static,
    {
        self.compose(move |source, token, sink| {
            hand_off(
                &*scheduler,
                (source, token, sink),
                |(source, token, sink)| source.run(token, sink),
                |(_, _, sink), error| sink(Err(error)),
            )
        })
    }

    /// Runs a nested Unum under an outer subscription's token.
    fn continue_with(self, token: Arc<Token>, sink: Sink<T>) {
        if self.token.is_cancelled() {
            sink(Err(Error::Cancelled));
        } else {
            self.source.run(token, sink);
        }
    }

    /// Triggers evaluation; `callback` receives exactly one result, or
    /// nothing if cancelled first.
    pub fn subscribe<F>(self, callback: F) -> Subscription
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let Unum { source, token } = self;
        let subscription = Subscription::new(Arc::clone(&token));
        let guard = Arc::clone(&token);

        source.run(
            token,
            Box::new(move |result| {
                if guard.terminate() && catch_panic(|| callback(result)).is_err() {
                    error!("unum subscriber panicked");
                }
            }),
        );
        subscription
    }

    /// Split-callback form of [`subscribe`](Self::subscribe).
    pub fn subscribe_with<S, F>(self, on_success: S, on_failure: F) -> Subscription
    where
        S: FnOnce(T) + Send + 'static,
        F: FnOnce(Error) + Send + 'static,
    {
        self.subscribe(move |result| match result {
            Ok(value) => on_success(value),
            Err(error) => on_failure(error),
        })
    }

    /// Subscribes and blocks the calling thread for the result.
    ///
    /// A cancelled Unum yields [`Error::Cancelled`].
    pub fn block(self) -> Result<T> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.subscribe(move |result| {
            let _ = tx.send(result);
        });
        rx.recv().unwrap_or(Err(Error::Cancelled))
    }
}

impl<T> Unum<T> {
    /// Prevents evaluation if it has not started. Returns whether it took
    /// effect.
    pub fn cancel(&self) -> bool {
        self.token.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_terminated(&self) -> bool {
        self.token.is_terminated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{ImmediateScheduler, Job, ThreadScheduler};
    use crate::Dispatcher;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;

    /// Holds jobs until the test releases them.
    #[derive(Default)]
    struct ManualScheduler {
        jobs: Mutex<Vec<Job>>,
    }

    impl ManualScheduler {
        fn run_all(&self) {
            let jobs: Vec<Job> = std::mem::take(&mut *self.jobs.lock().unwrap());
            for job in jobs {
                job();
            }
        }
    }

    impl Scheduler for ManualScheduler {
        fn schedule(&self, job: Job) -> Result<()> {
            self.jobs.lock().unwrap().push(job);
            Ok(())
        }
    }

    /// Counts terminal signals of one subscription.
    #[derive(Default)]
    struct Outcomes {
        successes: Arc<AtomicUsize>,
        failures: Arc<AtomicUsize>,
    }

    impl Outcomes {
        fn observe<T: Send + 'static>(&self, unum: Unum<T>) -> Subscription {
            let s = Arc::clone(&self.successes);
            let f = Arc::clone(&self.failures);
            unum.subscribe_with(
                move |_| {
                    s.fetch_add(1, Ordering::SeqCst);
                },
                move |_| {
                    f.fetch_add(1, Ordering::SeqCst);
                },
            )
        }

        fn counts(&self) -> (usize, usize) {
            (
                self.successes.load(Ordering::SeqCst),
                self.failures.load(Ordering::SeqCst),
            )
        }
    }

    #[test]
    fn test_just_delivers_success_once() {
        let outcomes = Outcomes::default();
        let subscription = outcomes.observe(Unum::just(5));
        assert_eq!(outcomes.counts(), (1, 0));
        assert!(subscription.is_terminated());
        assert!(!subscription.cancel());
    }

    #[test]
    fn test_failure_delivers_failure_once() {
        let outcomes = Outcomes::default();
        outcomes.observe(Unum::<u8>::failure(Error::msg("no rows")));
        assert_eq!(outcomes.counts(), (0, 1));
    }

    #[test]
    fn test_deferred_runs_only_on_subscribe() {
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        let unum = Unum::from(move || r.store(true, Ordering::SeqCst));
        assert!(!ran.load(Ordering::SeqCst));

        unum.block().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancel_before_subscribe_prevents_execution() {
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        let unum = Unum::from(move || r.store(true, Ordering::SeqCst)).transform(|()| 1);

        assert!(unum.cancel());
        assert!(unum.is_cancelled());

        let outcomes = Outcomes::default();
        outcomes.observe(unum);
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(outcomes.counts(), (0, 0));
    }

    #[test]
    fn test_cancel_after_scheduling_before_evaluation() {
        let scheduler = Arc::new(ManualScheduler::default());
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);

        let outcomes = Outcomes::default();
        let subscription = outcomes.observe(
            Unum::from(move || r.store(true, Ordering::SeqCst)).run_on(Arc::clone(&scheduler)),
        );

        assert!(subscription.cancel());
        scheduler.run_all();

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(outcomes.counts(), (0, 0));
        assert!(subscription.is_cancelled());
    }

    #[test]
    fn test_cancel_while_running_is_refused() {
        let scheduler = Arc::new(ManualScheduler::default());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::default();
        let refused = Arc::new(AtomicBool::new(false));

        let (s, r) = (Arc::clone(&slot), Arc::clone(&refused));
        let outcomes = Outcomes::default();
        let subscription = outcomes.observe(
            Unum::from(move || {
                let subscription = s.lock().unwrap().clone().unwrap();
                r.store(!subscription.cancel(), Ordering::SeqCst);
            })
            .run_on(Arc::clone(&scheduler)),
        );
        *slot.lock().unwrap() = Some(subscription);
        scheduler.run_all();

        assert!(refused.load(Ordering::SeqCst));
        assert_eq!(outcomes.counts(), (1, 0));
    }

    #[test]
    fn test_transform_skips_failures() {
        let mapped = Arc::new(AtomicBool::new(false));
        let m = Arc::clone(&mapped);
        let result = Unum::<u32>::failure(Error::msg("timeout"))
            .transform(move |v| {
                m.store(true, Ordering::SeqCst);
                v + 1
            })
            .block();

        assert_eq!(result.unwrap_err().to_string(), "timeout");
        assert!(!mapped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_transform_to_unum_flattens_async_inner() {
        let result = Unum::just(3)
            .transform_to_unum(|n| {
                Unum::from(move || n * 10).run_on(Arc::new(ThreadScheduler::new("inner")))
            })
            .transform(|n| n + 1)
            .block();
        assert_eq!(result.unwrap(), 31);
    }

    #[test]
    fn test_invoke_peeks_without_changing() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        let value = Unum::just(8usize)
            .invoke(move |v| s.store(*v, Ordering::SeqCst))
            .block()
            .unwrap();
        assert_eq!(value, 8);
        assert_eq!(seen.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_invoke_failure_and_recover() {
        let seen = Arc::new(Mutex::new(String::new()));
        let s = Arc::clone(&seen);
        let value = Unum::<String>::failure(Error::msg("deadlock detected"))
            .invoke_failure(move |e| *s.lock().unwrap() = e.to_string())
            .recover_with(|e| format!("recovered from {e}"))
            .block()
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), "deadlock detected");
        assert_eq!(value, "recovered from deadlock detected");
    }

    #[test]
    fn test_recover_with_unum() {
        let value = Unum::<u8>::from_result(|| Err("primary down"))
            .recover_with_unum(|_| Unum::from(|| 2).run_on(Arc::new(ImmediateScheduler)))
            .block()
            .unwrap();
        assert_eq!(value, 2);

        // Success bypasses the fallback
        let value = Unum::just(1u8)
            .recover_with_unum(|_| Unum::just(2))
            .block()
            .unwrap();
        assert_eq!(value, 1);
    }

    #[test]
    fn test_panics_become_failures() {
        let err = Unum::just(1u8)
            .transform(|_| -> u8 { panic!("bad cast") })
            .block()
            .unwrap_err();
        assert!(matches!(err, Error::Panicked(m) if m == "bad cast"));
    }

    #[test]
    fn test_chains_deliver_exactly_one_terminal() {
        let chains: Vec<Unum<i32>> = vec![
            Unum::just(1).transform(|v| v + 1),
            Unum::failure(Error::msg("x")).transform(|v: i32| v + 1),
            Unum::failure(Error::msg("x")).recover_with(|_| 0),
            Unum::just(1).transform(|_| -> i32 { panic!("p") }).recover_with(|_| 0),
            Unum::just(1).transform_to_unum(|_| Unum::<i32>::failure(Error::msg("y"))),
            Unum::from(|| 4).invoke(|_| panic!("peek")).invoke_failure(|_| {}),
        ];

        for chain in chains {
            let outcomes = Outcomes::default();
            outcomes.observe(chain);
            let (ok, failed) = outcomes.counts();
            assert_eq!(ok + failed, 1);
        }
    }

    #[test]
    fn test_run_on_dispatcher_thread() {
        let dispatcher = Arc::new(Dispatcher::with_capacity(64).unwrap());
        let name = Unum::from(|| thread::current().name().map(str::to_owned))
            .run_on(Arc::clone(&dispatcher))
            .block()
            .unwrap();
        assert_eq!(name.as_deref(), Some("ordo-worker"));
    }

    #[test]
    fn test_run_on_shut_down_dispatcher_fails() {
        let dispatcher = Arc::new(Dispatcher::with_capacity(64).unwrap());
        dispatcher.shutdown();

        let err = Unum::just(1).run_on(dispatcher).block().unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }

    #[test]
    fn test_from_handle() {
        let dispatcher = Dispatcher::with_capacity(64).unwrap();
        let handle = dispatcher.execute(|| vec![1, 2, 3]);
        let total: i32 = Unum::from_handle(handle)
            .transform(|rows| rows.iter().sum())
            .block()
            .unwrap();
        assert_eq!(total, 6);
    }

    #[test]
    fn test_block_on_cancelled() {
        let unum = Unum::just(1);
        unum.cancel();
        assert!(matches!(unum.block(), Err(Error::Cancelled)));
    }
}
