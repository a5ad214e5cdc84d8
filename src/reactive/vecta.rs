//! `Vecta<T>`: an asynchronous stream of 0..n items.
//!
//! Signals reach a subscriber in the order `on_subscribe`, any number of
//! `on_next`, then at most one of `on_error` / `on_complete`. Every stage
//! reports whether to keep going, so a downstream stop (cancel, `take`, `first`)
//! propagates upstream and a generator learns it can quit early.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::error;

use super::scheduler::{hand_off, Scheduler};
use super::subscription::{Subscription, Token};
use super::unum::Unum;
use crate::error::{catch_panic, BoxError, Error, Result};

enum Signal<T> {
    Next(T),
    Error(Error),
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

type Downstream<T> = Box<dyn FnMut(Signal<T>) -> Flow + Send + 'static>;
type Step<T> = Box<dyn FnOnce(Arc<Token>, Downstream<T>) + Send + 'static>;
type Generator<T> = Box<dyn FnOnce(&mut Emitter<T>) -> Result<()> + Send + 'static>;

/// Downstream wrapper that swallows everything after the first stop.
struct Outlet<T> {
    down: Downstream<T>,
    done: bool,
}

impl<T> Outlet<T> {
    fn new(down: Downstream<T>) -> Self {
        Self { down, done: false }
    }

    fn next(&mut self, item: T) -> Flow {
        if self.done {
            return Flow::Stop;
        }
        let flow = (self.down)(Signal::Next(item));
        if flow == Flow::Stop {
            self.done = true;
        }
        flow
    }

    fn error(&mut self, error: Error) -> Flow {
        self.finish(Signal::Error(error))
    }

    fn complete(&mut self) -> Flow {
        self.finish(Signal::Complete)
    }

    fn finish(&mut self, signal: Signal<T>) -> Flow {
        if !self.done {
            self.done = true;
            (self.down)(signal);
        }
        Flow::Stop
    }

    fn signal(&mut self, signal: Signal<T>) -> Flow {
        match signal {
            Signal::Next(item) => self.next(item),
            terminal => self.finish(terminal),
        }
    }
}

fn lock<T>(outlet: &Mutex<Outlet<T>>) -> MutexGuard<'_, Outlet<T>> {
    outlet.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Push side handed to a [`Vecta::from_generator`] closure.
pub struct Emitter<T> {
    outlet: Outlet<T>,
    token: Arc<Token>,
}

impl<T> Emitter<T> {
    /// Pushes one item. Returns `false` once the subscriber no longer
    /// wants items; the generator should return at that point.
    pub fn emit(&mut self, item: T) -> bool {
        if !self.token.is_live() {
            self.outlet.done = true;
            return false;
        }
        self.outlet.next(item) == Flow::Continue
    }

    pub fn is_stopped(&self) -> bool {
        self.outlet.done || !self.token.is_live()
    }
}

enum Stream<T> {
    Iter(Box<dyn Iterator<Item = T> + Send + 'static>),
    Failure(Error),
    Deferred(Generator<T>),
    Composed(Step<T>),
}

impl<T: Send + 'static> Stream<T> {
    fn run(self, token: Arc<Token>, down: Downstream<T>) {
        match self {
            Stream::Iter(mut items) => {
                if !token.start() {
                    return;
                }
                let mut outlet = Outlet::new(down);
                // Cancellation is observed between items
                while token.is_live() {
                    match catch_panic(|| items.next()) {
                        Ok(Some(item)) => {
                            if outlet.next(item) == Flow::Stop {
                                return;
                            }
                        }
                        Ok(None) => {
                            outlet.complete();
                            return;
                        }
                        Err(e) => {
                            outlet.error(e);
                            return;
                        }
                    }
                }
            }
            Stream::Failure(error) => {
                if token.start() {
                    Outlet::new(down).error(error);
                }
            }
            Stream::Deferred(generator) => {
                if !token.start() {
                    return;
                }
                let mut emitter = Emitter {
                    outlet: Outlet::new(down),
                    token,
                };
                match catch_panic(|| generator(&mut emitter)).and_then(|r| r) {
                    Ok(()) => emitter.outlet.complete(),
                    Err(e) => emitter.outlet.error(e),
                };
            }
            Stream::Composed(step) => step(token, down),
        }
    }
}

struct ConcatState<U> {
    pending: VecDeque<Vecta<U>>,
    // An inner stream has started and not yet finished
    active: bool,
    // Some thread is inside `drain`
    draining: bool,
    upstream_done: bool,
    stopped: bool,
}

/// Sequencer behind [`Vecta::transform_to_vecta`].
///
/// At most one inner stream runs at a time. Whoever finds the sequencer
/// idle claims `draining` and starts queued inner streams until one of
/// them is still running when its `run` returns; that stream's completion
/// picks the loop up again, on whatever thread it completes on. Inner
/// streams that finish synchronously therefore never recurse.
struct Concat<U> {
    state: Mutex<ConcatState<U>>,
    outlet: Mutex<Outlet<U>>,
    token: Arc<Token>,
}

impl<U: Send + 'static> Concat<U> {
    fn new(token: Arc<Token>, down: Downstream<U>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ConcatState {
                pending: VecDeque::new(),
                active: false,
                draining: false,
                upstream_done: false,
                stopped: false,
            }),
            outlet: Mutex::new(Outlet::new(down)),
            token,
        })
    }

    fn state(&self) -> MutexGuard<'_, ConcatState<U>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `update` under the lock and claims the drain loop if nobody
    /// holds it.
    fn claim(&self, update: impl FnOnce(&mut ConcatState<U>)) -> bool {
        let mut state = self.state();
        update(&mut *state);
        if state.draining || state.stopped {
            return false;
        }
        state.draining = true;
        true
    }

    fn push(self: &Arc<Self>, inner: Vecta<U>) -> Flow {
        if self.claim(|state| {
            if !state.stopped {
                state.pending.push_back(inner);
            }
        }) {
            self.drain();
        }
        if self.state().stopped {
            Flow::Stop
        } else {
            Flow::Continue
        }
    }

    fn upstream_complete(self: &Arc<Self>) -> Flow {
        if self.claim(|state| state.upstream_done = true) {
            self.drain();
        }
        Flow::Stop
    }

    fn inner_complete(self: &Arc<Self>) {
        if self.claim(|state| state.active = false) {
            self.drain();
        }
    }

    fn stop(&self) {
        let mut state = self.state();
        state.stopped = true;
        state.pending.clear();
    }

    fn fail(&self, error: Error) -> Flow {
        self.stop();
        lock(&self.outlet).error(error)
    }

    fn drain(self: &Arc<Self>) {
        loop {
            let inner = {
                let mut state = self.state();
                if state.active || state.stopped {
                    state.draining = false;
                    return;
                }
                let next = state.pending.pop_front();
                match next {
                    Some(inner) => {
                        state.active = true;
                        inner
                    }
                    None => {
                        state.draining = false;
                        if !state.upstream_done {
                            return;
                        }
                        state.stopped = true;
                        drop(state);
                        lock(&self.outlet).complete();
                        return;
                    }
                }
            };
            self.start(inner);
        }
    }

    fn start(self: &Arc<Self>, inner: Vecta<U>) {
        if inner.token.is_cancelled() {
            self.fail(Error::Cancelled);
            return;
        }
        let concat = Arc::clone(self);
        inner.stream.run(
            Arc::clone(&self.token),
            Box::new(move |signal| match signal {
                Signal::Next(item) => {
                    let flow = lock(&concat.outlet).next(item);
                    if flow == Flow::Stop {
                        concat.stop();
                    }
                    flow
                }
                Signal::Error(e) => concat.fail(e),
                Signal::Complete => {
                    concat.inner_complete();
                    Flow::Stop
                }
            }),
        );
    }
}

/// Receives the signals of one [`Vecta`] subscription.
pub trait Subscriber<T>: Send + 'static {
    /// First signal, before any item. Cancelling here prevents evaluation.
    fn on_subscribe(&mut self, _subscription: &Subscription) {}

    fn on_next(&mut self, item: T);

    fn on_error(&mut self, error: Error);

    fn on_complete(&mut self);
}

struct FnSubscriber<N, E, C> {
    on_next: N,
    on_error: Option<E>,
    on_complete: Option<C>,
}

impl<T, N, E, C> Subscriber<T> for FnSubscriber<N, E, C>
where
    N: FnMut(T) + Send + 'static,
    E: FnOnce(Error) + Send + 'static,
    C: FnOnce() + Send + 'static,
{
    fn on_next(&mut self, item: T) {
        (self.on_next)(item)
    }

    fn on_error(&mut self, error: Error) {
        if let Some(on_error) = self.on_error.take() {
            on_error(error)
        }
    }

    fn on_complete(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete()
        }
    }
}

/// Asynchronous stream of items, evaluated lazily on subscription.
///
/// ```rust
/// use ordo::Vecta;
///
/// let evens = Vecta::from_iterable(1..=10)
///     .filter(|n| n % 2 == 0)
///     .transform(|n| n * 10)
///     .take(3)
///     .block_collect()?;
/// assert_eq!(evens, vec![20, 40, 60]);
/// # Ok::<(), ordo::Error>(())
/// ```
pub struct Vecta<T> {
    stream: Stream<T>,
    token: Arc<Token>,
}

impl<T: Send + 'static> Vecta<T> {
    fn with_stream(stream: Stream<T>) -> Self {
        Self {
            stream,
            token: Token::new(true),
        }
    }

    fn compose<U, F>(self, step: F) -> Vecta<U>
    where
        U: Send + 'static,
        F: FnOnce(Stream<T>, Arc<Token>, Downstream<U>) + Send + 'static,
    {
        let Vecta { stream, token } = self;
        Vecta {
            stream: Stream::Composed(Box::new(move |token, down| step(stream, token, down))),
            token,
        }
    }

    /// Emits every item of `items`, then completes.
    pub fn from_iterable<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::with_stream(Stream::Iter(Box::new(items.into_iter())))
    }

    /// Items pushed by `generator` at subscription time. Returning `Ok`
    /// completes the stream, `Err` fails it.
    pub fn from_generator<F>(generator: F) -> Self
    where
        F: FnOnce(&mut Emitter<T>) -> Result<()> + Send + 'static,
    {
        Self::with_stream(Stream::Deferred(Box::new(generator)))
    }

    pub fn just(item: T) -> Self {
        Self::from_iterable(Some(item))
    }

    /// Completes without items.
    pub fn empty() -> Self {
        Self::from_iterable(None)
    }

    pub fn failure(error: impl Into<BoxError>) -> Self {
        Self::with_stream(Stream::Failure(Error::failed(error)))
    }

    pub fn transform<U, F>(self, map: F) -> Vecta<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        self.compose(move |stream, token, down| {
            let mut outlet = Outlet::new(down);
            let mut map = map;
            stream.run(
                token,
                Box::new(move |signal| match signal {
                    Signal::Next(item) => match catch_panic(|| map(item)) {
                        Ok(mapped) => outlet.next(mapped),
                        Err(e) => outlet.error(e),
                    },
                    Signal::Error(e) => outlet.error(e),
                    Signal::Complete => outlet.complete(),
                }),
            )
        })
    }

    pub fn filter<F>(self, predicate: F) -> Self
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        self.compose(move |stream, token, down| {
            let mut outlet = Outlet::new(down);
            let mut predicate = predicate;
            stream.run(
                token,
                Box::new(move |signal| match signal {
                    Signal::Next(item) => match catch_panic(|| predicate(&item)) {
                        Ok(true) => outlet.next(item),
                        Ok(false) => Flow::Continue,
                        Err(e) => outlet.error(e),
                    },
                    terminal => outlet.signal(terminal),
                }),
            )
        })
    }

    /// First `count` items, then completes and stops upstream.
    pub fn take(self, count: usize) -> Self {
        self.compose(move |stream, token, down| {
            let mut outlet = Outlet::new(down);
            if count == 0 {
                if token.start() {
                    outlet.complete();
                }
                return;
            }

            let mut seen = 0;
            stream.run(
                token,
                Box::new(move |signal| match signal {
                    Signal::Next(item) => {
                        seen += 1;
                        match outlet.next(item) {
                            Flow::Continue if seen >= count => outlet.complete(),
                            flow => flow,
                        }
                    }
                    terminal => outlet.signal(terminal),
                }),
            )
        })
    }

    /// Maps each item to an inner stream and emits the inner streams one
    /// after another, in upstream order.
    ///
    /// Inner streams are chained by their completion, never by waiting on
    /// a thread: upstream items that arrive while an inner stream is still
    /// running are queued. An upstream or inner failure is forwarded as
    /// soon as it arrives.
    pub fn transform_to_vecta<U, F>(self, map: F) -> Vecta<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> Vecta<U> + Send + 'static,
    {
        self.compose(move |stream, token, down| {
            let concat = Concat::new(Arc::clone(&token), down);
            let mut map = map;
            stream.run(
                token,
                Box::new(move |signal| match signal {
                    Signal::Next(item) => match catch_panic(|| map(item)) {
                        Ok(inner) => concat.push(inner),
                        Err(e) => concat.fail(e),
                    },
                    Signal::Error(e) => concat.fail(e),
                    Signal::Complete => concat.upstream_complete(),
                }),
            )
        })
    }

    /// Runs this stream into `outlet`, forwarding everything.
    fn continue_into(self, token: Arc<Token>, mut outlet: Outlet<T>) {
        if self.token.is_cancelled() {
            outlet.error(Error::Cancelled);
            return;
        }
        self.stream
            .run(token, Box::new(move |signal| outlet.signal(signal)));
    }

    /// Peeks at each item.
    pub fn invoke<F>(self, consumer: F) -> Self
    where
        F: FnMut(&T) + Send + 'static,
    {
        self.compose(move |stream, token, down| {
            let mut outlet = Outlet::new(down);
            let mut consumer = consumer;
            stream.run(
                token,
                Box::new(move |signal| match signal {
                    Signal::Next(item) => match catch_panic(|| consumer(&item)) {
                        Ok(()) => outlet.next(item),
                        Err(e) => outlet.error(e),
                    },
                    terminal => outlet.signal(terminal),
                }),
            )
        })
    }

    /// Peeks at a failure.
    pub fn invoke_failure<F>(self, consumer: F) -> Self
    where
        F: FnOnce(&Error) + Send + 'static,
    {
        self.compose(move |stream, token, down| {
            let mut outlet = Outlet::new(down);
            let mut consumer = Some(consumer);
            stream.run(
                token,
                Box::new(move |signal| match signal {
                    Signal::Error(e) => match consumer.take().map(|c| catch_panic(|| c(&e))) {
                        Some(Err(panicked)) => outlet.error(panicked),
                        _ => outlet.error(e),
                    },
                    other => outlet.signal(other),
                }),
            )
        })
    }

    /// Replaces a failure with one final item, then completes.
    pub fn recover_with<F>(self, fallback: F) -> Self
    where
        F: FnOnce(Error) -> T + Send + 'static,
    {
        self.compose(move |stream, token, down| {
            let mut outlet = Outlet::new(down);
            let mut fallback = Some(fallback);
            stream.run(
                token,
                Box::new(move |signal| match signal {
                    Signal::Error(e) => match fallback.take() {
                        Some(f) => match catch_panic(|| f(e)) {
                            Ok(item) => match outlet.next(item) {
                                Flow::Continue => outlet.complete(),
                                Flow::Stop => Flow::Stop,
                            },
                            Err(panicked) => outlet.error(panicked),
                        },
                        None => outlet.error(e),
                    },
                    other => outlet.signal(other),
                }),
            )
        })
    }

    /// Switches to a fallback stream on failure.
    pub fn recover_with_vecta<F>(self, fallback: F) -> Self
    where
        F: FnOnce(Error) -> Vecta<T> + Send + 'static,
    {
        self.compose(move |stream, token, down| {
            let mut slot = Some(Outlet::new(down));
            let mut fallback = Some(fallback);
            let inner_token = Arc::clone(&token);
            stream.run(
                token,
                Box::new(move |signal| match signal {
                    Signal::Error(e) => {
                        if let (Some(mut outlet), Some(fallback)) = (slot.take(), fallback.take()) {
                            match catch_panic(|| fallback(e)) {
                                Ok(inner) => inner.continue_into(Arc::clone(&inner_token), outlet),
                                Err(panicked) => {
                                    outlet.error(panicked);
                                }
                            }
                        }
                        Flow::Stop
                    }
                    other => match slot.as_mut() {
                        Some(outlet) => outlet.signal(other),
                        None => Flow::Stop,
                    },
                }),
            )
        })
    }

    /// Gathers every item; fails with the first error.
    pub fn collect(self) -> Unum<Vec<T>> {
        let Vecta { stream, token } = self;
        Unum::from_step(
            token,
            Box::new(move |token, sink| {
                let mut items = Vec::new();
                let mut sink = Some(sink);
                stream.run(
                    token,
                    Box::new(move |signal| {
                        match signal {
                            Signal::Next(item) => {
                                items.push(item);
                                return Flow::Continue;
                            }
                            Signal::Error(e) => {
                                if let Some(sink) = sink.take() {
                                    sink(Err(e));
                                }
                            }
                            Signal::Complete => {
                                if let Some(sink) = sink.take() {
                                    sink(Ok(std::mem::take(&mut items)));
                                }
                            }
                        }
                        Flow::Stop
                    }),
                )
            }),
        )
    }

    /// The first item, or `None` for an empty stream. Stops upstream after
    /// one item.
    pub fn first(self) -> Unum<Option<T>> {
        let Vecta { stream, token } = self;
        Unum::from_step(
            token,
            Box::new(move |token, sink| {
                let mut sink = Some(sink);
                stream.run(
                    token,
                    Box::new(move |signal| {
                        if let Some(sink) = sink.take() {
                            match signal {
                                Signal::Next(item) => sink(Ok(Some(item))),
                                Signal::Error(e) => sink(Err(e)),
                                Signal::Complete => sink(Ok(None)),
                            }
                        }
                        Flow::Stop
                    }),
                )
            }),
        )
    }

    /// Evaluation and signal delivery happen on `scheduler`.
    pub fn run_on<S>(self, scheduler: Arc<S>) -> Self
    where
        S: Scheduler + ?Sized + 'static,
    {
        self.compose(move |stream, token, down| {
            hand_off(
                &*scheduler,
                (stream, token, down),
                |(stream, token, down)| stream.run(token, down),
                |(_, _, down), error| {
                    Outlet::new(down).error(error);
                },
            )
        })
    }

    /// Triggers evaluation and delivers signals to `subscriber`.
    pub fn subscribe<S>(self, subscriber: S) -> Subscription
    where
        S: Subscriber<T>,
    {
        let Vecta { stream, token } = self;
        let subscription = Subscription::new(Arc::clone(&token));

        let mut subscriber = subscriber;
        if catch_panic(|| subscriber.on_subscribe(&subscription)).is_err() {
            error!("vecta subscriber panicked in on_subscribe");
            token.cancel();
        }

        let guard = Arc::clone(&token);
        stream.run(
            token,
            Box::new(move |signal| {
                let delivered = match signal {
                    Signal::Next(item) => {
                        // A cancel from another thread can land after this
                        // check; that item is still delivered.
                        if !guard.is_live() {
                            return Flow::Stop;
                        }
                        catch_panic(|| subscriber.on_next(item))
                    }
                    Signal::Error(e) => {
                        if guard.terminate() {
                            catch_panic(|| subscriber.on_error(e))
                        } else {
                            Ok(())
                        }
                    }
                    Signal::Complete => {
                        if guard.terminate() {
                            catch_panic(|| subscriber.on_complete())
                        } else {
                            Ok(())
                        }
                    }
                };

                if delivered.is_err() {
                    error!("vecta subscriber panicked, cancelling");
                    guard.cancel();
                }
                if guard.is_live() {
                    Flow::Continue
                } else {
                    Flow::Stop
                }
            }),
        );
        subscription
    }

    /// Closure form of [`subscribe`](Self::subscribe).
    pub fn subscribe_with<N, E, C>(self, on_next: N, on_error: E, on_complete: C) -> Subscription
    where
        N: FnMut(T) + Send + 'static,
        E: FnOnce(Error) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.subscribe(FnSubscriber {
            on_next,
            on_error: Some(on_error),
            on_complete: Some(on_complete),
        })
    }

    /// Subscribes and blocks the calling thread for every item.
    pub fn block_collect(self) -> Result<Vec<T>> {
        self.collect().block()
    }
}

impl<T> Vecta<T> {
    /// Prevents evaluation, or stops a running stream at the next item.
    ///
    /// See [`Subscription`] for what a cancel from another thread can still
    /// let through.
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
