//! Bounded-queue task dispatcher.
//!
//! Many callers submit through `execute` (multi-producer). One consumer
//! thread drains the admission ring and hands every task to its own
//! execution unit on the runtime's blocking pool, so a slow task never
//! holds up the drain. When the ring is full the task runs inline on the
//! caller's thread: nothing submitted is ever dropped.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info, warn};

use super::completion::CompletionHandle;
use super::stats::{DispatcherStats, StatsSnapshot};
use super::task::Task;
use crate::config::{DispatcherConfig, DEFAULT_QUEUE_CAPACITY};
use crate::core::{Consumer, Producer, RingBuffer};
use crate::error::{BoxError, Error, Result};
use crate::reactive::{Job, Scheduler};

/// Upper bound on tasks moved out of the ring per drain pass.
const DRAIN_BATCH: usize = 256;

/// State shared between the dispatcher and its consumer thread.
struct Control {
    shutdown: AtomicBool,
    // Callers between their shutdown check and their offer
    admitting: AtomicUsize,
    stats: Arc<DispatcherStats>,
}

/// Bounded-queue executor with inline fallback under overload.
///
/// ```rust,no_run
/// use ordo::Dispatcher;
///
/// let dispatcher = Dispatcher::with_capacity(1024)?;
/// let handle = dispatcher.execute(|| 40 + 2);
/// assert_eq!(handle.wait()?, 42);
/// # Ok::<(), ordo::Error>(())
/// ```
pub struct Dispatcher {
    producer: Producer<Task>,
    control: Arc<Control>,
    consumer: Option<JoinHandle<()>>,
    consumer_thread: Thread,
    runtime: Option<Runtime>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Starts a dispatcher and its consumer thread.
    ///
    /// # Errors
    /// [`Error::InvalidCapacity`] / [`Error::Config`] for a bad config,
    /// [`Error::Runtime`] when the execution pool cannot be built.
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        config.validate()?;

        if config.capacity > DEFAULT_QUEUE_CAPACITY {
            warn!(
                capacity = config.capacity,
                default = DEFAULT_QUEUE_CAPACITY,
                "oversized dispatch queue raises tail latency without raising throughput"
            );
        }

        let ring = RingBuffer::with_backoff(config.capacity, config.backoff)?;
        let (producer, consumer) = ring.split();

        // Only the blocking pool is used; a current-thread runtime keeps no
        // idle async worker around.
        let runtime = Builder::new_current_thread()
            .max_blocking_threads(config.max_threads)
            .thread_name("ordo-worker")
            .build()
            .map_err(|e| Error::Runtime(e.to_string()))?;

        let control = Arc::new(Control {
            shutdown: AtomicBool::new(false),
            admitting: AtomicUsize::new(0),
            stats: Arc::new(DispatcherStats::default()),
        });

        let join = {
            let control = Arc::clone(&control);
            let handle = runtime.handle().clone();
            let idle_wait = config.idle_wait;
            thread::Builder::new()
                .name("ordo-dispatch".into())
                .spawn(move || consume(consumer, control, handle, idle_wait))
                .map_err(|e| Error::Runtime(e.to_string()))?
        };
        let consumer_thread = join.thread().clone();

        info!(
            capacity = config.capacity,
            max_threads = config.max_threads,
            "dispatcher started"
        );

        Ok(Self {
            producer,
            control,
            consumer: Some(join),
            consumer_thread,
            runtime: Some(runtime),
            config,
        })
    }

    /// Default configuration with a different queue capacity.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Self::new(DispatcherConfig::default().capacity(capacity))
    }

    /// Submits an infallible computation.
    ///
    /// Never fails synchronously. A panic inside `computation` resolves the
    /// handle with [`Error::Panicked`].
    pub fn execute<T, F>(&self, computation: F) -> CompletionHandle<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(move || Ok(computation()))
    }

    /// Submits a fallible computation; its error becomes the handle's failure.
    pub fn try_execute<T, E, F>(&self, computation: F) -> CompletionHandle<T>
    where
        T: Send + Sync + 'static,
        E: Into<BoxError>,
        F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
    {
        self.submit(move || computation().map_err(Error::failed))
    }

    fn submit<T, F>(&self, computation: F) -> CompletionHandle<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let control = &self.control;
        control.stats.record_submit();

        // Announce before checking the flag; the consumer will not exit while
        // an admission is in progress.
        control.admitting.fetch_add(1, Ordering::SeqCst);
        if control.shutdown.load(Ordering::SeqCst) {
            control.admitting.fetch_sub(1, Ordering::SeqCst);
            control.stats.record_rejected();
            return CompletionHandle::failed(Error::Shutdown);
        }

        let (task, handle) = Task::new(computation, Arc::clone(&control.stats));
        let rejected = self.producer.try_offer(task).err();
        control.admitting.fetch_sub(1, Ordering::SeqCst);

        match rejected {
            None => control.stats.record_queued(),
            Some(task) => {
                control.stats.record_inline();
                debug!(
                    capacity = self.config.capacity,
                    "dispatch queue full, running inline"
                );
                task.run();
            }
        }

        handle
    }

    /// Stops admission. Queued tasks still run; later submissions fail with
    /// [`Error::Shutdown`]. Idempotent.
    pub fn shutdown(&self) {
        if !self.control.shutdown.swap(true, Ordering::SeqCst) {
            info!(queued = self.producer.size(), "dispatcher shutting down");
        }
        self.consumer_thread.unpark();
    }

    pub fn is_shutdown(&self) -> bool {
        self.control.shutdown.load(Ordering::SeqCst)
    }

    /// Tasks waiting in the admission queue (snapshot).
    pub fn queued(&self) -> usize {
        self.producer.size()
    }

    pub fn capacity(&self) -> usize {
        self.producer.capacity()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.control.stats.snapshot()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }
}

impl Scheduler for Dispatcher {
    fn schedule(&self, job: Job) -> Result<()> {
        let handle = self.execute(job);
        // Shutdown is the only failure known synchronously
        match handle.try_get() {
            Some(Err(Error::Shutdown)) => Err(Error::Shutdown),
            _ => Ok(()),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();

        if let Some(join) = self.consumer.take() {
            if join.join().is_err() {
                warn!("dispatch consumer thread panicked");
            }
        }

        if let Some(runtime) = self.runtime.take() {
            // Blocking for the grace period is not allowed from inside a runtime
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(self.config.shutdown_grace);
            }
        }
        info!("dispatcher stopped");
    }
}

/// Consumer loop: drain, fan out, idle-wait when empty.
fn consume(mut consumer: Consumer<Task>, control: Arc<Control>, handle: Handle, idle_wait: std::time::Duration) {
    let mut batch: Vec<Task> = Vec::with_capacity(DRAIN_BATCH);

    loop {
        let drained = consumer.poll_batch(&mut batch, DRAIN_BATCH);
        for task in batch.drain(..) {
            handle.spawn_blocking(move || task.run());
        }

        if drained == 0 {
            if control.shutdown.load(Ordering::SeqCst)
                && control.admitting.load(Ordering::SeqCst) == 0
                && consumer.is_empty()
            {
                break;
            }
            thread::park_timeout(idle_wait);
        }
    }

    debug!("dispatch consumer drained and exited");
}
