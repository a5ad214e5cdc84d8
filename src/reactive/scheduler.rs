//! Where reactive evaluation runs.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crate::error::{Error, Result};

/// Opaque unit of work handed to a [`Scheduler`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Execution context for pipeline evaluation and callback delivery.
///
/// Implemented by [`Dispatcher`](crate::Dispatcher),
/// [`ImmediateScheduler`] and [`ThreadScheduler`].
pub trait Scheduler: Send + Sync {
    /// Runs `job` at some point. `Err` means it was refused and will never
    /// run.
    fn schedule(&self, job: Job) -> Result<()>;
}

/// Runs every job on the calling thread before returning.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
    fn schedule(&self, job: Job) -> Result<()> {
        job();
        Ok(())
    }
}

/// Spawns a fresh named OS thread per job.
#[derive(Debug, Clone)]
pub struct ThreadScheduler {
    name: String,
}

impl ThreadScheduler {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new("ordo-thread")
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, job: Job) -> Result<()> {
        thread::Builder::new()
            .name(self.name.clone())
            .spawn(job)
            .map(drop)
            .map_err(|e| Error::Runtime(e.to_string()))
    }
}

/// Schedules `run(payload)`; if the scheduler refuses, the payload comes
/// back through `reject` on the calling thread instead of being lost.
pub(crate) fn hand_off<S, P, R, F>(scheduler: &S, payload: P, run: R, reject: F)
where
    S: Scheduler + ?Sized,
    P: Send + 'static,
    R: FnOnce(P) + Send + 'static,
    F: FnOnce(P, Error),
{
    let slot = Arc::new(Mutex::new(Some(payload)));
    let job_slot = Arc::clone(&slot);

    let job: Job = Box::new(move || {
        if let Some(payload) = take(&job_slot) {
            run(payload);
        }
    });

    if let Err(error) = scheduler.schedule(job) {
        if let Some(payload) = take(&slot) {
            reject(payload, error);
        }
    }
}

fn take<P>(slot: &Mutex<Option<P>>) -> Option<P> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}
