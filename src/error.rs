//! Error types shared by the ring buffer, dispatcher and reactive pipeline.
//!
//! Errors are values: once captured they travel through completion handles
//! and terminal signals, never as unwinding across a thread boundary.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;

/// Boxed error produced by user computations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The primary error type of the crate.
///
/// `Clone` so a single failure can be handed to every observer of a
/// completion handle or subscription.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Ring buffer capacity was zero or not a power of two.
    #[error("capacity must be a positive power of two, got {0}")]
    InvalidCapacity(usize),

    /// Work was submitted to a dispatcher after `shutdown()`.
    #[error("executor is shut down")]
    Shutdown,

    /// The computation panicked while running.
    #[error("computation panicked: {0}")]
    Panicked(String),

    /// The task was dropped by its executor before it could run.
    #[error("task was abandoned before completion")]
    Abandoned,

    /// The subscription was cancelled before a result was produced.
    #[error("subscription was cancelled")]
    Cancelled,

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// The execution runtime could not be started.
    #[error("failed to start runtime: {0}")]
    Runtime(String),

    /// Failure raised by a user computation.
    #[error("{0}")]
    Failed(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Wraps any user error as [`Error::Failed`].
    ///
    /// Errors that already are an [`Error`] are passed through unchanged.
    pub fn failed(error: impl Into<BoxError>) -> Self {
        let boxed: BoxError = error.into();
        match boxed.downcast::<Error>() {
            Ok(own) => *own,
            Err(other) => Error::Failed(Arc::from(other)),
        }
    }

    /// Convenience for ad-hoc failures carrying only a message.
    pub fn msg(message: impl fmt::Display) -> Self {
        Error::failed(message.to_string())
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Error::Panicked(message)
    }
}

/// Runs `f`, turning a panic into [`Error::Panicked`].
pub(crate) fn catch_panic<R>(f: impl FnOnce() -> R) -> Result<R> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(Error::from_panic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_passes_own_errors_through() {
        let err = Error::failed(Error::Shutdown);
        assert!(matches!(err, Error::Shutdown));
    }

    #[test]
    fn test_failed_wraps_foreign_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = Error::failed(io);
        assert!(matches!(err, Error::Failed(_)));
        assert_eq!(err.to_string(), "disk gone");
    }

    #[test]
    fn test_panic_payload_message() {
        let err = Error::from_panic(Box::new("boom"));
        assert_eq!(err.to_string(), "computation panicked: boom");

        let err = Error::from_panic(Box::new(String::from("bang")));
        assert_eq!(err.to_string(), "computation panicked: bang");
    }

    #[test]
    fn test_catch_panic() {
        assert_eq!(catch_panic(|| 7).unwrap(), 7);
        let err = catch_panic(|| -> u32 { panic!("inside") }).unwrap_err();
        assert!(matches!(err, Error::Panicked(m) if m == "inside"));
    }
}
