//! Ordo - MPSC dispatch core with a minimal reactive pipeline
//!
//! Architecture:
//! - Lock-Free: bounded multi-producer / single-consumer ring buffer
//! - Never Drop: a full dispatch queue runs the task on the caller's thread
//! - Never Block the Drain: every task gets its own blocking-pool worker
//! - Lazy Pipelines: `Unum` / `Vecta` evaluate on subscription, on any `Scheduler`
//!
//! ```rust
//! use std::sync::Arc;
//! use ordo::{Dispatcher, Unum};
//!
//! let dispatcher = Arc::new(Dispatcher::with_capacity(1024)?);
//! let rows = Unum::from(|| vec!["alice", "bob"])
//!     .run_on(Arc::clone(&dispatcher))
//!     .transform(|rows| rows.len())
//!     .block()?;
//! assert_eq!(rows, 2);
//! # Ok::<(), ordo::Error>(())
//! ```

pub mod config;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod reactive;

pub use crate::config::{BackoffConfig, DispatcherConfig};
pub use crate::core::RingBuffer;
pub use crate::dispatch::{CompletionHandle, Dispatcher, StatsSnapshot};
pub use crate::error::{BoxError, Error, Result};
pub use crate::reactive::{Scheduler, Subscriber, Subscription, Unum, Vecta};
