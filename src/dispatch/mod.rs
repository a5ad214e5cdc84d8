//! Dispatch module: bounded admission queue in front of an execution pool
//!
//! - `Dispatcher`: multi-producer `execute`, single consumer drain loop
//! - `CompletionHandle`: one-shot result shared by submitter and worker
//! - Overload policy: inline execution on the caller, never drop, never block

mod completion;
mod dispatcher;
mod stats;
mod task;

pub use completion::CompletionHandle;
pub use dispatcher::Dispatcher;
pub use stats::{DispatcherStats, StatsSnapshot};
