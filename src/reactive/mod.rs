//! Reactive module: lazy single-value and multi-value pipelines
//!
//! - `Unum<T>`: 0-or-1 result (success / failure)
//! - `Vecta<T>`: 0..n items, then error or completion
//! - Nothing runs until `subscribe`; `run_on` picks the execution context
//! - Exactly one terminal signal per subscription, none after cancel

mod scheduler;
mod subscription;
mod unum;
mod vecta;

pub use scheduler::{ImmediateScheduler, Job, Scheduler, ThreadScheduler};
pub use subscription::Subscription;
pub use unum::Unum;
pub use vecta::{Emitter, Subscriber, Vecta};
