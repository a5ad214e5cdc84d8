//! Core module: lock-free bounded MPSC ring buffer
//!
//! Design principles:
//! - Lock-Free: atomic operations only, no Mutex/RwLock on the hot path
//! - No-Allocation: all slots pre-allocated at construction
//! - Backpressure by return value: a full buffer rejects, it never blocks

mod backoff;
mod ring_buffer;

pub use backoff::Backoff;
pub use ring_buffer::{Consumer, Producer, RingBuffer};
