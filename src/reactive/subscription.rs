//! One-shot subscription state shared by a pipeline and its subscriber.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::error;

const ACTIVE: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;
const TERMINATED: u8 = 3;

/// State token: `Active → Running → Terminated`, or `→ Cancelled`.
///
/// `Cancelled` and `Terminated` are final. Every transition is a CAS, so a
/// terminal state is reached at most once per subscription.
pub(crate) struct Token {
    state: AtomicU8,
    // Multi-value streams can be cancelled between items
    interruptible: bool,
}

impl Token {
    pub(crate) fn new(interruptible: bool) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(ACTIVE),
            interruptible,
        })
    }

    /// Marks evaluation as started. `false` when cancelled or finished,
    /// in which case the caller must not evaluate anything.
    pub(crate) fn start(&self) -> bool {
        match self
            .state
            .compare_exchange(ACTIVE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == RUNNING,
        }
    }

    pub(crate) fn cancel(&self) -> bool {
        if self
            .state
            .compare_exchange(ACTIVE, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return true;
        }
        self.interruptible
            && self
                .state
                .compare_exchange(RUNNING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Claims the single terminal transition. `false` when cancelled.
    pub(crate) fn terminate(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match current {
                ACTIVE | RUNNING => {
                    match self.state.compare_exchange(
                        current,
                        TERMINATED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return true,
                        Err(actual) => current = actual,
                    }
                }
                CANCELLED => return false,
                _ => {
                    error!("second terminal signal on one subscription");
                    debug_assert!(false, "double termination");
                    return false;
                }
            }
        }
    }

    #[inline]
    pub(crate) fn is_live(&self) -> bool {
        self.state.load(Ordering::Acquire) <= RUNNING
    }

    #[inline]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    #[inline]
    pub(crate) fn is_terminated(&self) -> bool {
        self.state.load(Ordering::Acquire) == TERMINATED
    }

    fn label(&self) -> &'static str {
        match self.state.load(Ordering::Acquire) {
            ACTIVE => "active",
            RUNNING => "running",
            CANCELLED => "cancelled",
            _ => "terminated",
        }
    }
}

/// Handle to in-flight reactive work.
///
/// Cancellation is cooperative: it always works before evaluation starts.
/// A running `Unum` cannot be interrupted; a running `Vecta` stops at the
/// next item boundary.
///
/// Cancelling from inside `on_next` stops delivery immediately. Cancelling
/// from another thread is not synchronized with delivery: an item whose
/// hand-over already passed the liveness check may still arrive after
/// `cancel` returns, at most one per delivering thread. No terminal signal
/// ever follows a successful cancel.
#[derive(Clone)]
pub struct Subscription {
    token: Arc<Token>,
}

impl Subscription {
    pub(crate) fn new(token: Arc<Token>) -> Self {
        Self { token }
    }

    /// Returns whether the cancellation took effect.
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

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("state", &self.token.label())
            .finish()
    }
}
