//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge desired state to current state. Key concepts:
//!
//! - **Pass**: One invocation of a reconcile function for one key.
//! - **Action**: What the pass asks of the scheduler (wait for a change, or
//!   come back after a delay).
//! - **Backoff**: Per-key exponential delay for passes that failed.
//! - **Work queue**: De-duplicating queue that never hands the same key to
//!   two workers at once.
//!
//! # Invariants
//!
//! - A key is processed by at most one worker at a time
//! - A key is queued at most once, no matter how often it is added
//! - Backoff is reset as soon as a pass for the key succeeds

use std::time::Duration;

mod backoff;
mod queue;

pub use backoff::Backoff;
pub use queue::WorkQueue;

/// Delay used whenever convergence depends on an external system that gives
/// no notification (pending provisioning, asynchronous deletion, unknown
/// states).
pub const REQUEUE_PERIOD: Duration = Duration::from_secs(30);

/// Default first retry delay after a failed pass.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Default upper bound for retry delays.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);

/// Outcome of a successful reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Action {
    /// Run another pass after this delay, even without an external change.
    pub requeue_after: Option<Duration>,
}

impl Action {
    /// Nothing left to poll; wait for the next change notification.
    pub const fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Schedule another pass after `delay`.
    pub const fn requeue(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }

    /// Returns true if another pass was requested.
    pub fn is_requeue(&self) -> bool {
        self.requeue_after.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_constructors() {
        assert_eq!(Action::await_change(), Action::default());
        assert!(!Action::await_change().is_requeue());

        let action = Action::requeue(REQUEUE_PERIOD);
        assert!(action.is_requeue());
        assert_eq!(action.requeue_after, Some(Duration::from_secs(30)));
    }
}
