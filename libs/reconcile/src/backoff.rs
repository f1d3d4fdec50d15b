//! Per-key exponential backoff for failed reconciliation passes.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::{DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX};

/// Tracks consecutive failures per key and derives the next retry delay.
#[derive(Debug, Clone)]
pub struct Backoff<K> {
    /// Delay after the first failure.
    base: Duration,

    /// Upper bound for any delay.
    max: Duration,

    /// Tracked failures: key -> consecutive failure count.
    failures: BTreeMap<K, u32>,
}

impl<K: Ord + Clone> Backoff<K> {
    /// Create a new backoff tracker.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying.
    ///
    /// The delay doubles with every consecutive failure: `base * 2^(n-1)`,
    /// capped at `max`.
    pub fn next_delay(&mut self, key: &K) -> Duration {
        let count = self.failures.entry(key.clone()).or_insert(0);
        let exponent = (*count).min(31);
        *count = count.saturating_add(1);

        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Number of consecutive failures recorded for `key`.
    pub fn failures(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    /// Clear failure tracking for a key (on success).
    pub fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }

    /// Number of keys currently backing off.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Returns true if no key is backing off.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl<K: Ord + Clone> Default for Backoff<K> {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX)
    }
}
